use std::io;

use crate::model_manager::ModelError;
use crate::preview::DeviceError;

/// Represents the different types of errors that can occur while teaching or querying the classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// No feature extractor has been loaded yet
    #[error("Not ready: {0}")]
    NotReady(String),
    /// Export or prediction was requested before a successful training pass
    #[error("Classifier is not trained; train or import a dataset first")]
    NotTrained,
    /// Another training pass holds the busy flag
    #[error("A training pass is already running")]
    TrainingInProgress,
    /// The registry changed while a training pass was running, so its result was dropped
    #[error("Training result discarded: state changed from version {started} to {current} while training")]
    StaleTraining { started: u64, current: u64 },
    /// Neither the registry nor the imported document holds a single example
    #[error("No training examples available")]
    NoExamples,
    /// Prediction needs at least two distinct labels to produce a meaningful distribution
    #[error("Insufficient classes: prediction needs at least 2 labels, found {found}")]
    InsufficientClasses { found: usize },
    /// Vector width does not match the width already stored
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Import document lacks a required top-level field
    #[error("Malformed document: {0}")]
    MalformedDocument(String),
    /// Import dataset cannot be reshaped into rows of the declared width
    #[error("Malformed dataset: {0}")]
    MalformedDataset(String),
    /// Import document's label list and dataset keys disagree
    #[error("Label mismatch: {0}")]
    LabelMismatch(String),
    #[error("Class index {index} out of range ({len} classes)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Class label '{0}' already exists")]
    DuplicateLabel(String),
    /// Error occurred due to invalid input parameters
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Error occurred while loading or running the embedding model
    #[error("Model error: {0}")]
    ModelError(String),
    /// Error occurred while decoding an image sample
    #[error("Image error: {0}")]
    ImageError(String),
    #[error("Capture device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Model download error: {0}")]
    Download(#[from] ModelError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ort::Error> for ClassifierError {
    fn from(err: ort::Error) -> Self {
        ClassifierError::ModelError(err.to_string())
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(err: image::ImageError) -> Self {
        ClassifierError::ImageError(err.to_string())
    }
}
