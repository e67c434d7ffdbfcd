use std::collections::BTreeMap;

mod error;
mod embedding;
mod knn;
mod machine;
pub mod builder;
mod utils;

pub use error::ClassifierError;
pub use embedding::{FeatureExtractor, OnnxFeatureExtractor};
pub use knn::{ClassifierDataset, KnnClassifier, Prediction, DEFAULT_K};
pub use machine::{MachineState, TeachableMachine};
pub use builder::{ClassDefinition, TeachableMachineBuilder};

/// Information about the current state and configuration of a teachable machine
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierInfo {
    /// Labels of the registered classes, in display order
    pub class_labels: Vec<String>,
    /// Images registered per class, in display order
    pub image_counts: Vec<usize>,
    /// Trained examples per label currently held by the classifier
    pub example_counts: BTreeMap<String, usize>,
    /// Size of the embedding vectors, once known
    pub embedding_size: Option<usize>,
    /// Neighbours consulted per prediction
    pub k: usize,
    pub state: MachineState,
    pub version: u64,
}
