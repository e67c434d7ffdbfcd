use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use super::embedding::{FeatureExtractor, OnnxFeatureExtractor};
use super::error::ClassifierError;
use super::knn::DEFAULT_K;
use super::machine::TeachableMachine;
use crate::preview::DEFAULT_FRAME_INTERVAL;
use crate::registry::{ClassRegistry, ImageSample};
use crate::{BuiltinModel, ExtractorOptions, ModelManager, RuntimeConfig};

/// Number of empty classes a machine starts with when none are given.
pub const DEFAULT_CLASS_COUNT: usize = 2;

/// Represents a class definition with a required label and optional starting images
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    /// The unique identifier for the class
    pub label: String,
    /// Encoded images registered for this class up front
    pub images: Vec<ImageSample>,
}

impl ClassDefinition {
    /// Creates a new class definition with no images
    ///
    /// # Example
    /// ```
    /// use teachable::ClassDefinition;
    ///
    /// let class = ClassDefinition::new("cat");
    /// assert!(class.images.is_empty());
    /// ```
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            images: Vec::new(),
        }
    }

    /// Adds images to the class definition
    pub fn with_images(mut self, images: Vec<ImageSample>) -> Self {
        self.images.extend(images);
        self
    }
}

/// A builder for constructing a TeachableMachine with a fluent interface.
#[derive(Default)]
pub struct TeachableMachineBuilder {
    extractor: Option<Arc<dyn FeatureExtractor>>,
    classes: Vec<ClassDefinition>,
    labels: HashSet<String>,
    k: Option<usize>,
    frame_interval: Option<Duration>,
    runtime_config: RuntimeConfig,
}

impl TeachableMachineBuilder {
    /// Creates a new empty builder with default configuration
    ///
    /// # Example
    /// ```
    /// use teachable::TeachableMachineBuilder;
    ///
    /// let machine = TeachableMachineBuilder::new().build().unwrap();
    /// assert_eq!(machine.labels(), vec!["Class 1", "Class 2"]);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the runtime configuration used when an ONNX model is loaded afterwards
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    /// Uses a built-in model from the local cache as the feature extractor
    ///
    /// # Errors
    /// - `ModelError` if an extractor is already set
    /// - `Download` if the model has not been downloaded yet
    /// - `ModelError` if the model fails to load
    pub fn with_model(self, model: BuiltinModel) -> Result<Self, ClassifierError> {
        let manager = ModelManager::new_default()?;
        let path = manager.require_model(model)?;
        info!("Loading built-in model {:?} from {:?}", model, path);
        self.load_onnx(&path.to_string_lossy(), model.extractor_options())
    }

    /// Uses the ONNX model at `model_path` as the feature extractor, reading its first
    /// output from ImageNet-normalized 224x224 input
    pub fn with_custom_model(self, model_path: &str) -> Result<Self, ClassifierError> {
        self.load_onnx(model_path, ExtractorOptions::default())
    }

    /// Like [`with_custom_model`](Self::with_custom_model), with explicit preprocessing
    /// and output selection
    pub fn with_custom_model_options(
        self,
        model_path: &str,
        options: ExtractorOptions,
    ) -> Result<Self, ClassifierError> {
        self.load_onnx(model_path, options)
    }

    fn load_onnx(self, model_path: &str, options: ExtractorOptions) -> Result<Self, ClassifierError> {
        if model_path.is_empty() {
            return Err(ClassifierError::ModelError("Model path cannot be empty".to_string()));
        }
        if self.extractor.is_some() {
            return Err(ClassifierError::ModelError("Feature extractor already set".to_string()));
        }
        let extractor =
            OnnxFeatureExtractor::from_file_with_options(model_path, &self.runtime_config, options)?;
        self.with_extractor(Arc::new(extractor))
    }

    /// Uses any feature extractor implementation
    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Result<Self, ClassifierError> {
        if self.extractor.is_some() {
            return Err(ClassifierError::ModelError("Feature extractor already set".to_string()));
        }
        if extractor.embedding_size() == 0 {
            return Err(ClassifierError::ModelError("Feature extractor reports zero embedding size".to_string()));
        }
        self.extractor = Some(extractor);
        Ok(self)
    }

    /// Number of nearest neighbours that vote on each prediction (default 3)
    pub fn with_k(mut self, k: usize) -> Result<Self, ClassifierError> {
        if k == 0 {
            return Err(ClassifierError::ValidationError("k must be at least 1".into()));
        }
        self.k = Some(k);
        Ok(self)
    }

    /// Delay between frames in the live preview loop (default 16ms)
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Registers a class, optionally with starting images
    ///
    /// # Errors
    /// - `ValidationError` if the label is empty
    /// - `DuplicateLabel` if a class with the same label was already added
    pub fn add_class(mut self, class: ClassDefinition) -> Result<Self, ClassifierError> {
        if class.label.trim().is_empty() {
            return Err(ClassifierError::ValidationError("Class label cannot be empty".into()));
        }
        if !self.labels.insert(class.label.clone()) {
            return Err(ClassifierError::DuplicateLabel(class.label));
        }
        self.classes.push(class);
        Ok(self)
    }

    /// Builds an untrained machine. Without any classes it starts with two empty
    /// default-named ones.
    pub fn build(self) -> Result<TeachableMachine, ClassifierError> {
        let registry = if self.classes.is_empty() {
            ClassRegistry::with_default_classes(DEFAULT_CLASS_COUNT)
        } else {
            let mut registry = ClassRegistry::new();
            for class in self.classes {
                let index = registry.add_class(Some(&class.label))?;
                registry.add_images(index, class.images)?;
            }
            registry
        };

        Ok(TeachableMachine::new(
            self.extractor,
            registry,
            self.k.unwrap_or(DEFAULT_K),
            self.frame_interval.unwrap_or(DEFAULT_FRAME_INTERVAL),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_label_rejected() {
        let result = TeachableMachineBuilder::new().add_class(ClassDefinition::new(""));
        assert!(matches!(result, Err(ClassifierError::ValidationError(_))));
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let result = TeachableMachineBuilder::new()
            .add_class(ClassDefinition::new("cat"))
            .and_then(|b| b.add_class(ClassDefinition::new("cat")));
        assert!(matches!(result, Err(ClassifierError::DuplicateLabel(_))));
    }

    #[test]
    fn test_zero_k_rejected() {
        assert!(TeachableMachineBuilder::new().with_k(0).is_err());
    }

    #[test]
    fn test_classes_keep_order_and_images() {
        let machine = TeachableMachineBuilder::new()
            .add_class(ClassDefinition::new("b").with_images(vec![ImageSample::from_bytes(vec![1])]))
            .unwrap()
            .add_class(ClassDefinition::new("a"))
            .unwrap()
            .build()
            .unwrap();
        let info = machine.info();
        assert_eq!(info.class_labels, vec!["b", "a"]);
        assert_eq!(info.image_counts, vec![1, 0]);
        assert_eq!(info.k, DEFAULT_K);
    }

    #[test]
    fn test_custom_model_missing_file() {
        let result = TeachableMachineBuilder::new().with_custom_model("/nonexistent/model.onnx");
        assert!(matches!(result, Err(ClassifierError::ModelError(_))));
    }
}
