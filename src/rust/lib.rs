//! Teach an image classifier by example.
//!
//! Register named classes, add example images to each, train a k-nearest-neighbour
//! classifier over image embeddings, predict, and move the trained dataset between
//! sessions as JSON.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use teachable::{BuiltinModel, ClassDefinition, ImageSample, TeachableMachine};
//!
//! let machine = TeachableMachine::builder()
//!     .with_model(BuiltinModel::ClipVitB32)?
//!     .add_class(
//!         ClassDefinition::new("cat")
//!             .with_images(vec![ImageSample::from_path("cat1.jpg")?, ImageSample::from_path("cat2.jpg")?])
//!     )?
//!     .add_class(
//!         ClassDefinition::new("dog")
//!             .with_images(vec![ImageSample::from_path("dog1.jpg")?])
//!     )?
//!     .build()?;
//!
//! machine.train().await?;
//! let prediction = machine.predict(&ImageSample::from_path("mystery.jpg")?).await?;
//! println!("Predicted class: {}", prediction.label);
//!
//! machine.export_to_file("model.json")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Sharing
//!
//! `TeachableMachine` is `Send + Sync`; wrap it in an `Arc` to edit, train, and preview
//! from different tasks. Registry edits made after training put the machine back into
//! the untrained state until the next training pass.

pub mod classifier;
pub mod dataset;
pub mod model_manager;
pub mod models;
pub mod preview;
pub mod registry;
mod runtime;

pub use classifier::{
    ClassDefinition, ClassifierDataset, ClassifierError, ClassifierInfo, FeatureExtractor,
    KnnClassifier, MachineState, OnnxFeatureExtractor, Prediction, TeachableMachine,
    TeachableMachineBuilder,
};
pub use dataset::{ExportDocument, LEGACY_EMBEDDING_SIZE};
pub use model_manager::{ModelError, ModelManager};
pub use models::{BuiltinModel, ExtractorOptions, ModelCharacteristics, ModelInfo};
pub use preview::{
    CaptureDevice, CaptureStream, CaptureSurface, DeviceError, Frame, InputSource, Preview,
    PreviewTask, PreviewUpdate, ReplayCamera,
};
pub use registry::{ClassEntry, ClassRegistry, ImageSample};
pub use runtime::{create_session_builder, OptimizationLevel, RuntimeConfig};

pub fn init_logger() {
    env_logger::init();
}
