use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use ndarray::{Array1, ArrayView1};

use super::embedding::FeatureExtractor;
use super::error::ClassifierError;
use super::knn::{KnnClassifier, Prediction};
use super::ClassifierInfo;
use crate::dataset::ExportDocument;
use crate::registry::{ClassRegistry, ImageSample};

/// Lifecycle of the trained model.
///
/// `Untrained -> Training -> Trained`, back to `Untrained` on any registry edit, and
/// straight to `Trained` from anywhere on a successful import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Untrained,
    Training,
    /// The classifier matches the registry and may be exported or previewed
    Trained,
}

#[derive(Debug)]
struct Inner {
    registry: ClassRegistry,
    classifier: KnnClassifier,
    state: MachineState,
    /// Bumped on every state transition and registry edit
    version: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Clears the busy flag however a training pass ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ClassifierError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(ClassifierError::TrainingInProgress);
        }
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Leaves the `Training` state behind if a pass is dropped before it settles.
///
/// With no edit since the pass began the previous state comes back, since the old
/// classifier still matches the registry; otherwise the machine is `Untrained`.
struct TrainingPass<'a> {
    inner: &'a Mutex<Inner>,
    started: u64,
    prior: MachineState,
    settled: bool,
}

impl TrainingPass<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for TrainingPass<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state != MachineState::Training {
            return;
        }
        inner.state = if inner.version == self.started {
            self.prior
        } else {
            MachineState::Untrained
        };
        inner.bump();
        warn!("Training pass cancelled; state is now {:?}", inner.state);
    }
}

/// The whole teachable-machine state: class registry, trained classifier, and the state
/// machine tying them together.
///
/// Shared behind an `Arc`; every method takes `&self`. The internal lock is never held
/// across an `.await`, so edits and predictions stay responsive while a training pass runs.
pub struct TeachableMachine {
    extractor: Option<Arc<dyn FeatureExtractor>>,
    k: usize,
    frame_interval: Duration,
    inner: Mutex<Inner>,
    training: AtomicBool,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<TeachableMachine>();
    }
};

impl fmt::Debug for TeachableMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TeachableMachine")
            .field("has_extractor", &self.extractor.is_some())
            .field("k", &self.k)
            .field("state", &inner.state)
            .field("version", &inner.version)
            .field("classes", &inner.registry.labels())
            .finish()
    }
}

impl TeachableMachine {
    /// Creates a new builder for fluent construction
    pub fn builder() -> super::builder::TeachableMachineBuilder {
        super::builder::TeachableMachineBuilder::new()
    }

    pub(crate) fn new(
        extractor: Option<Arc<dyn FeatureExtractor>>,
        registry: ClassRegistry,
        k: usize,
        frame_interval: Duration,
    ) -> Self {
        Self {
            extractor,
            k,
            frame_interval,
            inner: Mutex::new(Inner {
                registry,
                classifier: KnnClassifier::new(),
                state: MachineState::Untrained,
                version: 0,
            }),
            training: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn extractor(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        self.extractor
            .clone()
            .ok_or_else(|| ClassifierError::NotReady("no feature extractor loaded".into()))
    }

    pub fn state(&self) -> MachineState {
        self.lock().state
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// True once a training pass or import has completed and no edit has happened since.
    pub fn is_exportable(&self) -> bool {
        self.state() == MachineState::Trained
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Acquire)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    pub fn labels(&self) -> Vec<String> {
        self.lock().registry.labels()
    }

    /// A copy of the registry. Image payloads are shared, not duplicated.
    pub fn registry(&self) -> ClassRegistry {
        self.lock().registry.clone()
    }

    /// Returns information about the machine's current state
    pub fn info(&self) -> ClassifierInfo {
        let inner = self.lock();
        ClassifierInfo {
            class_labels: inner.registry.labels(),
            image_counts: inner.registry.classes().iter().map(|c| c.images.len()).collect(),
            example_counts: inner.classifier.class_example_counts(),
            embedding_size: inner
                .classifier
                .dimension()
                .or_else(|| self.extractor.as_ref().map(|e| e.embedding_size())),
            k: self.k,
            state: inner.state,
            version: inner.version,
        }
    }

    /// Applies a registry edit. A trained machine drops back to `Untrained`: the trained
    /// examples still carry the old labels and must be rebuilt before export or preview.
    fn edit<R>(
        &self,
        op: impl FnOnce(&mut ClassRegistry) -> Result<R, ClassifierError>,
    ) -> Result<R, ClassifierError> {
        let mut inner = self.lock();
        let result = op(&mut inner.registry)?;
        if inner.state == MachineState::Trained {
            warn!("Class registry changed after training; retrain before exporting or previewing");
            inner.state = MachineState::Untrained;
        }
        inner.bump();
        Ok(result)
    }

    /// Appends a class with no images, returning its index.
    pub fn add_class(&self, initial_label: Option<&str>) -> Result<usize, ClassifierError> {
        self.edit(|registry| registry.add_class(initial_label))
    }

    pub fn rename_class(&self, index: usize, new_label: &str) -> Result<(), ClassifierError> {
        self.edit(|registry| registry.rename_class(index, new_label))
            .map(|old| debug!("Renamed class {} from '{}' to '{}'", index, old, new_label))
    }

    pub fn delete_class(&self, index: usize) -> Result<(), ClassifierError> {
        self.edit(|registry| registry.delete_class(index))
            .map(|removed| debug!("Deleted class '{}' with {} images", removed.label, removed.images.len()))
    }

    /// Appends images to a class, returning its new image count.
    pub fn add_images(&self, index: usize, images: Vec<ImageSample>) -> Result<usize, ClassifierError> {
        self.edit(|registry| registry.add_images(index, images))
    }

    /// Rebuilds the classifier from scratch out of every registered image.
    ///
    /// Images are embedded one at a time, in class order then image order. The pass works
    /// on a snapshot of the registry; if the registry is edited or a dataset imported
    /// before it finishes, the result is dropped with `StaleTraining`.
    ///
    /// # Errors
    /// - `NotReady` without a feature extractor
    /// - `TrainingInProgress` if another pass is running
    /// - `NoExamples` if no class has any image (state is left as it was)
    /// - any embedding error, after which the machine is `Untrained`
    ///
    /// Dropping the future mid-pass (a timeout, a lost `select!` branch) restores the
    /// state the machine had before the pass, unless the registry changed meanwhile.
    pub async fn train(&self) -> Result<(), ClassifierError> {
        let extractor = self.extractor()?;
        let _busy = BusyGuard::acquire(&self.training)?;

        let (snapshot, mut pass) = {
            let mut inner = self.lock();
            if inner.registry.total_images() == 0 {
                return Err(ClassifierError::NoExamples);
            }
            let prior = inner.state;
            inner.state = MachineState::Training;
            let started = inner.bump();
            let pass = TrainingPass {
                inner: &self.inner,
                started,
                prior,
                settled: false,
            };
            (inner.registry.clone(), pass)
        };
        let started = pass.started;
        info!(
            "Training on {} images across {} classes",
            snapshot.total_images(),
            snapshot.len()
        );

        let outcome = build_classifier(extractor, &snapshot).await;

        let mut inner = self.lock();
        pass.settle();
        if inner.version != started {
            if inner.state == MachineState::Training {
                inner.state = MachineState::Untrained;
            }
            let current = inner.bump();
            warn!("Discarding training result: state moved from version {} to {}", started, current);
            return Err(outcome.err().unwrap_or(ClassifierError::StaleTraining { started, current }));
        }

        match outcome {
            Ok(classifier) => {
                info!(
                    "Training complete: {} examples across {} classes",
                    classifier.num_examples(),
                    classifier.num_classes()
                );
                inner.classifier = classifier;
                inner.state = MachineState::Trained;
                inner.bump();
                Ok(())
            }
            Err(e) => {
                warn!("Training failed: {}", e);
                inner.state = MachineState::Untrained;
                inner.bump();
                Err(e)
            }
        }
    }

    /// Embeds `image` and predicts its label distribution.
    pub async fn predict(&self, image: &ImageSample) -> Result<Prediction, ClassifierError> {
        let extractor = self.extractor()?;
        self.require_trained()?;
        let embedding = embed_blocking(extractor, image.clone()).await?;
        self.predict_embedding(embedding.view())
    }

    /// Predicts from an embedding that was computed elsewhere.
    pub fn predict_embedding(&self, embedding: ArrayView1<f32>) -> Result<Prediction, ClassifierError> {
        let inner = self.lock();
        if inner.state != MachineState::Trained {
            return Err(ClassifierError::NotTrained);
        }
        inner.classifier.predict_class(embedding, self.k)
    }

    fn require_trained(&self) -> Result<(), ClassifierError> {
        if self.state() != MachineState::Trained {
            return Err(ClassifierError::NotTrained);
        }
        Ok(())
    }

    /// Snapshot of the trained dataset in its portable form.
    pub fn export(&self) -> Result<ExportDocument, ClassifierError> {
        let inner = self.lock();
        if inner.state != MachineState::Trained {
            return Err(ClassifierError::NotTrained);
        }
        let dimension = inner
            .classifier
            .dimension()
            .ok_or(ClassifierError::NoExamples)?;
        Ok(ExportDocument::from_dataset(
            inner.classifier.dataset(),
            inner.registry.labels(),
            dimension,
        ))
    }

    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<(), ClassifierError> {
        self.export()?.write_to_file(path)
    }

    /// Replaces the classifier and the registry with the contents of `document`.
    ///
    /// The registry gets the document's labels with empty image lists. Nothing changes
    /// unless the whole document is accepted.
    pub fn import(&self, document: &ExportDocument) -> Result<(), ClassifierError> {
        let dataset = document.to_dataset()?;
        if let Some(extractor) = &self.extractor {
            if extractor.embedding_size() != document.dimension {
                return Err(ClassifierError::DimensionMismatch {
                    expected: extractor.embedding_size(),
                    actual: document.dimension,
                });
            }
        }
        if dataset.is_empty() {
            return Err(ClassifierError::NoExamples);
        }

        let mut registry = ClassRegistry::new();
        registry.reset_to_labels(&document.class_labels)?;
        let mut classifier = KnnClassifier::new();
        classifier.set_dataset(dataset)?;

        let mut inner = self.lock();
        inner.registry = registry;
        inner.classifier = classifier;
        inner.state = MachineState::Trained;
        inner.bump();
        info!(
            "Imported {} examples across {} classes",
            inner.classifier.num_examples(),
            inner.registry.len()
        );
        Ok(())
    }

    pub fn import_json(&self, json: &str) -> Result<(), ClassifierError> {
        self.import(&ExportDocument::from_json(json)?)
    }

    pub fn import_from_file(&self, path: impl AsRef<Path>) -> Result<(), ClassifierError> {
        self.import(&ExportDocument::read_from_file(path)?)
    }
}

async fn embed_blocking(
    extractor: Arc<dyn FeatureExtractor>,
    image: ImageSample,
) -> Result<Array1<f32>, ClassifierError> {
    tokio::task::spawn_blocking(move || extractor.embed(&image))
        .await
        .map_err(|e| ClassifierError::ModelError(format!("Embedding task failed: {}", e)))?
}

async fn build_classifier(
    extractor: Arc<dyn FeatureExtractor>,
    registry: &ClassRegistry,
) -> Result<KnnClassifier, ClassifierError> {
    let mut classifier = KnnClassifier::new();
    for class in registry.classes() {
        for (i, image) in class.images.iter().enumerate() {
            let embedding = embed_blocking(Arc::clone(&extractor), image.clone())
                .await
                .map_err(|e| {
                    warn!("Failed to embed image {} of class '{}': {}", i + 1, class.label, e);
                    e
                })?;
            classifier.add_example(embedding.view(), &class.label)?;
        }
        debug!("Class '{}': {} examples", class.label, class.images.len());
    }
    Ok(classifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassDefinition;

    /// Embeds the first byte of the payload as a one-hot-ish vector.
    struct ByteExtractor;

    impl FeatureExtractor for ByteExtractor {
        fn embedding_size(&self) -> usize {
            4
        }

        fn embed(&self, image: &ImageSample) -> Result<Array1<f32>, ClassifierError> {
            let byte = *image
                .as_bytes()
                .first()
                .ok_or_else(|| ClassifierError::ImageError("empty image".into()))?;
            let mut v = Array1::from_elem(4, 0.01f32);
            v[(byte % 4) as usize] = 1.0;
            Ok(v)
        }
    }

    fn img(byte: u8) -> ImageSample {
        ImageSample::from_bytes(vec![byte])
    }

    fn machine() -> TeachableMachine {
        TeachableMachine::builder()
            .with_extractor(Arc::new(ByteExtractor))
            .unwrap()
            .add_class(ClassDefinition::new("zero").with_images(vec![img(0), img(4)]))
            .unwrap()
            .add_class(ClassDefinition::new("one").with_images(vec![img(1), img(5)]))
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_train_then_predict() {
        let machine = machine();
        assert_eq!(machine.state(), MachineState::Untrained);
        machine.train().await.unwrap();
        assert!(machine.is_exportable());
        let prediction = machine.predict(&img(8)).await.unwrap();
        assert_eq!(prediction.label, "zero");
    }

    #[tokio::test]
    async fn test_edit_invalidates_training() {
        let machine = machine();
        machine.train().await.unwrap();
        let before = machine.version();
        machine.rename_class(0, "nil").unwrap();
        assert_eq!(machine.state(), MachineState::Untrained);
        assert!(machine.version() > before);
        assert!(matches!(machine.export(), Err(ClassifierError::NotTrained)));
        assert!(matches!(machine.predict(&img(0)).await, Err(ClassifierError::NotTrained)));
    }

    #[tokio::test]
    async fn test_failed_edit_keeps_state() {
        let machine = machine();
        machine.train().await.unwrap();
        let version = machine.version();
        assert!(machine.delete_class(7).is_err());
        assert_eq!(machine.state(), MachineState::Trained);
        assert_eq!(machine.version(), version);
    }

    #[tokio::test]
    async fn test_train_without_extractor() {
        let machine = TeachableMachine::builder().build().unwrap();
        assert!(matches!(machine.train().await, Err(ClassifierError::NotReady(_))));
        assert!(matches!(machine.predict(&img(0)).await, Err(ClassifierError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_train_without_images() {
        let machine = TeachableMachine::builder()
            .with_extractor(Arc::new(ByteExtractor))
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(machine.train().await, Err(ClassifierError::NoExamples)));
        assert_eq!(machine.state(), MachineState::Untrained);
        assert!(!machine.is_training());
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_untrained() {
        let machine = machine();
        machine.add_images(1, vec![ImageSample::from_bytes(Vec::new())]).unwrap();
        assert!(matches!(machine.train().await, Err(ClassifierError::ImageError(_))));
        assert_eq!(machine.state(), MachineState::Untrained);
        assert!(!machine.is_training());
    }

    #[test]
    fn test_debug_lists_classes() {
        let text = format!("{:?}", machine());
        assert!(text.contains("zero"));
        assert!(text.contains("Untrained"));
    }
}
