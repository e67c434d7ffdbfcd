//! Class/image registry: the ordered list of classes a user is teaching, each holding the
//! raw images captured or uploaded for it.
//!
//! Images are kept encoded. They are only decoded and embedded when a training pass runs.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use image::DynamicImage;
use log::debug;

use crate::classifier::ClassifierError;

/// An encoded image (PNG, JPEG, ...) supplied for a class or for a single prediction.
///
/// The payload is shared, so cloning a sample or a whole registry snapshot is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSample {
    bytes: Arc<[u8]>,
}

impl ImageSample {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let bytes = std::fs::read(path.as_ref())?;
        debug!("Read {} bytes from {:?}", bytes.len(), path.as_ref());
        Ok(Self::from_bytes(bytes))
    }

    /// Parses a `data:<mime>;base64,<payload>` URL, the form browsers hand out for
    /// file reads and canvas captures.
    pub fn from_data_url(url: &str) -> Result<Self, ClassifierError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| ClassifierError::ValidationError("Data URL must start with 'data:'".into()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| ClassifierError::ValidationError("Data URL has no payload".into()))?;
        if !meta.ends_with(";base64") {
            return Err(ClassifierError::ValidationError(
                "Only base64 data URLs are supported".into(),
            ));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| ClassifierError::ValidationError(format!("Failed to decode base64: {}", e)))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_data_url(&self, mime: &str) -> String {
        format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes the payload into pixels.
    pub fn decode(&self) -> Result<DynamicImage, ClassifierError> {
        Ok(image::load_from_memory(&self.bytes)?)
    }
}

/// A class label together with the images registered under it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassEntry {
    pub label: String,
    pub images: Vec<ImageSample>,
}

/// Ordered classes, unique labels.
///
/// Labels and image lists are stored as pairs, so the two can never drift apart in length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassRegistry {
    classes: Vec<ClassEntry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with `n` empty, default-named classes.
    pub fn with_default_classes(n: usize) -> Self {
        let mut registry = Self::new();
        for _ in 0..n {
            let label = registry.next_default_label();
            registry.classes.push(ClassEntry {
                label,
                images: Vec::new(),
            });
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[ClassEntry] {
        &self.classes
    }

    pub fn labels(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.label.clone()).collect()
    }

    pub fn images(&self, index: usize) -> Result<&[ImageSample], ClassifierError> {
        self.check_index(index)?;
        Ok(&self.classes[index].images)
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.label == label)
    }

    pub fn total_images(&self) -> usize {
        self.classes.iter().map(|c| c.images.len()).sum()
    }

    /// Appends a class with no images. Without a label, picks the first free `Class N`.
    ///
    /// Returns the index of the new class.
    pub fn add_class(&mut self, initial_label: Option<&str>) -> Result<usize, ClassifierError> {
        let label = match initial_label {
            Some(label) => {
                self.validate_new_label(label)?;
                label.to_string()
            }
            None => self.next_default_label(),
        };
        self.classes.push(ClassEntry {
            label,
            images: Vec::new(),
        });
        Ok(self.classes.len() - 1)
    }

    /// Returns the label that was replaced.
    pub fn rename_class(&mut self, index: usize, new_label: &str) -> Result<String, ClassifierError> {
        self.check_index(index)?;
        if self.classes[index].label == new_label {
            return Ok(new_label.to_string());
        }
        self.validate_new_label(new_label)?;
        Ok(std::mem::replace(
            &mut self.classes[index].label,
            new_label.to_string(),
        ))
    }

    pub fn delete_class(&mut self, index: usize) -> Result<ClassEntry, ClassifierError> {
        self.check_index(index)?;
        Ok(self.classes.remove(index))
    }

    pub fn add_images(
        &mut self,
        index: usize,
        images: impl IntoIterator<Item = ImageSample>,
    ) -> Result<usize, ClassifierError> {
        self.check_index(index)?;
        let entry = &mut self.classes[index];
        entry.images.extend(images);
        Ok(entry.images.len())
    }

    /// Replaces every class with the given labels and empty image lists.
    pub fn reset_to_labels(&mut self, labels: &[String]) -> Result<(), ClassifierError> {
        let mut fresh = Self::new();
        for label in labels {
            fresh.add_class(Some(label))?;
        }
        *self = fresh;
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), ClassifierError> {
        if index >= self.classes.len() {
            return Err(ClassifierError::IndexOutOfRange {
                index,
                len: self.classes.len(),
            });
        }
        Ok(())
    }

    fn validate_new_label(&self, label: &str) -> Result<(), ClassifierError> {
        if label.trim().is_empty() {
            return Err(ClassifierError::ValidationError("Class label cannot be empty".into()));
        }
        if self.position(label).is_some() {
            return Err(ClassifierError::DuplicateLabel(label.to_string()));
        }
        Ok(())
    }

    fn next_default_label(&self) -> String {
        (1..)
            .map(|n| format!("Class {}", n))
            .find(|label| self.position(label).is_none())
            .unwrap_or_default()
    }
}
