//! Portable JSON form of a trained classifier.
//!
//! ```json
//! { "dataset": { "cat": [0.1, ...], "dog": [...] }, "classLabels": ["cat", "dog"], "dimension": 1024 }
//! ```
//!
//! Each label's examples are flattened row-major into one array of length
//! `examples * dimension`. Only embeddings travel; the images they came from do not.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use log::{info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::classifier::{ClassifierDataset, ClassifierError};

/// Width assumed for documents written before `dimension` was recorded.
pub const LEGACY_EMBEDDING_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub dataset: BTreeMap<String, Vec<f32>>,
    pub class_labels: Vec<String>,
    pub dimension: usize,
}

/// Wire shape before validation. Every field may be missing.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    dataset: Option<BTreeMap<String, Vec<f32>>>,
    class_labels: Option<Vec<String>>,
    dimension: Option<usize>,
}

impl ExportDocument {
    /// Flattens `dataset` and pairs it with the registry's ordered labels.
    pub fn from_dataset(
        dataset: &ClassifierDataset,
        class_labels: Vec<String>,
        dimension: usize,
    ) -> Self {
        let dataset = dataset
            .iter()
            .map(|(label, matrix)| (label.clone(), matrix.iter().copied().collect()))
            .collect();
        Self {
            dataset,
            class_labels,
            dimension,
        }
    }

    pub fn num_examples(&self) -> usize {
        if self.dimension == 0 {
            return 0;
        }
        self.dataset.values().map(|v| v.len() / self.dimension).sum()
    }

    /// Checks that the document can be installed as-is.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.dimension == 0 {
            return Err(ClassifierError::MalformedDataset("dimension must be positive".into()));
        }
        for (label, values) in &self.dataset {
            if values.len() % self.dimension != 0 {
                return Err(ClassifierError::MalformedDataset(format!(
                    "class '{}' has {} values, not a multiple of dimension {}",
                    label,
                    values.len(),
                    self.dimension
                )));
            }
        }

        let mut seen = HashSet::new();
        for label in &self.class_labels {
            if label.trim().is_empty() {
                return Err(ClassifierError::LabelMismatch("classLabels contains an empty label".into()));
            }
            if !seen.insert(label.as_str()) {
                return Err(ClassifierError::LabelMismatch(format!(
                    "classLabels lists '{}' more than once",
                    label
                )));
            }
        }
        if let Some(orphan) = self.dataset.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(ClassifierError::LabelMismatch(format!(
                "dataset has examples for '{}' which classLabels does not list",
                orphan
            )));
        }
        Ok(())
    }

    /// Rebuilds the per-label example matrices. Labels with no values are left out.
    pub fn to_dataset(&self) -> Result<ClassifierDataset, ClassifierError> {
        self.validate()?;
        let mut dataset = ClassifierDataset::new();
        for (label, values) in &self.dataset {
            if values.is_empty() {
                continue;
            }
            let rows = values.len() / self.dimension;
            let matrix = Array2::from_shape_vec((rows, self.dimension), values.clone())
                .map_err(|e| ClassifierError::MalformedDataset(e.to_string()))?;
            dataset.insert(label.clone(), matrix);
        }
        Ok(dataset)
    }

    pub fn to_json(&self) -> Result<String, ClassifierError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates a document. `dataset` and `classLabels` are required;
    /// a missing `dimension` means the legacy width.
    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let raw: RawDocument = serde_json::from_str(json)?;
        let dataset = raw
            .dataset
            .ok_or_else(|| ClassifierError::MalformedDocument("missing 'dataset' field".into()))?;
        let class_labels = raw
            .class_labels
            .ok_or_else(|| ClassifierError::MalformedDocument("missing 'classLabels' field".into()))?;
        let dimension = raw.dimension.unwrap_or_else(|| {
            warn!(
                "Document has no 'dimension' field, assuming legacy width {}",
                LEGACY_EMBEDDING_SIZE
            );
            LEGACY_EMBEDDING_SIZE
        });

        let document = Self {
            dataset,
            class_labels,
            dimension,
        };
        document.validate()?;
        Ok(document)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ClassifierError> {
        let json = self.to_json()?;
        fs::write(path.as_ref(), json)?;
        info!(
            "Exported {} examples across {} classes to {:?}",
            self.num_examples(),
            self.class_labels.len(),
            path.as_ref()
        );
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let json = fs::read_to_string(path.as_ref())?;
        let document = Self::from_json(&json)?;
        info!(
            "Read {} examples across {} classes from {:?}",
            document.num_examples(),
            document.class_labels.len(),
            path.as_ref()
        );
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_flatten_is_row_major() {
        let mut dataset = ClassifierDataset::new();
        dataset.insert("a".into(), array![[1.0f32, 2.0], [3.0, 4.0]]);
        let doc = ExportDocument::from_dataset(&dataset, vec!["a".into()], 2);
        assert_eq!(doc.dataset["a"], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(doc.num_examples(), 2);
    }

    #[test]
    fn test_json_uses_class_labels_key() {
        let doc = ExportDocument {
            dataset: BTreeMap::new(),
            class_labels: vec!["cat".into()],
            dimension: 4,
        };
        let json = doc.to_json().unwrap();
        assert!(json.contains("\"classLabels\""));
        assert!(json.contains("\"dimension\":4"));
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(
            ExportDocument::from_json(r#"{"classLabels": []}"#),
            Err(ClassifierError::MalformedDocument(_))
        ));
        assert!(matches!(
            ExportDocument::from_json(r#"{"dataset": {}}"#),
            Err(ClassifierError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        assert!(matches!(
            ExportDocument::from_json("{not json"),
            Err(ClassifierError::Serialization(_))
        ));
    }

    #[test]
    fn test_missing_dimension_defaults_to_legacy_width() {
        let values = vec![0.5f32; LEGACY_EMBEDDING_SIZE * 2];
        let json = serde_json::json!({ "dataset": { "a": values }, "classLabels": ["a"] }).to_string();
        let doc = ExportDocument::from_json(&json).unwrap();
        assert_eq!(doc.dimension, LEGACY_EMBEDDING_SIZE);
        assert_eq!(doc.to_dataset().unwrap()["a"].nrows(), 2);
    }

    #[test]
    fn test_length_not_multiple_of_dimension() {
        let json = r#"{"dataset": {"a": [1, 2, 3]}, "classLabels": ["a"], "dimension": 2}"#;
        assert!(matches!(
            ExportDocument::from_json(json),
            Err(ClassifierError::MalformedDataset(_))
        ));
    }

    #[test]
    fn test_legacy_length_not_multiple_of_1024() {
        let values = vec![0.0f32; 1000];
        let json = serde_json::json!({ "dataset": { "a": values }, "classLabels": ["a"] }).to_string();
        assert!(matches!(
            ExportDocument::from_json(&json),
            Err(ClassifierError::MalformedDataset(_))
        ));
    }

    #[test]
    fn test_zero_dimension() {
        let json = r#"{"dataset": {}, "classLabels": [], "dimension": 0}"#;
        assert!(matches!(
            ExportDocument::from_json(json),
            Err(ClassifierError::MalformedDataset(_))
        ));
    }

    #[test]
    fn test_orphan_dataset_key() {
        let json = r#"{"dataset": {"a": [1, 2]}, "classLabels": ["b"], "dimension": 2}"#;
        assert!(matches!(
            ExportDocument::from_json(json),
            Err(ClassifierError::LabelMismatch(_))
        ));
    }

    #[test]
    fn test_duplicate_class_labels() {
        let json = r#"{"dataset": {}, "classLabels": ["a", "a"], "dimension": 2}"#;
        assert!(matches!(
            ExportDocument::from_json(json),
            Err(ClassifierError::LabelMismatch(_))
        ));
    }

    #[test]
    fn test_label_without_examples_is_allowed() {
        let json = r#"{"dataset": {"a": [1, 2], "b": []}, "classLabels": ["a", "b", "c"], "dimension": 2}"#;
        let doc = ExportDocument::from_json(json).unwrap();
        let dataset = doc.to_dataset().unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(doc.class_labels, vec!["a", "b", "c"]);
    }
}
