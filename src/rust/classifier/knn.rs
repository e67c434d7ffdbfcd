use std::collections::{BTreeMap, HashMap};

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Serialize;

use super::error::ClassifierError;
use super::utils::{normalize_vector, top_k_indices};

/// Labeled example vectors, one row per example, keyed by class label.
pub type ClassifierDataset = BTreeMap<String, Array2<f32>>;

/// Number of neighbours that vote when no `k` is configured.
pub const DEFAULT_K: usize = 3;

/// Outcome of a single prediction.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    /// The label with the highest confidence
    pub label: String,
    /// Share of the `k` nearest neighbours held by each label; sums to 1
    pub confidences: HashMap<String, f32>,
}

/// k-nearest-neighbour classifier over embedding vectors.
///
/// Examples are kept exactly as added so they can be exported bit for bit; an
/// L2-normalized copy backs the cosine-similarity search.
#[derive(Debug, Clone, Default)]
pub struct KnnClassifier {
    dimension: Option<usize>,
    raw: ClassifierDataset,
    normalized: ClassifierDataset,
}

impl KnnClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Width of the stored vectors, fixed by the first example added.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn num_classes(&self) -> usize {
        self.raw.len()
    }

    pub fn num_examples(&self) -> usize {
        self.raw.values().map(|m| m.nrows()).sum()
    }

    pub fn class_example_counts(&self) -> BTreeMap<String, usize> {
        self.raw
            .iter()
            .map(|(label, m)| (label.clone(), m.nrows()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn add_example(&mut self, example: ArrayView1<f32>, label: &str) -> Result<(), ClassifierError> {
        if label.is_empty() {
            return Err(ClassifierError::ValidationError("Example label cannot be empty".into()));
        }
        if example.is_empty() {
            return Err(ClassifierError::ValidationError("Example vector cannot be empty".into()));
        }
        if example.iter().any(|x| !x.is_finite()) {
            return Err(ClassifierError::ValidationError(
                format!("Example for '{}' contains non-finite values", label)
            ));
        }
        let dim = *self.dimension.get_or_insert(example.len());
        if example.len() != dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                actual: example.len(),
            });
        }

        let normalized = normalize_vector(example);
        let shape_err = |e: ndarray::ShapeError| ClassifierError::ModelError(e.to_string());
        self.raw
            .entry(label.to_string())
            .or_insert_with(|| Array2::zeros((0, dim)))
            .push_row(example)
            .map_err(shape_err)?;
        self.normalized
            .entry(label.to_string())
            .or_insert_with(|| Array2::zeros((0, dim)))
            .push_row(normalized.view())
            .map_err(shape_err)?;
        Ok(())
    }

    pub fn clear_class(&mut self, label: &str) -> bool {
        let removed = self.raw.remove(label).is_some();
        self.normalized.remove(label);
        if self.raw.is_empty() {
            self.dimension = None;
        }
        removed
    }

    pub fn clear_all_classes(&mut self) {
        self.raw.clear();
        self.normalized.clear();
        self.dimension = None;
    }

    /// The stored examples, unnormalized.
    pub fn dataset(&self) -> &ClassifierDataset {
        &self.raw
    }

    /// Replaces every stored example with `dataset`.
    ///
    /// All matrices must share one non-zero width and hold finite values; on error the
    /// classifier is left untouched.
    pub fn set_dataset(&mut self, dataset: ClassifierDataset) -> Result<(), ClassifierError> {
        let dataset: ClassifierDataset = dataset
            .into_iter()
            .filter(|(_, matrix)| matrix.nrows() > 0)
            .collect();
        let mut dimension = None;
        for (label, matrix) in &dataset {
            if label.is_empty() {
                return Err(ClassifierError::ValidationError("Dataset label cannot be empty".into()));
            }
            let width = matrix.ncols();
            let expected = *dimension.get_or_insert(width);
            if width == 0 {
                return Err(ClassifierError::MalformedDataset(
                    format!("Class '{}' has zero-width examples", label)
                ));
            }
            if width != expected {
                return Err(ClassifierError::DimensionMismatch { expected, actual: width });
            }
            if matrix.iter().any(|x| !x.is_finite()) {
                return Err(ClassifierError::MalformedDataset(
                    format!("Class '{}' contains non-finite values", label)
                ));
            }
        }

        let normalized = dataset
            .iter()
            .map(|(label, matrix)| {
                let mut rows = matrix.clone();
                for mut row in rows.axis_iter_mut(Axis(0)) {
                    let unit = normalize_vector(row.view());
                    row.assign(&unit);
                }
                (label.clone(), rows)
            })
            .collect();

        self.dimension = dimension;
        self.raw = dataset;
        self.normalized = normalized;
        Ok(())
    }

    /// Predicts a label distribution for `query` from its `k` nearest stored examples.
    ///
    /// Similarity is cosine. Every stored label appears in the distribution; a label
    /// with no votes gets 0. Ties go to the label owning the most similar example.
    pub fn predict_class(&self, query: ArrayView1<f32>, k: usize) -> Result<Prediction, ClassifierError> {
        if k == 0 {
            return Err(ClassifierError::ValidationError("k must be at least 1".into()));
        }
        if self.raw.len() < 2 {
            return Err(ClassifierError::InsufficientClasses { found: self.raw.len() });
        }
        let dim = self.dimension.unwrap_or(0);
        if query.len() != dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(ClassifierError::ValidationError(
                "Query vector contains non-finite values".into(),
            ));
        }

        let query = normalize_vector(query);
        let labels: Vec<&String> = self.normalized.keys().collect();
        let mut owners = Vec::with_capacity(self.num_examples());
        let mut scores = Vec::with_capacity(self.num_examples());
        for (class_idx, matrix) in self.normalized.values().enumerate() {
            let similarities: Array1<f32> = matrix.dot(&query);
            owners.extend(std::iter::repeat(class_idx).take(similarities.len()));
            scores.extend(similarities.iter().copied());
        }

        let k_eff = k.min(scores.len());
        let nearest = top_k_indices(&scores, k_eff);

        let mut votes = vec![0usize; labels.len()];
        let mut first_rank = vec![usize::MAX; labels.len()];
        for (rank, &idx) in nearest.iter().enumerate() {
            let owner = owners[idx];
            votes[owner] += 1;
            first_rank[owner] = first_rank[owner].min(rank);
        }

        let best = (0..labels.len())
            .max_by(|&a, &b| votes[a].cmp(&votes[b]).then(first_rank[b].cmp(&first_rank[a])))
            .unwrap_or(0);

        let confidences = labels
            .iter()
            .zip(&votes)
            .map(|(label, &v)| ((*label).clone(), v as f32 / k_eff as f32))
            .collect();

        debug!("kNN votes (k={}): {:?}", k_eff, votes);
        Ok(Prediction {
            label: labels[best].clone(),
            confidences,
        })
    }
}
