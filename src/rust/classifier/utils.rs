use ndarray::{Array1, ArrayView1};

pub(crate) fn normalize_vector(vec: ArrayView1<f32>) -> Array1<f32> {
    let norm: f32 = vec.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        vec.mapv(|x| x / norm)
    } else {
        Array1::zeros(vec.len())
    }
}

/// Indices of the `k` largest scores, highest first. Equal scores keep their original order.
pub(crate) fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indices.truncate(k);
    indices
}
