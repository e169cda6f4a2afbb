//! Vector similarity.

/// Cosine similarity between two embedding vectors.
///
/// Returns the dot product divided by the product of the L2 norms. Returns
/// `0.0` when either vector has zero norm, or when the lengths differ.
/// The result is clamped to `[-1.0, 1.0]` to absorb float rounding.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        tracing::warn!(
            left = a.len(),
            right = b.len(),
            "Embedding dimensions differ, similarity is 0"
        );
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}
