pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with precomputed norms, clamped to [-1, 1].
///
/// A zero norm on either side scores 0 so empty or degenerate vectors never
/// outrank real matches.
pub fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32, b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (dot / (a_norm * b_norm)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_orthogonal_and_degenerate_vectors() {
        let a = [1.0, 0.0];
        let b = [2.0, 0.0];
        let c = [0.0, 3.0];
        assert!((cosine_similarity(&a, &b, l2_norm(&a), l2_norm(&b)) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &c, l2_norm(&a), l2_norm(&c)), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0], 1.0, 0.0), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0, 0.0], 1.0, 1.0), 0.0);
    }
}
