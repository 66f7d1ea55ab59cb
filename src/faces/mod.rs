pub mod clustering;
pub mod detector;
pub mod graph;
pub mod propagation;

pub use clustering::{ClusterEngine, ClusterParams, ClusterSummary};
pub use detector::{DetectedFace, DetectorFactory, FaceDetector, OnnxDetectorFactory};

/// Scale to unit length. `None` for a zero or non-finite vector, which
/// cannot be compared by cosine similarity.
pub fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        Some(v.iter().map(|x| x / norm).collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!(l2_normalize(&[0.0, 0.0]).is_none());
        assert!(l2_normalize(&[f32::NAN, 1.0]).is_none());
    }
}
