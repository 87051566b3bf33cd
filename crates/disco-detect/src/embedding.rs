//! Embedding post-processing.

use ndarray::ArrayViewD;

use crate::{squeeze_batch, DecodeError};

/// Scale `v` to unit length. A zero vector is returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Cosine similarity of two embeddings; 0 if either is zero or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Pull a `[1, dim]` embedding out of the engine output and normalize it.
pub fn decode_embedding(output: ArrayViewD<'_, f32>, dim: usize) -> Result<Vec<f32>, DecodeError> {
    let expected = || format!("[1, {dim}]");
    let actual = output.shape().to_vec();
    if actual.len() != 2 {
        return Err(DecodeError::TensorShapeMismatch {
            expected: expected(),
            actual,
        });
    }
    let view = squeeze_batch(output, expected)?;
    if view.dim() != (1, dim) {
        return Err(DecodeError::TensorShapeMismatch {
            expected: expected(),
            actual,
        });
    }
    Ok(l2_normalize(view.iter().copied().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert_eq!(v, vec![0.6, 0.8]);
        let v = l2_normalize((1..=128).map(|i| i as f32 * 0.37 - 20.0).collect());
        assert!((norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_vector_is_unchanged() {
        assert_eq!(l2_normalize(vec![0.0; 4]), vec![0.0; 4]);
    }

    #[test]
    fn cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 5.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn decode_checks_shape() {
        let out = Array2::<f32>::from_elem((1, 128), 2.0).into_dyn();
        let v = decode_embedding(out.view(), 128).unwrap();
        assert_eq!(v.len(), 128);
        assert!((norm(&v) - 1.0).abs() < 1e-5);

        let wrong = Array2::<f32>::zeros((1, 512)).into_dyn();
        assert!(decode_embedding(wrong.view(), 128).is_err());

        let batched = Array3::<f32>::zeros((1, 1, 128)).into_dyn();
        assert!(decode_embedding(batched.view(), 128).is_err());
    }
}
