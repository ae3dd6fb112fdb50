//! Routing math shared by the shadow capture path and the reference gate
//!
//! - Numerically stable softmax over the expert axis, computed in f64
//! - Top-K selection with descending order and lower-index-first tie breaking
//!
//! Everything here works on copies of the router logits. Nothing feeds back into the
//! host's own routing computation.

use std::cmp::Ordering;

use ndarray::{Array2, ArrayView1};

/// Numerically stable softmax along axis 1 (experts)
///
/// ```text
/// softmax(x_i) = exp(x_i - max(x)) / Σ exp(x_j - max(x))
/// ```
///
/// Inputs are widened to f64 before exponentiation regardless of the precision the
/// model runs in.
///
/// # Example
///
/// ```ignore
/// let x = array![[1.0f32, 2.0, 3.0]];
/// let probs = softmax(&x);
/// assert!((probs.sum() - 1.0).abs() < 1e-12);
/// ```
pub fn softmax(x: &Array2<f32>) -> Array2<f64> {
    let (num_tokens, num_experts) = x.dim();
    let mut result = Array2::<f64>::zeros((num_tokens, num_experts));

    for (token_idx, row) in x.rows().into_iter().enumerate() {
        let max_val = row
            .iter()
            .map(|&v| v as f64)
            .fold(f64::NEG_INFINITY, f64::max);

        let exp_row: Vec<f64> = row.iter().map(|&v| (v as f64 - max_val).exp()).collect();
        let sum_exp: f64 = exp_row.iter().sum();

        for (expert_idx, &exp_val) in exp_row.iter().enumerate() {
            result[[token_idx, expert_idx]] = exp_val / sum_exp;
        }
    }

    result
}

/// Select the `k` highest-scoring entries of one row
///
/// Returns `(indices, scores)` in descending score order. Equal scores keep their
/// original order, so the lower index wins a tie.
pub fn top_k(scores: ArrayView1<'_, f64>, k: usize) -> (Vec<usize>, Vec<f64>) {
    let k = k.min(scores.len());

    let mut indexed: Vec<(usize, f64)> = scores.iter().copied().enumerate().collect();
    // sort_by is stable
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);

    indexed.into_iter().unzip()
}

/// Top-K indices for each row of a `(num_tokens, num_candidates)` score matrix
pub fn top_k_indices(scores: &Array2<f64>, k: usize) -> Vec<Vec<usize>> {
    scores
        .rows()
        .into_iter()
        .map(|row| top_k(row, k).0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_top_k_indices_basic() {
        let scores = array![[0.1, 0.5, 0.3, 0.2]];
        let top = top_k_indices(&scores, 2);

        assert_eq!(top.len(), 1);
        assert_eq!(top[0], vec![1, 2]);
    }

    #[test]
    fn test_top_k_indices_batch() {
        let scores = array![[0.1, 0.5, 0.3], [0.4, 0.2, 0.6]];
        let top = top_k_indices(&scores, 2);

        assert_eq!(top[0], vec![1, 2]);
        assert_eq!(top[1], vec![2, 0]);
    }

    #[test]
    fn test_top_k_ties_prefer_lower_index() {
        let scores = array![0.2, 0.4, 0.4, 0.0, 0.4];
        let (ids, weights) = top_k(scores.view(), 3);

        assert_eq!(ids, vec![1, 2, 4]);
        assert_eq!(weights, vec![0.4, 0.4, 0.4]);
    }

    #[test]
    fn test_top_k_exceeds_candidates() {
        let scores = array![0.1, 0.5];
        let (ids, _) = top_k(scores.view(), 5);
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x = array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]];
        let probs = softmax(&x);

        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((probs[[1, 0]] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_softmax_numerical_stability() {
        // Would overflow without the max subtraction
        let x = array![[1000.0f32, 1001.0, 1002.0]];
        let probs = softmax(&x);

        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.sum() - 1.0).abs() < 1e-12);
        assert!(probs[[0, 2]] > probs[[0, 1]]);
    }

    #[test]
    fn test_softmax_masked_expert() {
        let x = array![[f32::NEG_INFINITY, 0.0, 0.0]];
        let probs = softmax(&x);

        assert_eq!(probs[[0, 0]], 0.0);
        assert!((probs[[0, 1]] - 0.5).abs() < 1e-12);
    }
}
