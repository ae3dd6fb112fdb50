use ndarray::Array2;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, RouteMapError};
use crate::hooks::RouterGate;

/// Linear routing gate: `logits = hidden · w_gate`
///
/// Stands in for the host model's gate when no serving engine is attached.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LinearGate {
    /// Gating weights: (hidden_dim, num_experts)
    w_gate: Array2<f32>,
}

impl LinearGate {
    /// Xavier-normal initialised gate
    pub fn new(hidden_dim: usize, num_experts: usize) -> Result<Self> {
        if hidden_dim == 0 || num_experts == 0 {
            return Err(RouteMapError::InvalidInput {
                message: format!(
                    "gate dimensions must be non-zero, got {}x{}",
                    hidden_dim, num_experts
                ),
            });
        }

        let mut rng = rand::rng();
        let std = (2.0 / (hidden_dim + num_experts) as f32).sqrt();
        let normal = Normal::new(0.0, std).map_err(|e| RouteMapError::InvalidInput {
            message: format!("invalid gate init: {}", e),
        })?;

        let w_gate = Array2::from_shape_fn((hidden_dim, num_experts), |_| normal.sample(&mut rng));
        Ok(LinearGate { w_gate })
    }

    pub fn from_weights(w_gate: Array2<f32>) -> Self {
        LinearGate { w_gate }
    }

    pub fn hidden_dim(&self) -> usize {
        self.w_gate.nrows()
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.w_gate
    }
}

impl RouterGate for LinearGate {
    fn num_experts(&self) -> usize {
        self.w_gate.ncols()
    }

    fn gate(&self, hidden: &Array2<f32>) -> Array2<f32> {
        hidden.dot(&self.w_gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_gate_shape() {
        let gate = LinearGate::new(8, 4).unwrap();
        let hidden = Array2::<f32>::ones((3, 8));
        let logits = gate.gate(&hidden);

        assert_eq!(logits.dim(), (3, 4));
        assert_eq!(gate.num_experts(), 4);
        assert_eq!(gate.hidden_dim(), 8);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gate_from_weights() {
        let gate = LinearGate::from_weights(array![[1.0f32, 0.0, 2.0], [0.0, 1.0, -1.0]]);
        let logits = gate.gate(&array![[3.0f32, 4.0]]);
        assert_eq!(logits, array![[3.0f32, 4.0, 2.0]]);
    }

    #[test]
    fn test_gate_rejects_zero_dims() {
        assert!(LinearGate::new(0, 4).is_err());
        assert!(LinearGate::new(4, 0).is_err());
    }
}
