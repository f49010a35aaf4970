//! Stochastic gradient update with momentum and L2 decay
//!
//! Flush-time rule for every staged delta δ (a log-likelihood gradient):
//!
//! `v = μ·v + η·δ;  w = w + v − η·λ·w`
//!
//! With μ = 0 there is no velocity state and the rule reduces to
//! `w = w + η·δ − η·λ·w`.

use crate::optimizers::Optimizer;

/// Stochastic gradient optimizer.
///
/// # Fields
///
/// * `learning_rate` - η, the step size
/// * `momentum` - μ in `[0, 1)`
/// * `l2_penalty` - λ, weight decay coefficient (not applied to biases)
///
/// # Example
///
/// ```
/// use rust_neural_lm::optimizers::{Optimizer, Sgd};
///
/// let optimizer = Sgd::new(0.1, 0.0, 0.0);
/// let mut params = vec![1.0, 2.0, 3.0];
/// optimizer.update(&mut params, &mut [], &[0.1, 0.2, 0.3], true);
/// assert!((params[0] - 1.01).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    l2_penalty: f32,
}

impl Sgd {
    /// Creates a new optimizer.
    ///
    /// # Typical Values
    ///
    /// - learning rate 0.1 for sigmoid recurrent models, 0.01 for deeper stacks
    /// - momentum 0.0 to 0.9
    /// - l2 penalty 1e-7 to 1e-5
    pub fn new(learning_rate: f32, momentum: f32, l2_penalty: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            l2_penalty,
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn l2_penalty(&self) -> f32 {
        self.l2_penalty
    }
}

impl Optimizer for Sgd {
    fn update(&self, parameters: &mut [f32], velocity: &mut [f32], deltas: &[f32], decay: bool) {
        assert_eq!(
            parameters.len(),
            deltas.len(),
            "Parameters and deltas must have the same length"
        );
        let lr = self.learning_rate;
        let shrink = if decay { lr * self.l2_penalty } else { 0.0 };

        if velocity.is_empty() {
            for (param, &delta) in parameters.iter_mut().zip(deltas) {
                *param += lr * delta - shrink * *param;
            }
        } else {
            assert_eq!(velocity.len(), parameters.len(), "velocity length mismatch");
            for ((param, v), &delta) in parameters.iter_mut().zip(velocity.iter_mut()).zip(deltas) {
                *v = self.momentum * *v + lr * delta;
                *param += *v - shrink * *param;
            }
        }
    }

    fn uses_velocity(&self) -> bool {
        self.momentum > 0.0
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_update() {
        let optimizer = Sgd::new(0.1, 0.0, 0.0);
        let mut params = vec![1.0, 2.0, 3.0];
        let deltas = vec![0.1, 0.2, 0.3];

        optimizer.update(&mut params, &mut [], &deltas, true);

        assert!((params[0] - 1.01).abs() < 1e-6);
        assert!((params[1] - 2.02).abs() < 1e-6);
        assert!((params[2] - 3.03).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let optimizer = Sgd::new(0.1, 0.5, 0.0);
        assert!(optimizer.uses_velocity());
        let mut params = vec![0.0];
        let mut velocity = vec![0.0];

        optimizer.update(&mut params, &mut velocity, &[1.0], true);
        assert!((velocity[0] - 0.1).abs() < 1e-6);
        assert!((params[0] - 0.1).abs() < 1e-6);

        optimizer.update(&mut params, &mut velocity, &[1.0], true);
        assert!((velocity[0] - 0.15).abs() < 1e-6);
        assert!((params[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_l2_only_when_decaying() {
        let optimizer = Sgd::new(0.5, 0.0, 0.1);
        let mut weights = vec![2.0];
        optimizer.update(&mut weights, &mut [], &[0.0], true);
        assert!((weights[0] - 1.9).abs() < 1e-6);

        let mut bias = vec![2.0];
        optimizer.update(&mut bias, &mut [], &[0.0], false);
        assert_eq!(bias[0], 2.0);
    }

    #[test]
    fn test_sgd_zero_learning_rate() {
        let optimizer = Sgd::new(0.0, 0.0, 0.0);
        let mut params = vec![1.0, 2.0, 3.0];
        let original = params.clone();
        optimizer.update(&mut params, &mut [], &[0.1, 0.2, 0.3], true);
        assert_eq!(params, original);
    }

    #[test]
    #[should_panic(expected = "Parameters and deltas must have the same length")]
    fn test_sgd_mismatched_lengths() {
        let optimizer = Sgd::new(0.01, 0.0, 0.0);
        let mut params = vec![1.0, 2.0];
        optimizer.update(&mut params, &mut [], &[0.1, 0.2, 0.3], true);
    }
}
