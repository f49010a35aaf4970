//! Optimizer abstractions for flushing staged weight updates
//!
//! Training threads stage log-likelihood gradients (deltas) privately; when a
//! thread flushes, the optimizer turns each staged delta into a change of the
//! canonical weights. The optimizer only sees slices of one lock block at a
//! time and is called with that block exclusively locked.
//!
//! # Available Optimizers
//!
//! - SGD: gradient ascent with optional momentum and L2 weight decay
//!
//! # Example
//!
//! ```ignore
//! use rust_neural_lm::optimizers::{Optimizer, Sgd};
//!
//! let optimizer = Sgd::new(0.1, 0.0, 0.0);
//! optimizer.update(&mut weights, &mut [], &deltas, true);
//! ```

pub mod sgd;

pub use sgd::Sgd;

/// Update rule applied at flush time.
///
/// Deltas point in the direction that increases the log-likelihood, so
/// implementations add them (scaled) to the parameters.
pub trait Optimizer: Send + Sync {
    /// Applies `deltas` to `parameters`.
    ///
    /// `velocity` is either empty (no momentum state) or the same length as
    /// `parameters`. `decay` selects whether weight decay applies; biases
    /// are flushed with `decay = false`.
    ///
    /// # Panics
    ///
    /// Implementations panic if `parameters` and `deltas` have different lengths.
    fn update(&self, parameters: &mut [f32], velocity: &mut [f32], deltas: &[f32], decay: bool);

    /// True when `update` needs a velocity buffer.
    fn uses_velocity(&self) -> bool;

    /// Get the learning rate for this optimizer.
    fn learning_rate(&self) -> f32;
}
