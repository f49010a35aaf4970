//! Activation trait definition for network layers
//!
//! Every layer kind provides the same two-operation capability: transform
//! its summed input in place, and scale an incoming error by the derivative
//! of that transformation. Derivatives are expressed in terms of the
//! activation value, so the pre-activation never needs to be kept.

/// Transformation capability of a layer.
///
/// # Example
///
/// ```ignore
/// // forward: ac holds the summed glue contributions
/// kind.activate(&mut ac);
///
/// // backward: er holds dE/d(ac), becomes dE/d(pre-activation)
/// kind.derivate(&ac, &mut er);
/// ```
pub trait Activation {
    /// Applies the transformation in place.
    fn activate(&self, ac: &mut [f32]);

    /// Multiplies `er` element-wise by the derivative at activation `ac`.
    ///
    /// # Panics
    ///
    /// Implementations may panic if `ac` and `er` have different lengths.
    fn derivate(&self, ac: &[f32], er: &mut [f32]);
}
