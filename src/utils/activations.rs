//! Activation functions for neural network layers
//!
//! All kernels work in place on f32 slices. Derivatives are expressed in
//! terms of the activation value (not the pre-activation), so a layer only
//! needs to keep its activated output around for the backward pass.

/// Sigmoid activation applied in-place: 1 / (1 + exp(-x)).
pub fn sigmoid_inplace(data: &mut [f32]) {
    for value in data.iter_mut() {
        // clamp keeps exp() finite for very negative inputs
        let x = value.clamp(-50.0, 50.0);
        *value = 1.0 / (1.0 + (-x).exp());
    }
}

/// Multiplies `er` by the sigmoid derivative, assuming `ac = sigmoid(z)`.
pub fn sigmoid_derivative_inplace(ac: &[f32], er: &mut [f32]) {
    for (e, &a) in er.iter_mut().zip(ac) {
        *e *= a * (1.0 - a);
    }
}

/// Hyperbolic tangent applied in-place.
pub fn tanh_inplace(data: &mut [f32]) {
    for value in data.iter_mut() {
        *value = value.tanh();
    }
}

/// Multiplies `er` by the tanh derivative, assuming `ac = tanh(z)`.
pub fn tanh_derivative_inplace(ac: &[f32], er: &mut [f32]) {
    for (e, &a) in er.iter_mut().zip(ac) {
        *e *= 1.0 - a * a;
    }
}

/// ReLU activation function (f32 version) applied in-place.
///
/// Sets all negative values to 0.0, keeps positive values unchanged.
pub fn relu_inplace(data: &mut [f32]) {
    for value in data.iter_mut() {
        if *value < 0.0 {
            *value = 0.0;
        }
    }
}

/// Zeroes `er` wherever the rectified activation is not positive.
pub fn relu_derivative_inplace(ac: &[f32], er: &mut [f32]) {
    for (e, &a) in er.iter_mut().zip(ac) {
        if a <= 0.0 {
            *e = 0.0;
        }
    }
}

/// Softmax applied in-place to a single row of logits.
///
/// Uses the max-subtraction trick for numerical stability.
pub fn softmax_inplace(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }
    let max_value = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for value in row.iter_mut() {
        *value = (*value - max_value).exp();
        sum += *value;
    }

    let inv_sum = 1.0f32 / sum;
    for value in row.iter_mut() {
        *value *= inv_sum;
    }
}

/// Clips every element of `er` into `[-cutoff, cutoff]`.
///
/// A non-positive cutoff disables clipping.
pub fn clip_inplace(er: &mut [f32], cutoff: f32) {
    if cutoff <= 0.0 {
        return;
    }
    for e in er.iter_mut() {
        *e = e.clamp(-cutoff, cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON_F32: f32 = 1e-6;

    #[test]
    fn test_sigmoid_zero() {
        let mut data = vec![0.0f32];
        sigmoid_inplace(&mut data);
        assert!((data[0] - 0.5).abs() < EPSILON_F32);
    }

    #[test]
    fn test_sigmoid_extremes_are_finite() {
        let mut data = vec![-1000.0f32, 1000.0];
        sigmoid_inplace(&mut data);
        assert!(data.iter().all(|v| v.is_finite()));
        assert!(data[0] < 1e-6);
        assert!(data[1] > 1.0 - 1e-6);
    }

    #[test]
    fn test_sigmoid_derivative_at_half() {
        let ac = [0.5f32];
        let mut er = [1.0f32];
        sigmoid_derivative_inplace(&ac, &mut er);
        assert!((er[0] - 0.25).abs() < EPSILON_F32);
    }

    #[test]
    fn test_tanh_derivative() {
        let mut ac = vec![0.0f32, 0.5];
        tanh_inplace(&mut ac);
        let mut er = vec![2.0f32, 1.0];
        tanh_derivative_inplace(&ac, &mut er);
        assert!((er[0] - 2.0).abs() < EPSILON_F32);
        let t = 0.5f32.tanh();
        assert!((er[1] - (1.0 - t * t)).abs() < EPSILON_F32);
    }

    #[test]
    fn test_relu_mixed() {
        let mut data = vec![-2.0, -1.0, 0.0, 1.0, 2.0];
        relu_inplace(&mut data);
        assert_eq!(data, vec![0.0, 0.0, 0.0, 1.0, 2.0]);

        let mut er = vec![1.0; 5];
        relu_derivative_inplace(&data, &mut er);
        assert_eq!(er, vec![0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_softmax_sum_and_stability() {
        let mut data = vec![1000.0, 1001.0, 1002.0];
        softmax_inplace(&mut data);
        let sum: f32 = data.iter().sum();
        assert!((sum - 1.0).abs() < EPSILON_F32);
        assert!(!data.iter().any(|&x| x.is_nan() || x.is_infinite()));
    }

    #[test]
    fn test_clip() {
        let mut er = vec![-80.0, 3.0, 70.0];
        clip_inplace(&mut er, 50.0);
        assert_eq!(er, vec![-50.0, 3.0, 50.0]);

        let mut untouched = vec![-80.0];
        clip_inplace(&mut untouched, 0.0);
        assert_eq!(untouched, vec![-80.0]);
    }
}
