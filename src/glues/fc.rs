//! Fully-connected glue: `dst += W · src + b`.

use crate::weights::{SharedWeight, SharedWeightUpdater};

/// `dst += W · input + b`.
pub fn forward(weight: &SharedWeight, input: &[f32], dst: &mut [f32]) {
    weight.matvec_add(0..weight.rows(), input, dst, 1.0);
}

/// Propagates `delta` (error of the destination slice) back through `W`.
///
/// With `train` set, stages `delta ⊗ input` into the thread's slot.
/// With `src_er` set, adds `Wᵀ · delta` into it.
pub fn backward(
    weight: &SharedWeight,
    train: Option<(&SharedWeightUpdater, usize)>,
    delta: &[f32],
    input: &[f32],
    src_er: Option<&mut [f32]>,
) {
    if let Some(src_er) = src_er {
        weight.transpose_matvec_add(0..weight.rows(), delta, src_er);
    }
    if let Some((updater, tid)) = train {
        updater.accumulate_outer(tid, delta, input, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{UpdateGranularity, UpdateParams, WeightStore};
    use std::sync::Arc;

    #[test]
    fn test_forward_backward() {
        let store =
            WeightStore::from_parts(2, 2, vec![1.0, 2.0, 3.0, 4.0], Some(vec![0.5, -0.5])).unwrap();
        let weight = Arc::new(SharedWeight::new(store, UpdateGranularity::Full));

        let mut dst = vec![0.0; 2];
        forward(&weight, &[1.0, 1.0], &mut dst);
        assert_eq!(dst, vec![3.5, 6.5]);

        let params = UpdateParams {
            learning_rate: 1.0,
            flush_interval: 0,
            ..UpdateParams::default()
        };
        let updater = SharedWeightUpdater::new(weight.clone(), params, 1);
        let mut src_er = vec![0.0; 2];
        backward(
            &weight,
            Some((&updater, 0)),
            &[1.0, 0.0],
            &[2.0, 3.0],
            Some(&mut src_er),
        );
        assert_eq!(src_er, vec![1.0, 2.0]);

        updater.flush(0);
        let snapshot = weight.snapshot();
        assert_eq!(snapshot.row(0), &[3.0, 5.0]);
        assert_eq!(snapshot.bias().unwrap(), &[1.5, -0.5]);
    }
}
