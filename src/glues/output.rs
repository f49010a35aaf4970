//! Output glue: projects a hidden layer onto the children of one output-tree node.
//!
//! Only the rows of the children on the target word's path are read or
//! updated, so cost grows with tree depth times branching, not with the
//! vocabulary.

use crate::weights::{SharedWeight, SharedWeightUpdater};
use std::ops::Range;

/// `logits[i] += scale · (w_{rows.start+i} · input + b)`.
pub fn forward(weight: &SharedWeight, rows: Range<usize>, input: &[f32], logits: &mut [f32], scale: f32) {
    weight.matvec_add(rows, input, logits, scale);
}

/// Propagates the children errors `er` of one tree level.
///
/// Adds `scale · Wᵀ er` into `src_er` and, with `train` set, stages
/// `scale · er ⊗ input` for the children rows.
pub fn backward(
    weight: &SharedWeight,
    train: Option<(&SharedWeightUpdater, usize)>,
    rows: Range<usize>,
    er: &[f32],
    input: &[f32],
    src_er: &mut [f32],
    scale: f32,
) {
    if scale == 1.0 {
        weight.transpose_matvec_add(rows.clone(), er, src_er);
    } else {
        let scaled: Vec<f32> = er.iter().map(|e| e * scale).collect();
        weight.transpose_matvec_add(rows.clone(), &scaled, src_er);
    }
    if let Some((updater, tid)) = train {
        updater.accumulate_rows(tid, rows.start, er, input, scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{UpdateGranularity, UpdateParams, WeightStore};
    use std::sync::Arc;

    #[test]
    fn test_only_children_rows_change() {
        let store = WeightStore::new(5, 2, true).unwrap();
        let weight = Arc::new(SharedWeight::new(store, UpdateGranularity::Part));
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
            3..5,
            &[0.5, -0.5],
            &[1.0, 2.0],
            &mut src_er,
            2.0,
        );
        assert_eq!(updater.flush(0), 2);

        let snapshot = weight.snapshot();
        assert_eq!(snapshot.row(3), &[1.0, 2.0]);
        assert_eq!(snapshot.row(4), &[-1.0, -2.0]);
        assert_eq!(snapshot.row(0), &[0.0, 0.0]);
        assert_eq!(snapshot.bias().unwrap(), &[0.0, 0.0, 0.0, 1.0, -1.0]);

        let mut logits = vec![0.0; 2];
        forward(&weight, 3..5, &[1.0, 0.0], &mut logits, 1.0);
        assert_eq!(logits, vec![2.0, -2.0]);
    }
}
