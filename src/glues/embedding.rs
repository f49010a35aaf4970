//! Embedding glue: looks up one weight row per context word.
//!
//! The context words are merged into the destination slice according to
//! the component's input combine mode: summed, averaged, or concatenated
//! (word `k` fills columns `k·width..(k+1)·width`).

use crate::layers::Combine;
use crate::vocab::WordId;
use crate::weights::{SharedWeight, SharedWeightUpdater};

/// Width of the destination slice for `context_len` words of `width` columns.
pub fn out_width(width: usize, context_len: usize, combine: Combine) -> usize {
    match combine {
        Combine::Concat => width * context_len,
        Combine::Sum | Combine::Avg => width,
    }
}

fn word_scale(context_len: usize, combine: Combine) -> f32 {
    match combine {
        Combine::Avg => 1.0 / context_len.max(1) as f32,
        Combine::Sum | Combine::Concat => 1.0,
    }
}

/// Adds the embeddings of `words` into `dst`.
pub fn forward(weight: &SharedWeight, words: &[WordId], combine: Combine, dst: &mut [f32]) {
    let width = weight.cols();
    assert_eq!(
        dst.len(),
        out_width(width, words.len(), combine),
        "embedding glue width mismatch"
    );
    let scale = word_scale(words.len(), combine);
    for (k, &word) in words.iter().enumerate() {
        let target = match combine {
            Combine::Concat => &mut dst[k * width..(k + 1) * width],
            Combine::Sum | Combine::Avg => &mut dst[..],
        };
        weight.add_row_scaled(word as usize, scale, target);
    }
}

/// Stages the error `delta` of the destination slice into each word's row.
pub fn backward(
    updater: &SharedWeightUpdater,
    tid: usize,
    words: &[WordId],
    combine: Combine,
    delta: &[f32],
) {
    let width = updater.weight().cols();
    let scale = word_scale(words.len(), combine);
    for (k, &word) in words.iter().enumerate() {
        let values = match combine {
            Combine::Concat => &delta[k * width..(k + 1) * width],
            Combine::Sum | Combine::Avg => delta,
        };
        updater.accumulate_row(tid, word as usize, values, scale);
    }
}
