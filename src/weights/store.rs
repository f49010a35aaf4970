//! Weight Store: a dense row-major matrix plus an optional bias vector.

use crate::error::{LmError, Result};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};

/// Dense `rows × cols` matrix with an optional length-`rows` bias.
///
/// Rows are output classes (output glue), input words (embedding glue) or
/// destination units (fully-connected glue). The shape never changes after
/// construction.
///
/// # Example
///
/// ```ignore
/// use rust_neural_lm::weights::WeightStore;
/// use rust_neural_lm::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let mut store = WeightStore::new(16, 8, true).unwrap();
/// store.init_uniform(&mut rng);
/// assert_eq!(store.row(3).len(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightStore {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    bias: Option<Vec<f32>>,
}

impl WeightStore {
    /// Zero-initialized store. Both dimensions must be at least 1.
    pub fn new(rows: usize, cols: usize, with_bias: bool) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(LmError::topology(format!(
                "weight shape {}x{} must have at least one row and one column",
                rows, cols
            )));
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
            bias: with_bias.then(|| vec![0.0; rows]),
        })
    }

    /// Builds a store from raw parts, checking their lengths.
    pub fn from_parts(
        rows: usize,
        cols: usize,
        data: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Result<Self> {
        let mut store = Self::new(rows, cols, false)?;
        if data.len() != rows * cols {
            return Err(LmError::shape_mismatch("weight data", rows * cols, data.len()));
        }
        if let Some(bias) = &bias {
            if bias.len() != rows {
                return Err(LmError::shape_mismatch("weight bias", rows, bias.len()));
            }
        }
        store.data = data;
        store.bias = bias;
        Ok(store)
    }

    /// Reassembles a store from lock-block contents whose shape is already known.
    pub(crate) fn from_blocks(
        rows: usize,
        cols: usize,
        data: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self {
            rows,
            cols,
            data,
            bias,
        }
    }

    /// Xavier uniform initialization: `[-limit, limit]` with
    /// `limit = sqrt(6 / (rows + cols))`. Biases are zeroed.
    pub fn init_uniform(&mut self, rng: &mut SimpleRng) {
        let limit = (6.0f32 / (self.rows + self.cols) as f32).sqrt();
        for value in &mut self.data {
            *value = rng.gen_range_f32(-limit, limit);
        }
        if let Some(bias) = &mut self.bias {
            bias.iter_mut().for_each(|b| *b = 0.0);
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Row `r` as a slice. Panics when `r` is out of range.
    pub fn row(&self, r: usize) -> &[f32] {
        assert!(r < self.rows, "row {} out of range ({} rows)", r, self.rows);
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Mutable row `r`. Panics when `r` is out of range.
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        assert!(r < self.rows, "row {} out of range ({} rows)", r, self.rows);
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut [f32]> {
        self.bias.as_deref_mut()
    }

    /// True when no weight or bias is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
            && self
                .bias
                .as_ref()
                .map_or(true, |b| b.iter().all(|v| v.is_finite()))
    }

    /// Decomposes the store into `(rows, cols, data, bias)`.
    pub fn into_parts(self) -> (usize, usize, Vec<f32>, Option<Vec<f32>>) {
        (self.rows, self.cols, self.data, self.bias)
    }
}
