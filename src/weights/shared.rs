//! Canonical weight matrix shared by every training thread.
//!
//! Rows are grouped into lock blocks. Readers take shared locks on the
//! blocks they touch; flushes take exclusive locks one block at a time, so
//! two threads only contend when they hit the same block.

use crate::error::{LmError, Result};
use crate::weights::WeightStore;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// How staged updates are tracked and how rows are grouped into lock blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateGranularity {
    /// Whole matrix under one lock; used when every row changes every step.
    Full,
    /// Per-row locks, dirty rows tracked as merged contiguous ranges.
    Part,
    /// Fixed-size segments of `rows` rows, one lock per segment.
    Segment {
        /// Rows per segment
        rows: usize,
    },
    /// Per-row locks, dirty rows tracked individually.
    OneShot,
}

impl UpdateGranularity {
    /// Parses an update mode name; `segment_rows` only applies to `segment`.
    pub fn parse(name: &str, segment_rows: Option<usize>) -> Result<Self> {
        let mut granularity: Self = name.parse()?;
        if let Self::Segment { rows } = &mut granularity {
            *rows = segment_rows.unwrap_or(*rows);
            if *rows == 0 {
                return Err(LmError::invalid_option("segment_rows must be positive"));
            }
        }
        Ok(granularity)
    }

    /// Number of rows sharing one lock block in a matrix with `total_rows` rows.
    pub fn block_rows(&self, total_rows: usize) -> usize {
        match *self {
            Self::Full => total_rows.max(1),
            Self::Part | Self::OneShot => 1,
            Self::Segment { rows } => rows.clamp(1, total_rows.max(1)),
        }
    }
}

impl FromStr for UpdateGranularity {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "full" => Ok(Self::Full),
            "part" => Ok(Self::Part),
            "segment" => Ok(Self::Segment { rows: 64 }),
            "one-shot" | "oneshot" => Ok(Self::OneShot),
            other => Err(LmError::invalid_option(format!(
                "Unknown update mode '{}'. Must be one of: full, part, segment, one-shot",
                other
            ))),
        }
    }
}

impl fmt::Display for UpdateGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Part => write!(f, "part"),
            Self::Segment { rows } => write!(f, "segment({})", rows),
            Self::OneShot => write!(f, "one-shot"),
        }
    }
}

/// Rows of one lock block.
#[derive(Debug, Default)]
pub(crate) struct Block {
    pub(crate) data: Vec<f32>,
    pub(crate) bias: Vec<f32>,
    /// Momentum state, allocated by the first flush that needs it.
    pub(crate) velocity: Vec<f32>,
    pub(crate) bias_velocity: Vec<f32>,
}

/// Canonical matrix for one glue (or one set of tied glues).
pub struct SharedWeight {
    rows: usize,
    cols: usize,
    has_bias: bool,
    granularity: UpdateGranularity,
    block_rows: usize,
    blocks: Vec<RwLock<Block>>,
}

impl SharedWeight {
    /// Splits `store` into lock blocks according to `granularity`.
    pub fn new(store: WeightStore, granularity: UpdateGranularity) -> Self {
        let (rows, cols, data, bias) = store.into_parts();
        let block_rows = granularity.block_rows(rows);
        let has_bias = bias.is_some();

        let blocks = (0..rows)
            .step_by(block_rows)
            .map(|start| {
                let end = (start + block_rows).min(rows);
                RwLock::new(Block {
                    data: data[start * cols..end * cols].to_vec(),
                    bias: bias
                        .as_ref()
                        .map(|b| b[start..end].to_vec())
                        .unwrap_or_default(),
                    velocity: Vec::new(),
                    bias_velocity: Vec::new(),
                })
            })
            .collect();

        Self {
            rows,
            cols,
            has_bias,
            granularity,
            block_rows,
            blocks,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn has_bias(&self) -> bool {
        self.has_bias
    }

    pub fn granularity(&self) -> UpdateGranularity {
        self.granularity
    }

    /// Number of lock blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Rows covered by lock block `b`.
    pub fn block_range(&self, b: usize) -> Range<usize> {
        let start = b * self.block_rows;
        start..(start + self.block_rows).min(self.rows)
    }

    /// Lock block holding row `r`.
    pub fn block_of(&self, r: usize) -> usize {
        r / self.block_rows
    }

    pub(crate) fn write_block(&self, b: usize) -> RwLockWriteGuard<'_, Block> {
        self.blocks[b].write()
    }

    /// Calls `f(block, local_row, row)` for every row in `rows`, holding a
    /// shared lock on one block at a time.
    fn visit_rows(&self, rows: Range<usize>, mut f: impl FnMut(&Block, usize, usize)) {
        assert!(
            rows.end <= self.rows,
            "rows {:?} out of range ({} rows)",
            rows,
            self.rows
        );
        let mut r = rows.start;
        while r < rows.end {
            let b = self.block_of(r);
            let block_start = b * self.block_rows;
            let block_end = (block_start + self.block_rows).min(rows.end);
            let guard = self.blocks[b].read();
            for row in r..block_end {
                f(&guard, row - block_start, row);
            }
            r = block_end;
        }
    }

    /// Copies row `r` into `out`.
    pub fn read_row(&self, r: usize, out: &mut [f32]) {
        assert_eq!(out.len(), self.cols, "row buffer width mismatch");
        let cols = self.cols;
        self.visit_rows(r..r + 1, |block, local, _| {
            out.copy_from_slice(&block.data[local * cols..(local + 1) * cols]);
        });
    }

    /// `w_r · x + b_r`.
    pub fn dot_row(&self, r: usize, x: &[f32]) -> f32 {
        assert_eq!(x.len(), self.cols, "input width mismatch");
        let cols = self.cols;
        let mut result = 0.0;
        self.visit_rows(r..r + 1, |block, local, _| {
            result = dot(&block.data[local * cols..(local + 1) * cols], x);
            if let Some(b) = block.bias.get(local) {
                result += b;
            }
        });
        result
    }

    /// `y += alpha · w_r`.
    pub fn add_row_scaled(&self, r: usize, alpha: f32, y: &mut [f32]) {
        assert_eq!(y.len(), self.cols, "output width mismatch");
        let cols = self.cols;
        self.visit_rows(r..r + 1, |block, local, _| {
            for (yi, &w) in y.iter_mut().zip(&block.data[local * cols..(local + 1) * cols]) {
                *yi += alpha * w;
            }
        });
    }

    /// `y[i] += alpha · (w_{start+i} · x + b_{start+i})` for every row in `rows`.
    pub fn matvec_add(&self, rows: Range<usize>, x: &[f32], y: &mut [f32], alpha: f32) {
        assert_eq!(x.len(), self.cols, "input width mismatch");
        assert_eq!(y.len(), rows.len(), "output width mismatch");
        let cols = self.cols;
        let start = rows.start;
        self.visit_rows(rows, |block, local, row| {
            let mut sum = dot(&block.data[local * cols..(local + 1) * cols], x);
            if let Some(b) = block.bias.get(local) {
                sum += b;
            }
            y[row - start] += alpha * sum;
        });
    }

    /// `x += Σ_i e[i] · w_{start+i}` over the rows in `rows`.
    pub fn transpose_matvec_add(&self, rows: Range<usize>, e: &[f32], x: &mut [f32]) {
        assert_eq!(e.len(), rows.len(), "error width mismatch");
        assert_eq!(x.len(), self.cols, "input width mismatch");
        let cols = self.cols;
        let start = rows.start;
        self.visit_rows(rows, |block, local, row| {
            let scale = e[row - start];
            if scale == 0.0 {
                return;
            }
            for (xi, &w) in x.iter_mut().zip(&block.data[local * cols..(local + 1) * cols]) {
                *xi += scale * w;
            }
        });
    }

    /// Consistent-per-block copy of the current canonical values.
    pub fn snapshot(&self) -> WeightStore {
        let mut data = Vec::with_capacity(self.rows * self.cols);
        let mut bias = Vec::with_capacity(if self.has_bias { self.rows } else { 0 });
        for block in &self.blocks {
            let guard = block.read();
            data.extend_from_slice(&guard.data);
            bias.extend_from_slice(&guard.bias);
        }
        let bias = self.has_bias.then_some(bias);
        WeightStore::from_blocks(self.rows, self.cols, data, bias)
    }

    /// True when no canonical value is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.blocks.iter().all(|block| {
            let guard = block.read();
            guard.data.iter().all(|v| v.is_finite()) && guard.bias.iter().all(|v| v.is_finite())
        })
    }
}

impl fmt::Debug for SharedWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWeight")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("has_bias", &self.has_bias)
            .field("granularity", &self.granularity)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_store(rows: usize, cols: usize) -> WeightStore {
        let data = (0..rows * cols).map(|v| v as f32).collect();
        let bias = (0..rows).map(|v| v as f32 * 0.5).collect();
        WeightStore::from_parts(rows, cols, data, Some(bias)).unwrap()
    }

    #[test]
    fn test_block_layout() {
        let full = SharedWeight::new(counting_store(5, 2), UpdateGranularity::Full);
        assert_eq!(full.num_blocks(), 1);

        let part = SharedWeight::new(counting_store(5, 2), UpdateGranularity::Part);
        assert_eq!(part.num_blocks(), 5);

        let seg = SharedWeight::new(counting_store(5, 2), UpdateGranularity::Segment { rows: 2 });
        assert_eq!(seg.num_blocks(), 3);
        assert_eq!(seg.block_range(2), 4..5);
        assert_eq!(seg.block_of(3), 1);
    }

    #[test]
    fn test_reads_match_store_for_every_granularity() {
        let store = counting_store(5, 3);
        let x = [1.0, -1.0, 2.0];
        for granularity in [
            UpdateGranularity::Full,
            UpdateGranularity::Part,
            UpdateGranularity::Segment { rows: 2 },
            UpdateGranularity::OneShot,
        ] {
            let weight = SharedWeight::new(store.clone(), granularity);
            assert_eq!(weight.snapshot(), store);

            let mut row = [0.0; 3];
            weight.read_row(4, &mut row);
            assert_eq!(row, [12.0, 13.0, 14.0]);

            // row 1 = [3, 4, 5], bias 0.5
            assert_eq!(weight.dot_row(1, &x), 3.0 - 4.0 + 10.0 + 0.5);

            let mut y = [0.0; 3];
            weight.matvec_add(1..4, &x, &mut y, 2.0);
            assert_eq!(y[0], 2.0 * (9.0 + 0.5));

            let mut acc = [0.0; 3];
            weight.transpose_matvec_add(0..2, &[1.0, 1.0], &mut acc);
            assert_eq!(acc, [3.0, 5.0, 7.0]);
        }
    }

    #[test]
    fn test_add_row_scaled() {
        let weight = SharedWeight::new(counting_store(2, 2), UpdateGranularity::OneShot);
        let mut y = [1.0, 1.0];
        weight.add_row_scaled(1, 0.5, &mut y);
        assert_eq!(y, [2.0, 2.5]);
    }

    #[test]
    fn test_parse_granularity() {
        assert_eq!(
            UpdateGranularity::parse("one_shot", None).unwrap(),
            UpdateGranularity::OneShot
        );
        assert_eq!(
            UpdateGranularity::parse("Segment", Some(8)).unwrap(),
            UpdateGranularity::Segment { rows: 8 }
        );
        assert!(UpdateGranularity::parse("segment", Some(0)).is_err());
        assert!(UpdateGranularity::parse("sparse", None).is_err());
    }

    #[test]
    #[should_panic(expected = "input width mismatch")]
    fn test_shape_mismatch_panics() {
        let weight = SharedWeight::new(counting_store(2, 2), UpdateGranularity::Full);
        weight.dot_row(0, &[1.0, 2.0, 3.0]);
    }
}
