//! Shared Weight Updater: per-thread staging of gradient contributions.
//!
//! Every training thread owns one slot per shared weight. Accumulating only
//! touches the caller's slot, so threads never block each other while
//! staging. A flush applies the slot's staged deltas to the canonical
//! matrix under exclusive block locks and clears the slot's dirty buffer.
//! Readers may see canonical values that do not yet include another
//! thread's unflushed deltas; updates are asynchronous by construction.

use crate::optimizers::{Optimizer, Sgd};
use crate::weights::{DirtyBuffer, SharedWeight};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Hyperparameters of a shared weight updater.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateParams {
    pub learning_rate: f32,
    pub momentum: f32,
    pub l2_penalty: f32,
    /// Steps between automatic flushes; 0 flushes only on request.
    pub flush_interval: usize,
    /// Dirty entries a slot may hold before a forced flush.
    pub dirty_capacity: usize,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.0,
            l2_penalty: 0.0,
            flush_interval: 1,
            dirty_capacity: 4096,
        }
    }
}

#[derive(Debug)]
struct ThreadDelta {
    delta: Vec<f32>,
    bias_delta: Vec<f32>,
    dirty: DirtyBuffer,
    steps: usize,
}

/// Thread-safe staging and flushing for one [`SharedWeight`].
pub struct SharedWeightUpdater {
    weight: Arc<SharedWeight>,
    optimizer: Sgd,
    flush_interval: usize,
    slots: Vec<Mutex<ThreadDelta>>,
    forced_flushes: AtomicUsize,
}

impl SharedWeightUpdater {
    /// Creates an updater with one staging slot per thread.
    pub fn new(weight: Arc<SharedWeight>, params: UpdateParams, num_threads: usize) -> Self {
        let slots = (0..num_threads.max(1))
            .map(|_| {
                Mutex::new(ThreadDelta {
                    delta: Vec::new(),
                    bias_delta: Vec::new(),
                    dirty: DirtyBuffer::new(weight.granularity(), params.dirty_capacity),
                    steps: 0,
                })
            })
            .collect();

        Self {
            optimizer: Sgd::new(params.learning_rate, params.momentum, params.l2_penalty),
            flush_interval: params.flush_interval,
            weight,
            slots,
            forced_flushes: AtomicUsize::new(0),
        }
    }

    /// The canonical matrix this updater writes to.
    pub fn weight(&self) -> &Arc<SharedWeight> {
        &self.weight
    }

    pub fn num_threads(&self) -> usize {
        self.slots.len()
    }

    /// Number of flushes triggered by a full dirty buffer.
    pub fn forced_flushes(&self) -> usize {
        self.forced_flushes.load(Ordering::Relaxed)
    }

    /// Dirty entries currently staged by thread `tid`.
    pub fn dirty_len(&self, tid: usize) -> usize {
        self.slots[tid].lock().dirty.len()
    }

    /// Allocates the slot lazily and makes room in its dirty buffer.
    fn prepare(&self, tid: usize, slot: &mut ThreadDelta) {
        if slot.delta.is_empty() {
            slot.delta = vec![0.0; self.weight.rows() * self.weight.cols()];
            if self.weight.has_bias() {
                slot.bias_delta = vec![0.0; self.weight.rows()];
            }
        }
        if slot.dirty.is_full() {
            let rows = self.flush_slot(slot);
            self.forced_flushes.fetch_add(1, Ordering::Relaxed);
            debug!(tid, rows, "dirty buffer full, forced flush");
        }
    }

    /// Stages `scale · er ⊗ input` over every row.
    pub fn accumulate_outer(&self, tid: usize, er: &[f32], input: &[f32], scale: f32) {
        assert_eq!(er.len(), self.weight.rows(), "error length must equal weight rows");
        self.accumulate_rows(tid, 0, er, input, scale);
    }

    /// Stages `scale · er ⊗ input` over rows `row_start..row_start + er.len()`.
    /// Biases of those rows receive `scale · er`.
    pub fn accumulate_rows(&self, tid: usize, row_start: usize, er: &[f32], input: &[f32], scale: f32) {
        let cols = self.weight.cols();
        assert_eq!(input.len(), cols, "input length must equal weight cols");
        assert!(
            row_start + er.len() <= self.weight.rows(),
            "rows {}..{} out of range ({} rows)",
            row_start,
            row_start + er.len(),
            self.weight.rows()
        );

        let mut slot = self.slots[tid].lock();
        self.prepare(tid, &mut slot);
        let ThreadDelta {
            delta, bias_delta, ..
        } = &mut *slot;

        for (i, &e) in er.iter().enumerate() {
            if e == 0.0 {
                continue;
            }
            let row = row_start + i;
            let g = scale * e;
            for (d, &x) in delta[row * cols..(row + 1) * cols].iter_mut().zip(input) {
                *d += g * x;
            }
            if let Some(b) = bias_delta.get_mut(row) {
                *b += g;
            }
        }
        slot.dirty.mark_rows(row_start..row_start + er.len());
    }

    /// Stages `scale · values` into a single row. Biases are untouched.
    pub fn accumulate_row(&self, tid: usize, row: usize, values: &[f32], scale: f32) {
        let cols = self.weight.cols();
        assert_eq!(values.len(), cols, "values length must equal weight cols");
        assert!(row < self.weight.rows(), "row {} out of range", row);

        let mut slot = self.slots[tid].lock();
        self.prepare(tid, &mut slot);
        for (d, &v) in slot.delta[row * cols..(row + 1) * cols].iter_mut().zip(values) {
            *d += scale * v;
        }
        slot.dirty.mark_rows(row..row + 1);
    }

    /// Counts one step for `tid` and flushes every `flush_interval` steps.
    /// Returns the number of rows written.
    pub fn step(&self, tid: usize) -> usize {
        let mut slot = self.slots[tid].lock();
        slot.steps += 1;
        if self.flush_interval > 0 && slot.steps % self.flush_interval == 0 {
            self.flush_slot(&mut slot)
        } else {
            0
        }
    }

    /// Applies thread `tid`'s staged deltas. Returns the number of rows
    /// written; a flush with nothing staged returns 0 and changes nothing.
    pub fn flush(&self, tid: usize) -> usize {
        let mut slot = self.slots[tid].lock();
        self.flush_slot(&mut slot)
    }

    /// Flushes every thread slot.
    pub fn flush_all(&self) -> usize {
        (0..self.slots.len()).map(|tid| self.flush(tid)).sum()
    }

    fn flush_slot(&self, slot: &mut ThreadDelta) -> usize {
        if slot.dirty.is_empty() {
            return 0;
        }
        let cols = self.weight.cols();
        let with_velocity = self.optimizer.uses_velocity();
        let mut written = 0;

        for range in slot.dirty.row_ranges(self.weight.rows()) {
            let mut r = range.start;
            while r < range.end {
                let b = self.weight.block_of(r);
                let block_rows = self.weight.block_range(b);
                let end = block_rows.end.min(range.end);
                let local = (r - block_rows.start)..(end - block_rows.start);

                let mut guard = self.weight.write_block(b);
                let block = &mut *guard;
                if with_velocity && block.velocity.is_empty() {
                    block.velocity = vec![0.0; block.data.len()];
                    block.bias_velocity = vec![0.0; block.bias.len()];
                }

                let deltas = &mut slot.delta[r * cols..end * cols];
                let velocity: &mut [f32] = if block.velocity.is_empty() {
                    &mut []
                } else {
                    &mut block.velocity[local.start * cols..local.end * cols]
                };
                self.optimizer.update(
                    &mut block.data[local.start * cols..local.end * cols],
                    velocity,
                    deltas,
                    true,
                );
                deltas.fill(0.0);

                if !block.bias.is_empty() {
                    let deltas = &mut slot.bias_delta[r..end];
                    let velocity: &mut [f32] = if block.bias_velocity.is_empty() {
                        &mut []
                    } else {
                        &mut block.bias_velocity[local.clone()]
                    };
                    self.optimizer
                        .update(&mut block.bias[local.clone()], velocity, deltas, false);
                    deltas.fill(0.0);
                }

                written += end - r;
                r = end;
            }
        }

        slot.dirty.clear();
        trace!(rows = written, "flushed staged deltas");
        written
    }
}
