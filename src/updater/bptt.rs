//! Truncated backpropagation through time for one glue cycle.
//!
//! A cycle `[head, g1, …, gm]` runs the head from layer `s` (previous step)
//! into layer `d = L0`, then the path `L0 → L1 → … → Lm = s` within a step.
//! Each training step records the activations of `L0..Lm`, the head input
//! and the finalized error of `d`. Every `bptt_block` steps, and at sentence
//! end, the errors of the pending steps are carried back through at most
//! `bptt − 1` earlier steps: through the head into `s` of the step before,
//! then backwards along the path to `d` of that step, and so on. Errors that
//! would travel further are dropped.

use crate::component::Component;
use crate::glues::GlueKind;
use crate::layers::Activation;
use crate::updater::UpdaterTable;
use crate::utils::activations::clip_inplace;
use std::collections::VecDeque;

/// Replay counters of one buffer (or a sum of buffers).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BpttStats {
    /// Number of replays run.
    pub replays: usize,
    /// Steps from before the replayed block that errors were carried into.
    pub historical: usize,
    /// Largest distance, in steps, between a replayed error and the oldest
    /// step it reached.
    pub max_depth: usize,
}

impl BpttStats {
    pub fn merge(&mut self, other: &BpttStats) {
        self.replays += other.replays;
        self.historical += other.historical;
        self.max_depth = self.max_depth.max(other.max_depth);
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    /// Activations of `L0..Lm`.
    acs: Vec<Vec<f32>>,
    /// Previous-step activation of `s`, as read by the head.
    head_input: Vec<f32>,
    /// Finalized error of `d` from the step's own backward pass.
    own_er: Vec<f32>,
}

/// Everything a replay needs besides the recorded history.
pub(crate) struct Replay<'a> {
    pub comp: &'a Component,
    pub component: usize,
    pub table: &'a UpdaterTable,
    pub tid: usize,
    pub bptt: usize,
    pub cutoff: f32,
}

/// History of one cycle for the current sentence.
#[derive(Debug, Clone)]
pub struct BpttBuffer {
    cycle: Vec<usize>,
    /// `L0..Lm`
    layers: Vec<usize>,
    snapshots: VecDeque<Snapshot>,
    pending: usize,
    stats: BpttStats,
}

impl BpttBuffer {
    pub fn new(comp: &Component, cycle: &[usize]) -> Self {
        let glues = comp.glues();
        let layers = std::iter::once(glues[cycle[0]].dst)
            .chain(cycle[1..].iter().map(|&g| glues[g].dst))
            .collect();
        Self {
            cycle: cycle.to_vec(),
            layers,
            snapshots: VecDeque::new(),
            pending: 0,
            stats: BpttStats::default(),
        }
    }

    /// Drops the history; statistics are kept.
    pub fn reset(&mut self) {
        self.snapshots.clear();
        self.pending = 0;
    }

    /// Recorded steps.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Recorded steps whose own error has not been replayed yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn stats(&self) -> BpttStats {
        self.stats
    }

    /// Records the current step.
    pub fn push(&mut self, ac: &[Vec<f32>], prev_ac: &[Vec<f32>], er: &[Vec<f32>]) {
        let d = self.layers[0];
        let s = self.layers[self.layers.len() - 1];
        self.snapshots.push_back(Snapshot {
            acs: self.layers.iter().map(|&l| ac[l].clone()).collect(),
            head_input: prev_ac[s].clone(),
            own_er: er[d].clone(),
        });
        self.pending += 1;
    }

    /// Carries the pending errors back and trims the history to the last
    /// `bptt − 1` steps.
    pub(crate) fn replay(&mut self, ctx: &Replay<'_>) {
        let len = self.snapshots.len();
        if self.pending == 0 || len == 0 {
            return;
        }
        let block_start = len - self.pending;
        let oldest = block_start.saturating_sub(ctx.bptt.saturating_sub(1));

        let comp = ctx.comp;
        let head_idx = self.cycle[0];
        let head = &comp.glues()[head_idx];
        let d = self.layers[0];
        let m = self.layers.len() - 1;
        let head_scale = comp.in_scale(d);
        let head_updater = ctx.table.for_glue(ctx.component, head_idx);

        let mut carry: Option<Vec<f32>> = None;
        let mut k = len - 1;
        loop {
            let snap = &self.snapshots[k];
            let mut total = if k >= block_start {
                snap.own_er.clone()
            } else {
                vec![0.0; snap.own_er.len()]
            };
            if let Some(carry) = &carry {
                for (t, &c) in total.iter_mut().zip(carry) {
                    *t += c;
                }
                if let Some(updater) = head_updater {
                    let delta: Vec<f32> = carry[head.out_range()].iter().map(|e| e * head_scale).collect();
                    updater.accumulate_outer(ctx.tid, &delta, &snap.head_input, 1.0);
                }
            }
            if k == oldest {
                break;
            }

            let prev = &self.snapshots[k - 1];
            let mut errors: Vec<Vec<f32>> = prev.acs.iter().map(|a| vec![0.0; a.len()]).collect();
            let delta: Vec<f32> = total[head.out_range()].iter().map(|e| e * head_scale).collect();
            match head.kind {
                GlueKind::FullyConnected => {
                    let w = head.weight();
                    w.transpose_matvec_add(0..w.rows(), &delta, &mut errors[m]);
                }
                _ => {
                    for (e, &v) in errors[m].iter_mut().zip(&delta) {
                        *e += v;
                    }
                }
            }

            for j in (1..=m).rev() {
                let layer = self.layers[j];
                clip_inplace(&mut errors[j], ctx.cutoff);
                comp.layers()[layer].kind.derivate(&prev.acs[j], &mut errors[j]);

                let g = self.cycle[j];
                let glue = &comp.glues()[g];
                let scale = comp.in_scale(layer);
                let delta: Vec<f32> = errors[j][glue.out_range()].iter().map(|e| e * scale).collect();
                match glue.kind {
                    GlueKind::FullyConnected => {
                        if let Some(updater) = ctx.table.for_glue(ctx.component, g) {
                            updater.accumulate_outer(ctx.tid, &delta, &prev.acs[j - 1], 1.0);
                        }
                        let w = glue.weight();
                        w.transpose_matvec_add(0..w.rows(), &delta, &mut errors[j - 1]);
                    }
                    _ => {
                        for (e, &v) in errors[j - 1].iter_mut().zip(&delta) {
                            *e += v;
                        }
                    }
                }
            }

            clip_inplace(&mut errors[0], ctx.cutoff);
            comp.layers()[d].kind.derivate(&prev.acs[0], &mut errors[0]);
            carry = errors.into_iter().next();

            if k - 1 < block_start {
                self.stats.historical += 1;
            }
            k -= 1;
        }

        self.stats.replays += 1;
        self.stats.max_depth = self.stats.max_depth.max(len - 1 - oldest);
        self.pending = 0;
        let keep = ctx.bptt.saturating_sub(1);
        while self.snapshots.len() > keep {
            self.snapshots.pop_front();
        }
    }
}
