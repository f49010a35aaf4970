//! Per-thread execution context.
//!
//! An [`Updater`] owns private activation and error buffers for every
//! component of a model and drives the glue kernels over them, one token
//! at a time. With an [`UpdaterTable`] it also runs the backward pass and
//! stages weight gradients into its own thread slot; without one it only
//! computes log-probabilities.

pub mod bptt;
mod state;
mod table;

pub use bptt::{BpttBuffer, BpttStats};
pub use table::UpdaterTable;

use crate::glues::{direct, embedding, fc, output, GlueKind};
use crate::layers::INPUT_LAYER;
use crate::model::Model;
use crate::output::OutputState;
use crate::vocab::{WordId, SENT_END_ID};
use bptt::Replay;
use state::ComponentState;

/// Per-thread training options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdaterOptions {
    /// Steps an error may travel back through a glue cycle, counting the
    /// current one. 1 disables history replay.
    pub bptt: usize,
    /// Steps between history replays.
    pub bptt_block: usize,
    /// Errors are clipped to `±error_cutoff`; non-positive disables clipping.
    pub error_cutoff: f32,
}

impl Default for UpdaterOptions {
    fn default() -> Self {
        Self {
            bptt: 1,
            bptt_block: 1,
            error_cutoff: 50.0,
        }
    }
}

/// Forward/backward driver over private buffers for one thread.
pub struct Updater<'a> {
    model: &'a Model,
    table: Option<&'a UpdaterTable>,
    tid: usize,
    opts: UpdaterOptions,
    states: Vec<ComponentState>,
    output: OutputState,
    /// Tokens of the current sentence seen so far.
    history: Vec<WordId>,
}

impl<'a> Updater<'a> {
    /// Allocates buffers for every layer of every component of `model`.
    /// `table` enables training for thread slot `tid`.
    pub fn new(model: &'a Model, table: Option<&'a UpdaterTable>, tid: usize, opts: UpdaterOptions) -> Self {
        Self {
            model,
            table,
            tid,
            opts,
            states: model.components().iter().map(ComponentState::new).collect(),
            output: OutputState::new(model.output_tree()),
            history: Vec::new(),
        }
    }

    pub fn is_training(&self) -> bool {
        self.table.is_some()
    }

    /// Prepares for a new sentence.
    pub fn reset(&mut self) {
        self.history.clear();
        for state in &mut self.states {
            state.reset();
        }
    }

    /// Runs every component on the current context and returns the natural
    /// log-probability of `target`.
    pub fn forward(&mut self, target: WordId) -> f64 {
        let model = self.model;
        for (c, comp) in model.components().iter().enumerate() {
            let st = &mut self.states[c];
            st.begin_forward(comp, &self.history);

            for &g in comp.forward_order() {
                let glue = &comp.glues()[g];
                if glue.kind == GlueKind::Output {
                    continue;
                }
                let head = comp.is_head(g);
                if !head && glue.src != INPUT_LAYER {
                    st.finalize(comp, glue.src);
                }

                let mut dst = std::mem::take(&mut st.ac[glue.dst]);
                let out = &mut dst[glue.out_range()];
                let src: &[f32] = if head {
                    &st.prev_ac[glue.src]
                } else {
                    &st.ac[glue.src]
                };
                match glue.kind {
                    GlueKind::Direct => direct::forward(src, out),
                    GlueKind::FullyConnected => fc::forward(glue.weight(), src, out),
                    GlueKind::Embedding => {
                        embedding::forward(glue.weight(), &st.context, comp.input().combine, out)
                    }
                    GlueKind::Output => {}
                }
                st.ac[glue.dst] = dst;
            }
            for l in INPUT_LAYER + 1..comp.layers().len() {
                st.finalize(comp, l);
            }
        }

        self.output.start(model.output_tree(), target);
        for (c, comp) in model.components().iter().enumerate() {
            let st = &self.states[c];
            for glue in comp.glues().iter().filter(|g| g.kind == GlueKind::Output) {
                for level in self.output.levels_mut() {
                    output::forward(
                        glue.weight(),
                        level.rows.clone(),
                        &st.ac[glue.src],
                        &mut level.probs,
                        comp.scale(),
                    );
                }
            }
        }
        self.output.finish();
        self.output.logprob()
    }

    /// Propagates the output errors of the last [`Updater::forward`] and
    /// stages weight gradients. Does nothing without a table.
    pub fn backward(&mut self) {
        let Some(table) = self.table else {
            return;
        };
        let model = self.model;
        let tid = self.tid;
        let cutoff = self.opts.error_cutoff;

        for (c, comp) in model.components().iter().enumerate() {
            let st = &mut self.states[c];
            st.begin_backward();

            for (g, glue) in comp.glues().iter().enumerate() {
                if glue.kind != GlueKind::Output {
                    continue;
                }
                let train = table.for_glue(c, g).map(|u| (u, tid));
                for level in self.output.levels() {
                    output::backward(
                        glue.weight(),
                        train,
                        level.rows.clone(),
                        &level.errors,
                        &st.ac[glue.src],
                        &mut st.er[glue.src],
                        comp.scale(),
                    );
                }
            }

            for &g in comp.forward_order().iter().rev() {
                let glue = &comp.glues()[g];
                if glue.kind == GlueKind::Output {
                    continue;
                }
                st.finalize_error(comp, glue.dst, cutoff);
                st.load_delta(comp, glue.dst, glue.out_range());

                let head = comp.is_head(g);
                let train = table.for_glue(c, g).map(|u| (u, tid));
                match glue.kind {
                    GlueKind::Direct => {
                        if !head {
                            direct::backward(&st.delta, &mut st.er[glue.src]);
                        }
                    }
                    GlueKind::FullyConnected => {
                        let (input, src_er) = if head {
                            (&st.prev_ac[glue.src], None)
                        } else {
                            (&st.ac[glue.src], Some(&mut st.er[glue.src][..]))
                        };
                        fc::backward(glue.weight(), train, &st.delta, input, src_er);
                    }
                    GlueKind::Embedding => {
                        if let Some((updater, tid)) = train {
                            embedding::backward(updater, tid, &st.context, comp.input().combine, &st.delta);
                        }
                    }
                    GlueKind::Output => {}
                }
            }
        }
    }

    /// Closes the step for `target`: records and replays recurrent
    /// history, shifts the recurrent state and counts the step.
    pub fn end_step(&mut self, target: WordId) {
        if let Some(table) = self.table {
            if self.opts.bptt > 1 {
                let model = self.model;
                for (c, comp) in model.components().iter().enumerate() {
                    let st = &mut self.states[c];
                    let replay = Replay {
                        comp,
                        component: c,
                        table,
                        tid: self.tid,
                        bptt: self.opts.bptt,
                        cutoff: self.opts.error_cutoff,
                    };
                    for buffer in &mut st.bptt {
                        buffer.push(&st.ac, &st.prev_ac, &st.er);
                        if buffer.pending() >= self.opts.bptt_block {
                            buffer.replay(&replay);
                        }
                    }
                }
            }
            table.step(self.tid);
        }
        for st in &mut self.states {
            st.shift();
        }
        self.history.push(target);
    }

    /// Replays what is left of the sentence's recurrent history.
    pub fn end_sentence(&mut self) {
        let Some(table) = self.table else {
            return;
        };
        let model = self.model;
        for (c, comp) in model.components().iter().enumerate() {
            let replay = Replay {
                comp,
                component: c,
                table,
                tid: self.tid,
                bptt: self.opts.bptt,
                cutoff: self.opts.error_cutoff,
            };
            for buffer in &mut self.states[c].bptt {
                buffer.replay(&replay);
            }
        }
    }

    /// Processes `words` followed by `</s>` and returns the log-probability
    /// of every token. Trains when a table is set.
    pub fn process_sentence(&mut self, words: &[WordId]) -> Vec<f64> {
        self.reset();
        let mut logps = Vec::with_capacity(words.len() + 1);
        for &target in words.iter().chain(std::iter::once(&SENT_END_ID)) {
            logps.push(self.forward(target));
            self.backward();
            self.end_step(target);
        }
        self.end_sentence();
        logps
    }

    /// Flushes this thread's staged deltas on every weight.
    pub fn flush(&self) -> usize {
        self.table.map_or(0, |table| table.flush(self.tid))
    }

    /// Replay counters summed over every cycle.
    pub fn bptt_stats(&self) -> BpttStats {
        let mut stats = BpttStats::default();
        for buffer in self.states.iter().flat_map(|st| &st.bptt) {
            stats.merge(&buffer.stats());
        }
        stats
    }

    /// Largest history currently held by any cycle buffer.
    pub fn bptt_history_len(&self) -> usize {
        self.states
            .iter()
            .flat_map(|st| &st.bptt)
            .map(BpttBuffer::len)
            .max()
            .unwrap_or(0)
    }
}
