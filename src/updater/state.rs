//! Private per-thread buffers of one component.

use crate::component::Component;
use crate::layers::{Activation, INPUT_LAYER};
use crate::updater::bptt::BpttBuffer;
use crate::utils::activations::clip_inplace;
use crate::vocab::{WordId, SENT_END_ID};

/// Activations and errors of every layer of one component, owned by a
/// single updater thread.
#[derive(Debug)]
pub(crate) struct ComponentState {
    /// Current step. Structural layers hold empty vectors.
    pub ac: Vec<Vec<f32>>,
    pub er: Vec<Vec<f32>>,
    /// Previous step; read by cycle heads. Zero at sentence start.
    pub prev_ac: Vec<Vec<f32>>,
    ac_ready: Vec<bool>,
    er_ready: Vec<bool>,
    /// Context word ids for the current position.
    pub context: Vec<WordId>,
    /// Scratch buffer for the error slice passed through one glue.
    pub delta: Vec<f32>,
    /// One history buffer per glue cycle.
    pub bptt: Vec<BpttBuffer>,
}

impl ComponentState {
    pub fn new(comp: &Component) -> Self {
        let sizes: Vec<usize> = comp
            .layers()
            .iter()
            .map(|l| if l.is_structural() { 0 } else { l.size })
            .collect();
        let buffers = || sizes.iter().map(|&n| vec![0.0f32; n]).collect::<Vec<_>>();
        let max_width = sizes.iter().copied().max().unwrap_or(0);
        Self {
            ac: buffers(),
            er: buffers(),
            prev_ac: buffers(),
            ac_ready: vec![false; sizes.len()],
            er_ready: vec![false; sizes.len()],
            context: Vec::with_capacity(comp.input().context.len()),
            delta: Vec::with_capacity(max_width),
            bptt: comp
                .cycles()
                .iter()
                .map(|cycle| BpttBuffer::new(comp, cycle))
                .collect(),
        }
    }

    /// Clears recurrent state and history at a sentence start.
    pub fn reset(&mut self) {
        for buf in &mut self.prev_ac {
            buf.fill(0.0);
        }
        for buffer in &mut self.bptt {
            buffer.reset();
        }
    }

    /// Zeroes the activations and resolves the context of position
    /// `history.len()`. Missing left context is `</s>`.
    pub fn begin_forward(&mut self, comp: &Component, history: &[WordId]) {
        for buf in &mut self.ac {
            buf.fill(0.0);
        }
        self.ac_ready.fill(false);
        self.ac_ready[INPUT_LAYER] = true;

        let pos = history.len() as i64;
        self.context.clear();
        self.context.extend(comp.input().context.iter().map(|&offset| {
            let at = pos + offset as i64;
            if at < 0 {
                SENT_END_ID
            } else {
                history[at as usize]
            }
        }));
    }

    pub fn begin_backward(&mut self) {
        for buf in &mut self.er {
            buf.fill(0.0);
        }
        self.er_ready.fill(false);
    }

    /// Scales and activates layer `l` once all its glues have written.
    pub fn finalize(&mut self, comp: &Component, l: usize) {
        if self.ac_ready[l] {
            return;
        }
        let scale = comp.in_scale(l);
        if scale != 1.0 {
            self.ac[l].iter_mut().for_each(|v| *v *= scale);
        }
        comp.layers()[l].kind.activate(&mut self.ac[l]);
        self.ac_ready[l] = true;
    }

    /// Clips and differentiates the error of layer `l` once every glue
    /// reading it has propagated.
    pub fn finalize_error(&mut self, comp: &Component, l: usize, cutoff: f32) {
        if self.er_ready[l] {
            return;
        }
        clip_inplace(&mut self.er[l], cutoff);
        comp.layers()[l].kind.derivate(&self.ac[l], &mut self.er[l]);
        self.er_ready[l] = true;
    }

    /// Copies `er[l][range] · in_scale(l)` into the scratch buffer.
    pub fn load_delta(&mut self, comp: &Component, l: usize, range: std::ops::Range<usize>) {
        let scale = comp.in_scale(l);
        self.delta.clear();
        self.delta.extend(self.er[l][range].iter().map(|e| e * scale));
    }

    /// Makes the current activations the previous step's.
    pub fn shift(&mut self) {
        std::mem::swap(&mut self.ac, &mut self.prev_ac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::GlueSpec;
    use crate::glues::GlueKind;
    use crate::layers::{Combine, LayerKind};
    use crate::utils::SimpleRng;

    fn component() -> Component {
        Component::builder("c", 3, 6)
            .set_input(vec![-3, -1], Combine::Concat)
            .add_layer("h", 4, LayerKind::Linear, Combine::Avg)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "h").size(2))
            .add_glue(GlueSpec::new("rec", GlueKind::FullyConnected, "h", "h"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "h", "output"))
            .build(&mut SimpleRng::new(1))
            .unwrap()
    }

    #[test]
    fn test_context_padding() {
        let comp = component();
        let mut state = ComponentState::new(&comp);
        state.begin_forward(&comp, &[]);
        assert_eq!(state.context, vec![SENT_END_ID, SENT_END_ID]);
        state.begin_forward(&comp, &[4, 5]);
        assert_eq!(state.context, vec![SENT_END_ID, 5]);
        state.begin_forward(&comp, &[3, 4, 5]);
        assert_eq!(state.context, vec![3, 5]);
    }

    #[test]
    fn test_finalize_applies_average_once() {
        let comp = component();
        let mut state = ComponentState::new(&comp);
        state.begin_forward(&comp, &[]);
        state.ac[2] = vec![2.0; 4];
        state.finalize(&comp, 2);
        state.finalize(&comp, 2);
        assert_eq!(state.ac[2], vec![1.0; 4]);
        assert!(state.ac[0].is_empty() && state.ac[1].is_empty());
        assert_eq!(state.bptt.len(), 1);
    }

    #[test]
    fn test_shift_and_reset() {
        let comp = component();
        let mut state = ComponentState::new(&comp);
        state.ac[2] = vec![0.5; 4];
        state.shift();
        assert_eq!(state.prev_ac[2], vec![0.5; 4]);
        state.reset();
        assert_eq!(state.prev_ac[2], vec![0.0; 4]);
    }
}
