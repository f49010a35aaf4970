//! Components: named sub-graphs of layers and glues.
//!
//! A component is built once through [`ComponentBuilder`], which validates
//! the topology, creates (or ties) weights, finds or checks glue cycles and
//! caches the forward order. After construction the structure is read-only;
//! only the canonical weights behind the glues change during training.

use crate::error::{LmError, Result};
use crate::glues::{embedding, Glue, GlueKind};
use crate::graph::{self, Edge};
use crate::layers::{Combine, Layer, LayerKind, INPUT_LAYER, OUTPUT_LAYER};
use crate::utils::SimpleRng;
use crate::weights::{SharedWeight, UpdateGranularity, WeightStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

/// Which previous words feed the embedding glues, and how they are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Negative offsets relative to the predicted position, e.g. `[-2, -1]`.
    pub context: Vec<i32>,
    #[serde(default)]
    pub combine: Combine,
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            context: vec![-1],
            combine: Combine::Sum,
        }
    }
}

/// Description of one glue to be built.
#[derive(Debug, Clone)]
pub struct GlueSpec {
    pub name: String,
    pub kind: GlueKind,
    pub src: String,
    pub dst: String,
    /// Embedding width per word, or output width of a fully-connected glue.
    pub size: Option<usize>,
    /// Update granularity override.
    pub update: Option<UpdateGranularity>,
    /// Earlier glue whose weight is shared.
    pub tie: Option<String>,
    /// Preset weight (loaded models); random initialization otherwise.
    pub weight: Option<WeightStore>,
}

impl GlueSpec {
    pub fn new(
        name: impl Into<String>,
        kind: GlueKind,
        src: impl Into<String>,
        dst: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            src: src.into(),
            dst: dst.into(),
            size: None,
            update: None,
            tie: None,
            weight: None,
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn update(mut self, update: UpdateGranularity) -> Self {
        self.update = Some(update);
        self
    }

    pub fn tie(mut self, target: impl Into<String>) -> Self {
        self.tie = Some(target.into());
        self
    }
}

/// Collects layers and glues, then validates them into a [`Component`].
#[derive(Debug, Clone)]
pub struct ComponentBuilder {
    name: String,
    scale: f32,
    output_size: usize,
    vocab_size: usize,
    input: InputSpec,
    layers: Vec<Layer>,
    glues: Vec<GlueSpec>,
    cycles: Option<Vec<Vec<String>>>,
}

impl ComponentBuilder {
    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn set_input(mut self, context: Vec<i32>, combine: Combine) -> Self {
        self.input = InputSpec { context, combine };
        self
    }

    pub fn add_layer(mut self, name: impl Into<String>, size: usize, kind: LayerKind, combine: Combine) -> Self {
        self.layers.push(Layer::new(name, size, kind, combine));
        self
    }

    pub fn add_glue(mut self, glue: GlueSpec) -> Self {
        self.glues.push(glue);
        self
    }

    /// Declares the glue cycles by glue name instead of detecting them.
    /// Each cycle lists its head first, then the forward path.
    pub fn with_cycles(mut self, cycles: Vec<Vec<String>>) -> Self {
        self.cycles = Some(cycles);
        self
    }

    /// Validates the description and builds the component.
    pub fn build(self, rng: &mut SimpleRng) -> Result<Component> {
        let name = self.name.clone();
        if self.glues.is_empty() {
            return Err(LmError::topology(format!("component '{}' has no glues", name)));
        }
        self.check_input()?;

        let layers = self.build_layers()?;
        let index: HashMap<&str, usize> = layers
            .iter()
            .enumerate()
            .map(|(i, l)| (l.name.as_str(), i))
            .collect();

        let mut glues: Vec<Glue> = Vec::with_capacity(self.glues.len());
        let mut seen = HashSet::new();
        for spec in &self.glues {
            if !seen.insert(spec.name.as_str()) {
                return Err(LmError::topology(format!(
                    "duplicate glue '{}' in component '{}'",
                    spec.name, name
                )));
            }
            let glue = self.build_glue(spec, &layers, &index, &glues, rng)?;
            glues.push(glue);
        }
        assign_offsets(&name, &layers, &mut glues)?;

        if !glues.iter().any(|g| g.kind == GlueKind::Output) {
            return Err(LmError::topology(format!(
                "component '{}' has no output glue",
                name
            )));
        }

        let edges: Vec<Edge> = glues.iter().map(|g| (g.src, g.dst)).collect();
        check_reachable(&name, &layers, &edges)?;

        let cycles = match &self.cycles {
            Some(named) => named
                .iter()
                .map(|cycle| {
                    cycle
                        .iter()
                        .map(|g| {
                            glues.iter().position(|x| &x.name == g).ok_or_else(|| {
                                LmError::cycle(&name, format!("unknown glue '{}' in cycle", g))
                            })
                        })
                        .collect::<Result<Vec<usize>>>()
                })
                .collect::<Result<Vec<_>>>()?,
            None => graph::find_cycles(layers.len(), &edges, INPUT_LAYER),
        };
        graph::check_glue_cycles(&name, layers.len(), &edges, &cycles)?;
        for &g in cycles.iter().flatten() {
            if !glues[g].kind.may_recur() {
                return Err(LmError::cycle(
                    &name,
                    format!("{} glue '{}' cannot be part of a cycle", glues[g].kind, glues[g].name),
                ));
            }
        }
        let forward_order = graph::sort_glues(&name, layers.len(), &edges, &cycles)?;

        Ok(Component::assemble(
            name,
            self.scale,
            self.input,
            layers,
            glues,
            cycles,
            forward_order,
        ))
    }

    fn check_input(&self) -> Result<()> {
        if self.input.context.is_empty() {
            return Err(LmError::topology(format!(
                "component '{}' has an empty input context",
                self.name
            )));
        }
        if let Some(&offset) = self.input.context.iter().find(|&&o| o >= 0) {
            return Err(LmError::topology(format!(
                "input context offset {} must be negative",
                offset
            )));
        }
        Ok(())
    }

    fn build_layers(&self) -> Result<Vec<Layer>> {
        let mut layers = vec![
            Layer::new("output", self.output_size, LayerKind::Output, Combine::Sum),
            Layer::new("input", self.vocab_size, LayerKind::Input, Combine::Sum),
        ];
        for layer in &self.layers {
            if layer.is_structural() {
                return Err(LmError::topology(format!(
                    "layer '{}' cannot use reserved type {}",
                    layer.name, layer.kind
                )));
            }
            if layer.size == 0 {
                return Err(LmError::topology(format!("layer '{}' has size 0", layer.name)));
            }
            if layers.iter().any(|l| l.name == layer.name) {
                return Err(LmError::topology(format!(
                    "duplicate layer '{}' in component '{}'",
                    layer.name, self.name
                )));
            }
            layers.push(layer.clone());
        }
        Ok(layers)
    }

    fn build_glue(
        &self,
        spec: &GlueSpec,
        layers: &[Layer],
        index: &HashMap<&str, usize>,
        built: &[Glue],
        rng: &mut SimpleRng,
    ) -> Result<Glue> {
        let lookup = |layer: &str| {
            index.get(layer).copied().ok_or_else(|| {
                LmError::topology(format!("glue '{}' refers to unknown layer '{}'", spec.name, layer))
            })
        };
        let src = lookup(&spec.src)?;
        let dst = lookup(&spec.dst)?;

        let endpoints_ok = match spec.kind {
            GlueKind::Embedding => src == INPUT_LAYER && dst > INPUT_LAYER,
            GlueKind::Output => src > INPUT_LAYER && dst == OUTPUT_LAYER,
            GlueKind::Direct | GlueKind::FullyConnected => src > INPUT_LAYER && dst > INPUT_LAYER,
        };
        if !endpoints_ok {
            return Err(LmError::topology(format!(
                "{} glue '{}' cannot connect '{}' to '{}'",
                spec.kind, spec.name, spec.src, spec.dst
            )));
        }

        let dst_layer = &layers[dst];
        let context_len = self.input.context.len();
        let (out_size, shape) = match spec.kind {
            GlueKind::Direct => (layers[src].size, None),
            GlueKind::FullyConnected => {
                let out = spec.size.unwrap_or(dst_layer.size);
                (out, Some((out, layers[src].size)))
            }
            GlueKind::Embedding => {
                let width = match spec.size {
                    Some(width) => width,
                    None if self.input.combine == Combine::Concat => {
                        if dst_layer.size % context_len != 0 {
                            return Err(LmError::shape_mismatch(
                                format!("embedding glue '{}' width", spec.name),
                                context_len * (dst_layer.size / context_len).max(1),
                                dst_layer.size,
                            ));
                        }
                        dst_layer.size / context_len
                    }
                    None => dst_layer.size,
                };
                let out = embedding::out_width(width, context_len, self.input.combine);
                (out, Some((self.vocab_size, width)))
            }
            GlueKind::Output => (self.output_size, Some((self.output_size, layers[src].size))),
        };

        let weight = match shape {
            None => None,
            Some((rows, cols)) => Some(self.build_weight(spec, rows, cols, built, rng)?),
        };

        Ok(Glue {
            name: spec.name.clone(),
            kind: spec.kind,
            src,
            dst,
            weight,
            tie: spec.tie.clone(),
            out_offset: 0,
            out_size,
        })
    }

    fn build_weight(
        &self,
        spec: &GlueSpec,
        rows: usize,
        cols: usize,
        built: &[Glue],
        rng: &mut SimpleRng,
    ) -> Result<Arc<SharedWeight>> {
        if let Some(target) = &spec.tie {
            let tied = built.iter().find(|g| &g.name == target).ok_or_else(|| {
                LmError::topology(format!(
                    "glue '{}' ties to unknown or later glue '{}'",
                    spec.name, target
                ))
            })?;
            let weight = match (&tied.weight, tied.kind == spec.kind) {
                (Some(weight), true) => weight,
                _ => {
                    return Err(LmError::topology(format!(
                        "glue '{}' cannot tie to {} glue '{}'",
                        spec.name, tied.kind, target
                    )))
                }
            };
            if weight.rows() != rows || weight.cols() != cols {
                return Err(LmError::shape_mismatch(
                    format!("tied glue '{}'", spec.name),
                    weight.rows() * weight.cols(),
                    rows * cols,
                ));
            }
            return Ok(Arc::clone(weight));
        }

        let store = match &spec.weight {
            Some(store) => {
                if store.rows() != rows {
                    return Err(LmError::shape_mismatch(
                        format!("glue '{}' weight rows", spec.name),
                        rows,
                        store.rows(),
                    ));
                }
                if store.cols() != cols {
                    return Err(LmError::shape_mismatch(
                        format!("glue '{}' weight cols", spec.name),
                        cols,
                        store.cols(),
                    ));
                }
                store.clone()
            }
            None => {
                let mut store = WeightStore::new(rows, cols, spec.kind.has_bias())?;
                store.init_uniform(rng);
                store
            }
        };
        let granularity = spec
            .update
            .or_else(|| spec.kind.default_granularity())
            .unwrap_or(UpdateGranularity::Full);
        Ok(Arc::new(SharedWeight::new(store, granularity)))
    }
}

/// Places every glue inside its destination layer.
fn assign_offsets(component: &str, layers: &[Layer], glues: &mut [Glue]) -> Result<()> {
    for (l, layer) in layers.iter().enumerate().skip(INPUT_LAYER + 1) {
        let mut offset = 0;
        for glue in glues.iter_mut().filter(|g| g.dst == l) {
            match layer.combine {
                Combine::Concat => {
                    glue.out_offset = offset;
                    offset += glue.out_size;
                }
                Combine::Sum | Combine::Avg => {
                    if glue.out_size != layer.size {
                        return Err(LmError::shape_mismatch(
                            format!("glue '{}' into layer '{}'", glue.name, layer.name),
                            layer.size,
                            glue.out_size,
                        ));
                    }
                }
            }
        }
        if layer.combine == Combine::Concat && offset != layer.size {
            return Err(LmError::shape_mismatch(
                format!("concatenated inputs of layer '{}' in '{}'", layer.name, component),
                layer.size,
                offset,
            ));
        }
    }
    Ok(())
}

fn check_reachable(component: &str, layers: &[Layer], edges: &[Edge]) -> Result<()> {
    let mut reached = vec![false; layers.len()];
    reached[INPUT_LAYER] = true;
    let mut queue = VecDeque::from([INPUT_LAYER]);
    while let Some(layer) = queue.pop_front() {
        for &(src, dst) in edges {
            if src == layer && !reached[dst] {
                reached[dst] = true;
                queue.push_back(dst);
            }
        }
    }
    match reached.iter().position(|&r| !r) {
        Some(l) => Err(LmError::topology(format!(
            "layer '{}' in component '{}' is not reachable from the input",
            layers[l].name, component
        ))),
        None => Ok(()),
    }
}

/// A validated sub-graph with its cached forward order.
#[derive(Debug, Clone)]
pub struct Component {
    name: String,
    scale: f32,
    input: InputSpec,
    layers: Vec<Layer>,
    glues: Vec<Glue>,
    cycles: Vec<Vec<usize>>,
    forward_order: Vec<usize>,
    heads: Vec<bool>,
    in_scale: Vec<f32>,
}

impl Component {
    /// Starts a component whose output layer has `output_size` units
    /// (output-tree nodes) and whose input layer spans `vocab_size` words.
    pub fn builder(name: impl Into<String>, output_size: usize, vocab_size: usize) -> ComponentBuilder {
        ComponentBuilder {
            name: name.into(),
            scale: 1.0,
            output_size,
            vocab_size,
            input: InputSpec::default(),
            layers: Vec::new(),
            glues: Vec::new(),
            cycles: None,
        }
    }

    fn assemble(
        name: String,
        scale: f32,
        input: InputSpec,
        layers: Vec<Layer>,
        glues: Vec<Glue>,
        cycles: Vec<Vec<usize>>,
        forward_order: Vec<usize>,
    ) -> Self {
        let heads = graph::head_mask(glues.len(), &cycles);
        let in_scale = layers
            .iter()
            .enumerate()
            .map(|(l, layer)| match layer.combine {
                Combine::Avg => {
                    let writers = glues.iter().filter(|g| g.dst == l).count();
                    1.0 / writers.max(1) as f32
                }
                Combine::Sum | Combine::Concat => 1.0,
            })
            .collect();
        Self {
            name,
            scale,
            input,
            layers,
            glues,
            cycles,
            forward_order,
            heads,
            in_scale,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Weight of this component's contribution to the output logits.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn input(&self) -> &InputSpec {
        &self.input
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn glues(&self) -> &[Glue] {
        &self.glues
    }

    /// Glue cycles, each `[head, g1, …, gm]`.
    pub fn cycles(&self) -> &[Vec<usize>] {
        &self.cycles
    }

    /// Glue indices in dependency order.
    pub fn forward_order(&self) -> &[usize] {
        &self.forward_order
    }

    /// True when glue `g` closes a cycle and reads the previous step.
    pub fn is_head(&self, g: usize) -> bool {
        self.heads[g]
    }

    /// Factor applied to the summed contributions of layer `l`.
    pub fn in_scale(&self, l: usize) -> f32 {
        self.in_scale[l]
    }

    /// Copy of this component with fresh weights holding the same values.
    /// Ties inside the component are preserved.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        let mut fresh: Vec<(*const SharedWeight, Arc<SharedWeight>)> = Vec::new();
        for glue in &mut copy.glues {
            if let Some(weight) = &glue.weight {
                let key = Arc::as_ptr(weight);
                let new = match fresh.iter().find(|(k, _)| *k == key) {
                    Some((_, w)) => Arc::clone(w),
                    None => {
                        let w = Arc::new(SharedWeight::new(weight.snapshot(), weight.granularity()));
                        fresh.push((key, Arc::clone(&w)));
                        w
                    }
                };
                glue.weight = Some(new);
            }
        }
        copy
    }

    /// Graphviz description of the component.
    pub fn draw(&self) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", self.name);
        for (l, layer) in self.layers.iter().enumerate() {
            let _ = writeln!(
                dot,
                "  l{} [label=\"{} ({} {})\"];",
                l, layer.name, layer.kind, layer.size
            );
        }
        for (g, glue) in self.glues.iter().enumerate() {
            let style = if self.heads[g] { ", style=dashed" } else { "" };
            let _ = writeln!(
                dot,
                "  l{} -> l{} [label=\"{}: {}\"{}];",
                glue.src,
                glue.dst,
                glue.name,
                glue.label(),
                style
            );
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rnn_builder() -> ComponentBuilder {
        Component::builder("rnn", 6, 5)
            .add_layer("hidden", 4, LayerKind::Sigmoid, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "hidden"))
            .add_glue(GlueSpec::new("rec", GlueKind::FullyConnected, "hidden", "hidden"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "hidden", "output"))
    }

    #[test]
    fn test_rnn_cycle_is_detected() {
        let comp = rnn_builder().build(&mut SimpleRng::new(1)).unwrap();
        assert_eq!(comp.cycles(), &[vec![1]]);
        assert!(comp.is_head(1));
        assert_eq!(comp.forward_order().last(), Some(&2));

        let emb = comp.glues()[0].weight();
        assert_eq!((emb.rows(), emb.cols()), (5, 4));
        assert_eq!(emb.granularity(), UpdateGranularity::OneShot);
        assert_eq!(comp.glues()[2].weight().granularity(), UpdateGranularity::Part);
    }

    #[test]
    fn test_declared_cycles_are_validated() {
        let ok = rnn_builder()
            .with_cycles(vec![vec!["rec".to_string()]])
            .build(&mut SimpleRng::new(1));
        assert!(ok.is_ok());

        let err = rnn_builder()
            .with_cycles(Vec::new())
            .build(&mut SimpleRng::new(1))
            .unwrap_err();
        assert!(matches!(err, LmError::Cycle { .. }));
    }

    #[test]
    fn test_concat_widths_must_fill_layer() {
        let base = Component::builder("c", 4, 5)
            .set_input(vec![-2, -1], Combine::Concat)
            .add_layer("proj", 6, LayerKind::Linear, Combine::Concat)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "proj").size(3))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "proj", "output"));
        let comp = base.clone().build(&mut SimpleRng::new(3)).unwrap();
        assert_eq!(comp.glues()[0].out_range(), 0..6);

        let bad = Component::builder("c", 4, 5)
            .set_input(vec![-2, -1], Combine::Concat)
            .add_layer("proj", 7, LayerKind::Linear, Combine::Concat)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "proj").size(3))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "proj", "output"))
            .build(&mut SimpleRng::new(3));
        assert!(matches!(bad, Err(LmError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_structural_errors() {
        let mut rng = SimpleRng::new(1);
        let no_glues = Component::builder("c", 4, 5).build(&mut rng);
        assert!(no_glues.is_err());

        let wrong_src = Component::builder("c", 4, 5)
            .add_layer("h", 2, LayerKind::Tanh, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "h", "h"))
            .build(&mut rng);
        assert!(wrong_src.unwrap_err().is_structural());

        let unreachable = Component::builder("c", 4, 5)
            .add_layer("h", 2, LayerKind::Tanh, Combine::Sum)
            .add_layer("island", 2, LayerKind::Tanh, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "h"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "h", "output"))
            .build(&mut rng);
        assert!(unreachable.is_err());

        let positive_context = rnn_builder().set_input(vec![1], Combine::Sum).build(&mut rng);
        assert!(positive_context.is_err());
    }

    #[test]
    fn test_tie_shares_weight() {
        let comp = Component::builder("c", 4, 5)
            .add_layer("a", 3, LayerKind::Tanh, Combine::Sum)
            .add_layer("b", 3, LayerKind::Tanh, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "a"))
            .add_glue(GlueSpec::new("ab", GlueKind::FullyConnected, "a", "b"))
            .add_glue(GlueSpec::new("bb", GlueKind::FullyConnected, "b", "b").tie("ab"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "b", "output"))
            .build(&mut SimpleRng::new(5))
            .unwrap();
        let ab = comp.glues()[1].weight.as_ref().unwrap();
        let bb = comp.glues()[2].weight.as_ref().unwrap();
        assert!(Arc::ptr_eq(ab, bb));

        let copy = comp.duplicate();
        let ab2 = copy.glues()[1].weight.as_ref().unwrap();
        let bb2 = copy.glues()[2].weight.as_ref().unwrap();
        assert!(Arc::ptr_eq(ab2, bb2));
        assert!(!Arc::ptr_eq(ab, ab2));
        assert_eq!(ab.snapshot(), ab2.snapshot());
    }

    #[test]
    fn test_draw_marks_recurrent_glues() {
        let comp = rnn_builder().build(&mut SimpleRng::new(1)).unwrap();
        let dot = comp.draw();
        assert!(dot.starts_with("digraph \"rnn\""));
        assert!(dot.contains("l2 -> l2 [label=\"rec: fc 4x4\", style=dashed]"));
    }
}
