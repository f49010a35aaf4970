//! Network model: vocabulary, output tree and components.
//!
//! The model owns the static topology and the canonical weights. During
//! training it is shared read-only behind an `Arc` by every worker thread;
//! only the weights behind the glues change.

pub mod io;

pub use io::{ModelFormat, WeightEncoding};

use crate::component::{Component, ComponentBuilder};
use crate::error::{LmError, Result};
use crate::layers::{INPUT_LAYER, OUTPUT_LAYER};
use crate::output::OutputTree;
use crate::topology::TopologyConfig;
use crate::updater::{Updater, UpdaterOptions};
use crate::utils::SimpleRng;
use crate::vocab::{Vocab, Vocabulary, WordId};
use crate::weights::SharedWeight;
use std::sync::Arc;
use tracing::{debug, warn};

/// A neural language model.
#[derive(Debug, Clone)]
pub struct Model {
    vocab: Arc<Vocab>,
    output: Arc<OutputTree>,
    components: Vec<Component>,
}

impl Model {
    /// Empty model over `vocab` with a balanced output tree. A `max_branch`
    /// of `None` gives a flat softmax.
    pub fn new(vocab: Vocab, max_branch: Option<usize>) -> Result<Self> {
        let branch = max_branch.unwrap_or_else(|| vocab.size().max(2));
        let output = OutputTree::balanced(vocab.size(), branch)?;
        Ok(Self::with_tree(Arc::new(vocab), Arc::new(output)))
    }

    pub fn with_tree(vocab: Arc<Vocab>, output: Arc<OutputTree>) -> Self {
        Self {
            vocab,
            output,
            components: Vec::new(),
        }
    }

    /// Builds every component described by `config`.
    pub fn from_topology(config: &TopologyConfig, vocab: Vocab, rng: &mut SimpleRng) -> Result<Self> {
        let mut model = Self::new(vocab, config.output.max_branch)?;
        for comp in &config.components {
            let component = comp
                .to_builder(model.output.num_nodes(), model.vocab.size())?
                .build(rng)?;
            model.add_component(component)?;
        }
        debug!(
            components = model.components.len(),
            parameters = model.num_parameters(),
            "model built"
        );
        Ok(model)
    }

    /// Builder for a component sized for this model's output tree and vocabulary.
    pub fn component_builder(&self, name: &str) -> ComponentBuilder {
        Component::builder(name, self.output.num_nodes(), self.vocab.size())
    }

    /// Adds a built component. Its structural layers must match the model.
    pub fn add_component(&mut self, component: Component) -> Result<()> {
        if self.component(component.name()).is_some() {
            return Err(LmError::topology(format!(
                "duplicate component '{}'",
                component.name()
            )));
        }
        let layers = component.layers();
        if layers[OUTPUT_LAYER].size != self.output.num_nodes() {
            return Err(LmError::shape_mismatch(
                format!("output layer of '{}'", component.name()),
                self.output.num_nodes(),
                layers[OUTPUT_LAYER].size,
            ));
        }
        if layers[INPUT_LAYER].size != self.vocab.size() {
            return Err(LmError::shape_mismatch(
                format!("input layer of '{}'", component.name()),
                self.vocab.size(),
                layers[INPUT_LAYER].size,
            ));
        }
        self.components.push(component);
        Ok(())
    }

    pub fn vocab(&self) -> &Arc<Vocab> {
        &self.vocab
    }

    pub fn output_tree(&self) -> &Arc<OutputTree> {
        &self.output
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name() == name)
    }

    /// Every distinct weight once, in component and glue order.
    pub fn weights(&self) -> Vec<&Arc<SharedWeight>> {
        let mut seen: Vec<&Arc<SharedWeight>> = Vec::new();
        for comp in &self.components {
            for weight in comp.glues().iter().filter_map(|g| g.weight.as_ref()) {
                if !seen.iter().any(|w| Arc::ptr_eq(w, weight)) {
                    seen.push(weight);
                }
            }
        }
        seen
    }

    /// Number of trainable values, counting tied weights once.
    pub fn num_parameters(&self) -> usize {
        self.weights()
            .iter()
            .map(|w| w.rows() * w.cols() + if w.has_bias() { w.rows() } else { 0 })
            .sum()
    }

    /// Deep copy with fresh weight stores.
    pub fn duplicate(&self) -> Self {
        Self {
            vocab: Arc::clone(&self.vocab),
            output: Arc::clone(&self.output),
            components: self.components.iter().map(Component::duplicate).collect(),
        }
    }

    /// Keeps only the components named in `names`, matched without regard
    /// to ASCII case, in their original order.
    pub fn filter(mut self, names: &[&str]) -> Result<Self> {
        if let Some(missing) = names
            .iter()
            .find(|n| !self.components.iter().any(|c| c.name().eq_ignore_ascii_case(n)))
        {
            return Err(LmError::topology(format!("no component named '{}'", missing)));
        }
        self.components
            .retain(|c| names.iter().any(|n| c.name().eq_ignore_ascii_case(n)));
        debug!(components = self.components.len(), "model filtered");
        Ok(self)
    }

    /// Appends the components of `other`. Both models must share the same
    /// vocabulary and output tree, and component names must stay unique.
    pub fn merge(mut self, other: Model) -> Result<Self> {
        if self.vocab.words() != other.vocab.words() {
            return Err(LmError::topology("cannot merge models with different vocabularies"));
        }
        if self.output.spec() != other.output.spec() {
            return Err(LmError::topology("cannot merge models with different output trees"));
        }
        if let Some(dup) = other
            .components
            .iter()
            .find(|c| self.component(c.name()).is_some())
        {
            return Err(LmError::topology(format!("duplicate component '{}'", dup.name())));
        }
        self.components.extend(other.components);
        debug!(components = self.components.len(), "models merged");
        Ok(self)
    }

    /// Natural-log probability of every token of `sentence` followed by
    /// `</s>`.
    pub fn forward(&self, sentence: &[WordId]) -> Vec<f64> {
        let mut updater = Updater::new(self, None, 0, UpdaterOptions::default());
        updater.process_sentence(sentence)
    }

    /// Sum of [`Model::forward`].
    pub fn sentence_logprob(&self, sentence: &[WordId]) -> f64 {
        self.forward(sentence).iter().sum()
    }

    /// False when any weight holds a NaN or infinity.
    pub fn check_finite(&self) -> bool {
        let finite = self.weights().iter().all(|w| w.is_finite());
        if !finite {
            warn!("model weights contain NaN or infinite values");
        }
        finite
    }
}
