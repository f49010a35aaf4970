//! Topology description
//!
//! This module provides the JSON description of a network: the output tree
//! parameters and, per component, its input context, hidden layers, glues
//! and (optionally) its declared glue cycles. Building the model from it is
//! done by [`crate::model::Model::from_topology`].

use crate::component::{Component, ComponentBuilder, GlueSpec};
use crate::error::{LmError, Result};
use crate::glues::GlueKind;
use crate::layers::{Combine, LayerKind};
use crate::weights::UpdateGranularity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Output tree parameters.
///
/// Without `max_branch` the output is a flat softmax over the vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub max_branch: Option<usize>,
}

/// Which previous words feed the embedding glues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Negative offsets of the context words (default `[-1]`)
    #[serde(default = "default_context")]
    pub context: Vec<i32>,
    /// "sum", "avg" or "concat" (default "sum")
    pub combine: Option<String>,
}

fn default_context() -> Vec<i32> {
    vec![-1]
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            context: default_context(),
            combine: None,
        }
    }
}

/// A hidden layer.
///
/// ```json
/// { "name": "hidden", "size": 64, "type": "sigmoid" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub size: usize,
    /// "linear", "relu", "sigmoid" or "tanh"
    #[serde(rename = "type")]
    pub kind: String,
    /// "sum", "avg" or "concat" (default "sum")
    pub combine: Option<String>,
}

/// A glue between two layers. The structural layers are named `input` and
/// `output`.
///
/// ```json
/// { "name": "rec", "type": "fc", "src": "hidden", "dst": "hidden", "update": "full" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlueConfig {
    pub name: String,
    /// "direct", "embedding", "fc" or "output"
    #[serde(rename = "type")]
    pub kind: String,
    pub src: String,
    pub dst: String,
    /// Embedding width per context word, or output width of an fc glue
    pub size: Option<usize>,
    /// "full", "part", "segment" or "one-shot"
    pub update: Option<String>,
    /// Rows per lock block for `"update": "segment"`
    pub segment_rows: Option<usize>,
    /// Earlier glue of this component whose weight is shared
    pub tie: Option<String>,
}

/// One component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    /// Weight of this component in the output logits (default 1.0)
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
    pub glues: Vec<GlueConfig>,
    /// Declared cycles as glue names, head first. Detected when omitted.
    pub cycles: Option<Vec<Vec<String>>>,
}

fn default_scale() -> f32 {
    1.0
}

/// Configuration for the whole network.
///
/// # Example
///
/// ```json
/// {
///   "output": { "max_branch": 32 },
///   "components": [
///     {
///       "name": "rnn",
///       "input": { "context": [-1] },
///       "layers": [ { "name": "hidden", "size": 64, "type": "sigmoid" } ],
///       "glues": [
///         { "name": "emb", "type": "embedding", "src": "input", "dst": "hidden" },
///         { "name": "rec", "type": "fc", "src": "hidden", "dst": "hidden" },
///         { "name": "out", "type": "output", "src": "hidden", "dst": "output" }
///       ]
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub output: OutputConfig,
    pub components: Vec<ComponentConfig>,
}

/// Loads a topology description from a JSON file.
pub fn load_topology<P: AsRef<Path>>(path: P) -> Result<TopologyConfig> {
    let contents = fs::read_to_string(path)?;
    parse_topology(&contents)
}

/// Parses and validates a topology description.
pub fn parse_topology(json: &str) -> Result<TopologyConfig> {
    let config: TopologyConfig = serde_json::from_str(json)?;
    validate_topology(&config)?;
    Ok(config)
}

/// Checks what can be checked without a vocabulary: names, sizes and type
/// names. Graph-level validation happens when components are built.
pub fn validate_topology(config: &TopologyConfig) -> Result<()> {
    if config.components.is_empty() {
        return Err(LmError::topology("Topology must have at least one component"));
    }
    if let Some(branch) = config.output.max_branch {
        if branch < 2 {
            return Err(LmError::topology("output.max_branch must be at least 2"));
        }
    }

    for (i, comp) in config.components.iter().enumerate() {
        if config.components[..i].iter().any(|c| c.name == comp.name) {
            return Err(LmError::topology(format!("Duplicate component '{}'", comp.name)));
        }
        if !comp.scale.is_finite() {
            return Err(LmError::topology(format!(
                "Component '{}': scale must be finite",
                comp.name
            )));
        }
        parse_combine(comp.input.combine.as_deref())?;
        for layer in &comp.layers {
            if layer.size == 0 {
                return Err(LmError::topology(format!(
                    "Component '{}': layer '{}' size must be greater than 0",
                    comp.name, layer.name
                )));
            }
            layer.kind.parse::<LayerKind>()?;
            parse_combine(layer.combine.as_deref())?;
        }
        for glue in &comp.glues {
            glue.kind.parse::<GlueKind>()?;
            parse_update(glue)?;
            if glue.size == Some(0) {
                return Err(LmError::topology(format!(
                    "Component '{}': glue '{}' size must be greater than 0",
                    comp.name, glue.name
                )));
            }
        }
    }
    Ok(())
}

fn parse_combine(name: Option<&str>) -> Result<Combine> {
    name.map_or(Ok(Combine::Sum), str::parse)
}

fn parse_update(glue: &GlueConfig) -> Result<Option<UpdateGranularity>> {
    match &glue.update {
        Some(name) => UpdateGranularity::parse(name, glue.segment_rows).map(Some),
        None if glue.segment_rows.is_some() => {
            UpdateGranularity::parse("segment", glue.segment_rows).map(Some)
        }
        None => Ok(None),
    }
}

impl ComponentConfig {
    /// Translates this description into a component builder.
    pub fn to_builder(&self, output_size: usize, vocab_size: usize) -> Result<ComponentBuilder> {
        let mut builder = Component::builder(&self.name, output_size, vocab_size)
            .scale(self.scale)
            .set_input(
                self.input.context.clone(),
                parse_combine(self.input.combine.as_deref())?,
            );
        for layer in &self.layers {
            builder = builder.add_layer(
                &layer.name,
                layer.size,
                layer.kind.parse()?,
                parse_combine(layer.combine.as_deref())?,
            );
        }
        for glue in &self.glues {
            let mut spec = GlueSpec::new(&glue.name, glue.kind.parse()?, &glue.src, &glue.dst);
            spec.size = glue.size;
            spec.update = parse_update(glue)?;
            spec.tie = glue.tie.clone();
            builder = builder.add_glue(spec);
        }
        if let Some(cycles) = &self.cycles {
            builder = builder.with_cycles(cycles.clone());
        }
        Ok(builder)
    }
}
