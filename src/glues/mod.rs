//! Glues: typed, directed connections between layers
//!
//! A glue reads its source layer, applies its weight (if any) and adds the
//! result into a slice `[out_offset, out_offset + out_size)` of its
//! destination layer. The kernels for each kind live in their own module and
//! work on plain slices, so the per-thread updater can drive them over its
//! private buffers.
//!
//! | kind | source | weight shape | default update |
//! |---|---|---|---|
//! | direct | hidden | none | none |
//! | embedding | input | vocab × width | one-shot |
//! | fully-connected | hidden | out_size × src + bias | full |
//! | output | hidden | tree nodes × src + bias | part |

pub mod direct;
pub mod embedding;
pub mod fc;
pub mod output;

use crate::error::{LmError, Result};
use crate::weights::{SharedWeight, UpdateGranularity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of a glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlueKind {
    /// Identity copy, no weight.
    Direct,
    /// Word-id lookup table.
    Embedding,
    /// Dense matrix plus bias.
    FullyConnected,
    /// Projection onto the output tree.
    Output,
}

impl GlueKind {
    pub fn has_weight(&self) -> bool {
        !matches!(self, Self::Direct)
    }

    pub fn has_bias(&self) -> bool {
        matches!(self, Self::FullyConnected | Self::Output)
    }

    /// Update granularity matching the kind's access pattern.
    pub fn default_granularity(&self) -> Option<UpdateGranularity> {
        match self {
            Self::Direct => None,
            Self::Embedding => Some(UpdateGranularity::OneShot),
            Self::FullyConnected => Some(UpdateGranularity::Full),
            Self::Output => Some(UpdateGranularity::Part),
        }
    }

    /// Only weightless or dense hidden-to-hidden glues may close a cycle.
    pub fn may_recur(&self) -> bool {
        matches!(self, Self::Direct | Self::FullyConnected)
    }
}

impl FromStr for GlueKind {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "direct" => Ok(Self::Direct),
            "embedding" | "emb" => Ok(Self::Embedding),
            "fc" | "fully_connected" => Ok(Self::FullyConnected),
            "output" | "out" => Ok(Self::Output),
            other => Err(LmError::topology(format!(
                "Unknown glue type '{}'. Must be one of: direct, embedding, fc, output",
                other
            ))),
        }
    }
}

impl fmt::Display for GlueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "direct",
            Self::Embedding => "embedding",
            Self::FullyConnected => "fc",
            Self::Output => "output",
        };
        f.write_str(name)
    }
}

/// A directed connection from layer `src` to layer `dst` of one component.
#[derive(Debug, Clone)]
pub struct Glue {
    pub name: String,
    pub kind: GlueKind,
    pub src: usize,
    pub dst: usize,
    /// Shared canonical weight; tied glues hold the same `Arc`.
    pub weight: Option<Arc<SharedWeight>>,
    /// Name of the glue this one shares its weight with.
    pub tie: Option<String>,
    /// First destination unit written by this glue.
    pub out_offset: usize,
    /// Number of destination units written by this glue.
    pub out_size: usize,
}

impl Glue {
    /// Destination range written by this glue.
    pub fn out_range(&self) -> std::ops::Range<usize> {
        self.out_offset..self.out_offset + self.out_size
    }

    /// Weight of a weighted glue.
    ///
    /// # Panics
    ///
    /// Panics for direct glues, which have no weight.
    pub fn weight(&self) -> &SharedWeight {
        self.weight
            .as_deref()
            .unwrap_or_else(|| panic!("glue '{}' has no weight", self.name))
    }

    /// Short label for graph drawings: kind plus weight shape.
    pub fn label(&self) -> String {
        match &self.weight {
            Some(w) => format!("{} {}x{}", self.kind, w.rows(), w.cols()),
            None => format!("{} {}", self.kind, self.out_size),
        }
    }
}
