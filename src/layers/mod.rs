//! Layer definitions
//!
//! A layer is a named activation vector of fixed width. Its kind selects the
//! transformation applied after all incoming glues have contributed, and its
//! combine mode says how those contributions are merged.
//!
//! Layer 0 of every component is the shared output layer and layer 1 the
//! shared input layer; both are structural and never activated.

mod r#trait;

pub use r#trait::Activation;

use crate::error::{LmError, Result};
use crate::utils::activations::{
    relu_derivative_inplace, relu_inplace, sigmoid_derivative_inplace, sigmoid_inplace,
    tanh_derivative_inplace, tanh_inplace,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Index of the output layer inside a component.
pub const OUTPUT_LAYER: usize = 0;
/// Index of the input layer inside a component.
pub const INPUT_LAYER: usize = 1;

/// Transformation applied by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Output,
    Linear,
    Relu,
    Sigmoid,
    Tanh,
}

impl LayerKind {
    /// True for the structural input/output kinds.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Input | Self::Output)
    }
}

impl Activation for LayerKind {
    fn activate(&self, ac: &mut [f32]) {
        match self {
            Self::Input | Self::Output | Self::Linear => {}
            Self::Relu => relu_inplace(ac),
            Self::Sigmoid => sigmoid_inplace(ac),
            Self::Tanh => tanh_inplace(ac),
        }
    }

    fn derivate(&self, ac: &[f32], er: &mut [f32]) {
        assert_eq!(ac.len(), er.len(), "activation and error widths differ");
        match self {
            Self::Input | Self::Output | Self::Linear => {}
            Self::Relu => relu_derivative_inplace(ac, er),
            Self::Sigmoid => sigmoid_derivative_inplace(ac, er),
            Self::Tanh => tanh_derivative_inplace(ac, er),
        }
    }
}

impl FromStr for LayerKind {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            "linear" | "identity" => Ok(Self::Linear),
            "relu" | "rectifier" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            other => Err(LmError::topology(format!(
                "Unknown layer type '{}'. Must be one of: linear, relu, sigmoid, tanh",
                other
            ))),
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Linear => "linear",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
        };
        f.write_str(name)
    }
}

/// How a layer merges the contributions of several incoming glues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    /// Contributions are added.
    #[default]
    Sum,
    /// Contributions are added, then divided by their count.
    Avg,
    /// Each incoming glue writes its own slice of the layer.
    Concat,
}

impl FromStr for Combine {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" | "average" => Ok(Self::Avg),
            "concat" | "append" => Ok(Self::Concat),
            other => Err(LmError::topology(format!(
                "Unknown combine mode '{}'. Must be one of: sum, avg, concat",
                other
            ))),
        }
    }
}

/// A named, sized activation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub size: usize,
    pub kind: LayerKind,
    #[serde(default)]
    pub combine: Combine,
}

impl Layer {
    pub fn new(name: impl Into<String>, size: usize, kind: LayerKind, combine: Combine) -> Self {
        Self {
            name: name.into(),
            size,
            kind,
            combine,
        }
    }

    pub fn is_structural(&self) -> bool {
        self.kind.is_structural()
    }
}
