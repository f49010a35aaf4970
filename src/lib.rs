//! Rust Neural Language Models
//!
//! This library builds connectionist language models out of components (small
//! graphs of layers joined by glues), and trains them with many threads that
//! share one copy of every weight.
//!
//! # Modules
//!
//! - `vocab`: word ↔ id mapping with the reserved `</s>` and `<unk>` words
//! - `output`: hierarchical softmax tree over the vocabulary
//! - `layers`, `glues`: layer kinds and the kernels that connect layers
//! - `graph`, `component`: topology validation and glue ordering
//! - `weights`, `optimizers`: shared weights and their flush-time update rule
//! - `model`: components over one vocabulary, plus the model image format
//! - `updater`: per-thread forward/backward passes and BPTT replay
//! - `reader`, `driver`: the threaded training and evaluation pipeline
//! - `config`, `topology`: JSON configuration documents
//! - `utils`: RNG, activation functions and learning rate schedulers

pub mod component;
pub mod config;
pub mod driver;
pub mod error;
pub mod glues;
pub mod graph;
pub mod layers;
pub mod model;
pub mod optimizers;
pub mod output;
pub mod reader;
pub mod topology;
pub mod updater;
pub mod utils;
pub mod vocab;
pub mod weights;

pub use error::{LmError, Result};
