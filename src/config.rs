//! Configuration structures for training
//!
//! This module parses training session settings from JSON and turns them into
//! [`TrainOptions`] for the [`Driver`](crate::driver::Driver).

use crate::driver::{SchedulerSpec, TrainOptions};
use crate::error::{LmError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration of a training session.
///
/// Every field is optional in the JSON document. Scheduler types take the
/// following optional fields:
///
/// - **constant**: none (default)
/// - **step_decay**: `step_size` (default 1) and `gamma` (default 0.5)
/// - **exponential**: `decay_rate` (default 0.9)
/// - **halving**: `min_improvement` (default 0.003), relative entropy gain
///   below which the rate starts halving and training later stops
///
/// # Example
///
/// ```json
/// {
///   "num_threads": 4,
///   "learning_rate": 0.1,
///   "bptt": 4,
///   "bptt_block": 10,
///   "scheduler_type": "halving",
///   "min_improvement": 0.003
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Updater threads.
    pub num_threads: usize,
    /// Reader threads; `num_threads` when absent.
    pub num_readers: Option<usize>,
    /// Sentences per batch.
    pub batch_capacity: usize,
    /// Batches in circulation; 0 picks twice the thread count.
    pub num_slots: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub l2_penalty: f32,
    pub bptt: usize,
    pub bptt_block: usize,
    pub error_cutoff: f32,
    /// Tokens between flushes of staged deltas.
    pub flush_interval: usize,
    /// Dirty rows a thread may stage before a forced flush.
    pub dirty_capacity: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub epochs: usize,
    /// "constant", "step_decay", "exponential" or "halving"
    pub scheduler_type: String,
    pub step_size: Option<usize>,
    pub gamma: Option<f32>,
    pub decay_rate: Option<f32>,
    pub min_improvement: Option<f64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let opts = TrainOptions::default();
        Self {
            num_threads: opts.num_threads,
            num_readers: None,
            batch_capacity: opts.batch_capacity,
            num_slots: opts.num_slots,
            learning_rate: opts.learning_rate,
            momentum: opts.momentum,
            l2_penalty: opts.l2_penalty,
            bptt: opts.bptt,
            bptt_block: opts.bptt_block,
            error_cutoff: opts.error_cutoff,
            flush_interval: opts.flush_interval,
            dirty_capacity: opts.dirty_capacity,
            shuffle: opts.shuffle,
            seed: opts.seed,
            epochs: opts.epochs,
            scheduler_type: "constant".to_string(),
            step_size: None,
            gamma: None,
            decay_rate: None,
            min_improvement: None,
        }
    }
}

const SCHEDULERS: [&str; 4] = ["constant", "step_decay", "exponential", "halving"];

impl TrainConfig {
    /// Learning rate schedule described by the scheduler fields.
    pub fn scheduler(&self) -> Result<SchedulerSpec> {
        match self.scheduler_type.as_str() {
            "constant" => Ok(SchedulerSpec::Constant),
            "step_decay" => Ok(SchedulerSpec::StepDecay {
                step_size: self.step_size.unwrap_or(1),
                gamma: self.gamma.unwrap_or(0.5),
            }),
            "exponential" => Ok(SchedulerSpec::Exponential {
                gamma: self.decay_rate.unwrap_or(0.9),
            }),
            "halving" => Ok(SchedulerSpec::Halving {
                min_improvement: self.min_improvement.unwrap_or(0.003),
            }),
            other => Err(LmError::invalid_option(format!(
                "Invalid scheduler type '{}'. Must be one of: {}",
                other,
                SCHEDULERS.join(", ")
            ))),
        }
    }

    /// Session options with defaults filled in.
    pub fn to_options(&self) -> Result<TrainOptions> {
        let opts = TrainOptions {
            num_threads: self.num_threads,
            num_readers: self.num_readers.unwrap_or(self.num_threads),
            batch_capacity: self.batch_capacity,
            num_slots: self.num_slots,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            l2_penalty: self.l2_penalty,
            bptt: self.bptt,
            bptt_block: self.bptt_block,
            error_cutoff: self.error_cutoff,
            flush_interval: self.flush_interval,
            dirty_capacity: self.dirty_capacity,
            shuffle: self.shuffle,
            seed: self.seed,
            epochs: self.epochs,
            scheduler: self.scheduler()?,
        };
        opts.validate()?;
        Ok(opts)
    }
}

/// Loads a training configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use rust_neural_lm::config::load_config;
///
/// let cfg = load_config("train.json").unwrap();
/// let opts = cfg.to_options().unwrap();
/// assert!(opts.bptt >= 1);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainConfig> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parses and validates a training configuration.
pub fn parse_config(json: &str) -> Result<TrainConfig> {
    let config: TrainConfig = serde_json::from_str(json)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &TrainConfig) -> Result<()> {
    if let Some(0) = config.step_size {
        return Err(LmError::invalid_option("step_size must be at least 1"));
    }

    if let Some(gamma) = config.gamma {
        if gamma < 0.0 {
            return Err(LmError::invalid_option("gamma must be non-negative"));
        }
    }

    if let Some(decay_rate) = config.decay_rate {
        if decay_rate < 0.0 {
            return Err(LmError::invalid_option("decay_rate must be non-negative"));
        }
    }

    if let Some(min_improvement) = config.min_improvement {
        if min_improvement < 0.0 {
            return Err(LmError::invalid_option("min_improvement must be non-negative"));
        }
    }

    config.to_options().map(|_| ())
}
