//! Shared utilities for the language-model engine
//!
//! This module provides the deterministic random number generator used for
//! weight initialization and corpus shuffling, the activation kernels used by
//! layers and the output tree, and epoch-level learning rate schedules.

pub mod activations;
pub mod lr_scheduler;
pub mod rng;

pub use rng::SimpleRng;
