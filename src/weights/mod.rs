//! Weight storage and concurrent update machinery
//!
//! - `store`: plain dense matrix + bias, used for initialization and images
//! - `shared`: the canonical matrix split into lock blocks
//! - `dirty`: per-thread record of touched rows
//! - `updater`: per-thread staging and flushing into the canonical matrix

pub mod dirty;
pub mod shared;
pub mod store;
pub mod updater;

pub use dirty::DirtyBuffer;
pub use shared::{SharedWeight, UpdateGranularity};
pub use store::WeightStore;
pub use updater::{SharedWeightUpdater, UpdateParams};
