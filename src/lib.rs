#![forbid(unsafe_code)]

pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod dcp;
pub mod differ;
pub mod error;
pub mod telemetry;
pub mod tool;
pub mod utils;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the data-model types at the crate root for convenience
pub use crate::core::{
    BinnedRecord, Checkpoint, CheckpointDoc, Mutation, NUM_VBUCKETS, OpCode, SnapshotWindow, Vbts,
};
