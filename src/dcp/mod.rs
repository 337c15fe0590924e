//! Stage 1: stream ingestion and on-disk binning.
//!
//! Ownership flows driver -> client -> handler and driver -> checkpoint
//! manager. The back edges (handler -> checkpoint manager -> driver
//! completion) are capabilities, not ownership: handlers hold an
//! `Arc<CheckpointManager>`, and the manager reports end-of-vbucket through
//! the [`VbucketCompletionSink`] implemented by the driver core.

mod bin_writer;
mod checkpoint_manager;
mod client;
mod driver;
mod fd_pool;
mod filter;
mod handler;

pub use bin_writer::{BIN_BUFFER_CAPACITY, BinError, BinWriter};
pub use checkpoint_manager::{CheckpointManager, CheckpointManagerConfig};
pub use client::{ClientConfig, DcpClient};
pub use driver::{DcpDriver, DcpDriverConfig, DriverCore};
pub use fd_pool::{FdHandle, FdPool};
pub use filter::{FilterError, KeyRegexFilter, MutationFilter};
pub use handler::DcpHandler;

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::core::checkpoint::CheckpointError;

#[derive(Debug, Error)]
pub enum DcpError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Bin(#[from] BinError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("handler {index} on {cluster} has no vbuckets")]
    EmptyHandler { cluster: String, index: usize },
}

/// Why a vbucket was marked complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionReason {
    EndSeqnoReached,
    StreamEnded,
    AlreadyCaughtUp,
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionReason::EndSeqnoReached => write!(f, "end seqno reached"),
            CompletionReason::StreamEnded => write!(f, "stream ended"),
            CompletionReason::AlreadyCaughtUp => write!(f, "already caught up at start"),
        }
    }
}

/// Capability for reporting per-vbucket completion back to the driver.
/// Duplicate completions for the same vbucket must be idempotent.
pub trait VbucketCompletionSink: Send + Sync {
    fn handle_vbucket_completion(
        &self,
        vbno: u16,
        result: Result<(), ClusterError>,
        reason: CompletionReason,
    );
}
