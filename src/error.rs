use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::core::checkpoint::CheckpointError;
use crate::dcp::DcpError;
use crate::differ::DifferError;

/// Crate-level convenience error.
///
/// A thin wrapper over the subsystem errors; each stage keeps its own
/// canonical error enum and this exists so the coordinator and the shared
/// error channel can carry any of them.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Dcp(#[from] DcpError),

    #[error(transparent)]
    Differ(#[from] DifferError),
}
