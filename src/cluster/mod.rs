//! Seams to the external cluster collaborators.
//!
//! The pipeline never talks a wire protocol itself. It consumes three
//! capabilities per cluster, handed out by a [`ClusterConnector`]:
//! per-vbucket seqno/vbuuid stats, a vbucket change-stream client driving a
//! [`StreamEvents`] observer, and an asynchronous per-key metadata fetch.
//! Production transports implement these traits; the in-tree
//! [`fixture::FixtureCluster`] implements them over an in-memory document
//! set for tests and local verification.

pub mod fixture;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::checkpoint::{Checkpoint, NUM_VBUCKETS};
use crate::core::mutation::Mutation;

/// Connection coordinates for one side of the replication pair.
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    pub url: String,
    pub username: String,
    pub password: String,
    pub bucket: String,
    /// Transport hint for bucket-level operations such as the stats fetch.
    pub op_timeout: Duration,
}

impl ClusterSpec {
    pub fn empty() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            bucket: String::new(),
            op_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unsupported cluster url {url}")]
    UnsupportedUrl { url: String },

    #[error("key not found")]
    KeyNotFound,

    #[error("vbucket stats unavailable: {reason}")]
    StatsUnavailable { reason: String },

    #[error("stream failed for vbucket {vbno}: {reason}")]
    Stream { vbno: u16, reason: String },

    #[error("metadata fetch failed: {reason}")]
    MetaFetch { reason: String },

    #[error("cluster io: {0}")]
    Io(#[from] std::io::Error),

    #[error("fixture parse failed: {0}")]
    FixtureParse(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, ClusterError::KeyNotFound)
    }
}

/// Per-vbucket high seqnos and vbucket UUIDs, index = vbno. Both vectors
/// carry exactly [`NUM_VBUCKETS`] entries.
#[derive(Clone, Debug, Default)]
pub struct VbucketStats {
    pub high_seqnos: Vec<u64>,
    pub vbuuids: Vec<u64>,
}

impl VbucketStats {
    pub fn total_docs(&self) -> u64 {
        self.high_seqnos.iter().sum()
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.high_seqnos.len() != NUM_VBUCKETS || self.vbuuids.len() != NUM_VBUCKETS {
            return Err(ClusterError::StatsUnavailable {
                reason: format!(
                    "expected {NUM_VBUCKETS} vbucket entries, got {} seqnos / {} vbuuids",
                    self.high_seqnos.len(),
                    self.vbuuids.len()
                ),
            });
        }
        Ok(())
    }
}

/// Document metadata returned by the metadata-get protocol. Field-for-field
/// equality (bytewise on the value) is the mutation differ's verdict.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    pub value: Vec<u8>,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
    pub expiry: u32,
    pub seqno: u64,
    pub deleted: bool,
}

/// Bucket stats endpoint.
pub trait StatsClient: Send + Sync {
    fn vbucket_seqno_stats(&self) -> Result<VbucketStats, ClusterError>;
}

/// Observer surface the stream library calls into. Per-vbucket callbacks
/// arrive in seqno order; cross-vbucket order is unspecified.
pub trait StreamEvents: Send + Sync {
    fn snapshot_marker(&self, vbno: u16, start_seqno: u64, end_seqno: u64);
    fn mutation(&self, mutation: Mutation);
    fn stream_end(&self, vbno: u16, result: Result<(), ClusterError>);
}

/// One change-stream connection multiplexing per-vbucket streams.
pub trait StreamClient: Send {
    /// Open the stream for `vbno` from the given resume point up to
    /// `end_seqno` (inclusive). Events are delivered to the observer the
    /// client was created with.
    fn start_vbucket_stream(
        &mut self,
        vbno: u16,
        from: &Checkpoint,
        end_seqno: u64,
    ) -> Result<(), ClusterError>;

    /// Stop delivery and release the connection. Events already in flight
    /// may still be observed until this returns.
    fn close(&mut self);
}

pub type MetaCallback = Box<dyn FnOnce(Result<DocMeta, ClusterError>) + Send>;

/// Asynchronous per-key metadata fetch. Issuing the request may fail
/// synchronously (connection loss); the result otherwise arrives through the
/// callback, possibly on another thread.
pub trait MetaClient: Send + Sync {
    fn get_meta(&self, key: &[u8], callback: MetaCallback) -> Result<(), ClusterError>;
}

/// Factory for the three per-cluster capabilities.
pub trait ClusterConnector: Send + Sync {
    fn stats_client(&self) -> Result<Box<dyn StatsClient>, ClusterError>;
    fn stream_client(
        &self,
        events: Arc<dyn StreamEvents>,
    ) -> Result<Box<dyn StreamClient>, ClusterError>;
    fn meta_client(&self) -> Result<Arc<dyn MetaClient>, ClusterError>;
}

/// Resolve a connector from the cluster URL scheme. `fixture://<path>` loads
/// the JSON-seeded in-memory cluster; production schemes are provided by
/// embedding applications.
pub fn connect(spec: &ClusterSpec) -> Result<Arc<dyn ClusterConnector>, ClusterError> {
    if let Some(path) = spec.url.strip_prefix("fixture://") {
        let cluster = fixture::FixtureCluster::load(Path::new(path))?;
        return Ok(Arc::new(cluster));
    }
    Err(ClusterError::UnsupportedUrl {
        url: spec.url.clone(),
    })
}
