//! In-memory reference cluster behind the `fixture://` scheme.
//!
//! Serves a bucket seeded from a JSON document set (or built
//! programmatically in tests) through all three collaborator seams:
//! seqno/vbuuid stats, per-vbucket ordered stream delivery with snapshot
//! markers and stream-end, and metadata gets including deletion tombstones.
//! Seqnos, revisions, cas values, and vbuuids are derived deterministically,
//! so two fixtures fed the same operations are byte-identical replicas.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::Deserialize;

use crate::cluster::{
    ClusterConnector, ClusterError, DocMeta, MetaCallback, MetaClient, StatsClient, StreamClient,
    StreamEvents, VbucketStats,
};
use crate::core::checkpoint::{Checkpoint, NUM_VBUCKETS};
use crate::core::mutation::{Mutation, OpCode};

/// Map a key to its vbucket. Any stable hash works here as long as both
/// fixture sides agree; real transports use the cluster's own mapping.
pub fn vbucket_for_key(key: &[u8]) -> u16 {
    (crc32c::crc32c(key) as usize % NUM_VBUCKETS) as u16
}

fn vbuuid_for(name: &str, vbno: u16) -> u64 {
    ((crc32c::crc32c(name.as_bytes()) as u64) << 32) | vbno as u64
}

fn cas_for(key: &[u8], rev_id: u64) -> u64 {
    ((crc32c::crc32c(key) as u64) << 32) | rev_id
}

struct VbucketLog {
    vbuuid: u64,
    mutations: Vec<Mutation>,
}

impl VbucketLog {
    fn high_seqno(&self) -> u64 {
        self.mutations.last().map(|m| m.seqno).unwrap_or(0)
    }
}

struct FixtureData {
    name: String,
    vbuckets: Vec<VbucketLog>,
    docs: HashMap<Vec<u8>, DocMeta>,
}

/// Accumulates documents, then freezes into a [`FixtureCluster`].
pub struct FixtureBuilder {
    data: FixtureData,
}

impl FixtureBuilder {
    pub fn new(name: &str) -> Self {
        let vbuckets = (0..NUM_VBUCKETS as u16)
            .map(|vbno| VbucketLog {
                vbuuid: vbuuid_for(name, vbno),
                mutations: Vec::new(),
            })
            .collect();
        Self {
            data: FixtureData {
                name: name.to_string(),
                vbuckets,
                docs: HashMap::new(),
            },
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.put_with(key, value, 0, 0)
    }

    pub fn put_with(&mut self, key: &[u8], value: &[u8], flags: u32, expiry: u32) -> &mut Self {
        let rev_id = self.next_rev(key);
        let cas = cas_for(key, rev_id);
        self.apply(key, OpCode::Mutation, value, flags, expiry, cas, rev_id)
    }

    pub fn put_with_cas(&mut self, key: &[u8], value: &[u8], cas: u64) -> &mut Self {
        let rev_id = self.next_rev(key);
        self.apply(key, OpCode::Mutation, value, 0, 0, cas, rev_id)
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        let rev_id = self.next_rev(key);
        let cas = cas_for(key, rev_id);
        self.apply(key, OpCode::Deletion, b"", 0, 0, cas, rev_id)
    }

    fn next_rev(&self, key: &[u8]) -> u64 {
        let log = &self.data.vbuckets[vbucket_for_key(key) as usize];
        log.mutations.iter().filter(|m| m.key.as_ref() == key).count() as u64 + 1
    }

    fn apply(
        &mut self,
        key: &[u8],
        op: OpCode,
        value: &[u8],
        flags: u32,
        expiry: u32,
        cas: u64,
        rev_id: u64,
    ) -> &mut Self {
        let vbno = vbucket_for_key(key);
        let log = &mut self.data.vbuckets[vbno as usize];
        let seqno = log.high_seqno() + 1;
        let deleted = op != OpCode::Mutation;
        let mutation = Mutation {
            vbno,
            key: Bytes::copy_from_slice(key),
            seqno,
            rev_id,
            cas,
            flags,
            expiry,
            op,
            value: Bytes::copy_from_slice(value),
            datatype: 0,
        };
        log.mutations.push(mutation);
        self.data.docs.insert(
            key.to_vec(),
            DocMeta {
                value: if deleted { Vec::new() } else { value.to_vec() },
                flags,
                datatype: 0,
                cas,
                expiry,
                seqno,
                deleted,
            },
        );
        self
    }

    pub fn finish(self) -> FixtureCluster {
        FixtureCluster {
            inner: Arc::new(self.data),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    name: String,
    docs: Vec<FixtureFileDoc>,
}

#[derive(Debug, Deserialize)]
struct FixtureFileDoc {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    flags: u32,
    #[serde(default)]
    expiry: u32,
    #[serde(default)]
    deleted: bool,
}

/// A frozen in-memory cluster. Cheap to clone; implements
/// [`ClusterConnector`] directly.
#[derive(Clone)]
pub struct FixtureCluster {
    inner: Arc<FixtureData>,
}

impl FixtureCluster {
    /// Load a fixture from a JSON file: `{"name": "...", "docs": [{"key":
    /// ..., "value": ..., "flags": ..., "expiry": ..., "deleted": ...}]}`.
    /// Documents are applied in file order.
    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let bytes = fs::read(path)?;
        let file: FixtureFile = serde_json::from_slice(&bytes)?;
        let name = if file.name.is_empty() {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("fixture")
                .to_string()
        } else {
            file.name
        };
        let mut builder = FixtureBuilder::new(&name);
        for doc in &file.docs {
            if doc.deleted {
                builder.delete(doc.key.as_bytes());
            } else {
                builder.put_with(doc.key.as_bytes(), doc.value.as_bytes(), doc.flags, doc.expiry);
            }
        }
        Ok(builder.finish())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn into_connector(self) -> Arc<dyn ClusterConnector> {
        Arc::new(self)
    }
}

impl ClusterConnector for FixtureCluster {
    fn stats_client(&self) -> Result<Box<dyn StatsClient>, ClusterError> {
        Ok(Box::new(FixtureStatsClient {
            data: self.inner.clone(),
        }))
    }

    fn stream_client(
        &self,
        events: Arc<dyn StreamEvents>,
    ) -> Result<Box<dyn StreamClient>, ClusterError> {
        Ok(Box::new(FixtureStreamClient::start(
            self.inner.clone(),
            events,
        )))
    }

    fn meta_client(&self) -> Result<Arc<dyn MetaClient>, ClusterError> {
        Ok(Arc::new(FixtureMetaClient {
            data: self.inner.clone(),
        }))
    }
}

struct FixtureStatsClient {
    data: Arc<FixtureData>,
}

impl StatsClient for FixtureStatsClient {
    fn vbucket_seqno_stats(&self) -> Result<VbucketStats, ClusterError> {
        Ok(VbucketStats {
            high_seqnos: self.data.vbuckets.iter().map(|v| v.high_seqno()).collect(),
            vbuuids: self.data.vbuckets.iter().map(|v| v.vbuuid).collect(),
        })
    }
}

struct StreamRequest {
    vbno: u16,
    from: Checkpoint,
    end_seqno: u64,
}

/// Replays vbucket logs on a single delivery thread: per-vbucket callbacks
/// are seqno-ordered, cross-vbucket order follows request order.
struct FixtureStreamClient {
    tx: Option<Sender<StreamRequest>>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl FixtureStreamClient {
    fn start(data: Arc<FixtureData>, events: Arc<dyn StreamEvents>) -> Self {
        let (tx, rx) = unbounded::<StreamRequest>();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker = std::thread::spawn(move || {
            Self::deliver_loop(data, events, rx, worker_stop);
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
            stop,
        }
    }

    fn deliver_loop(
        data: Arc<FixtureData>,
        events: Arc<dyn StreamEvents>,
        rx: Receiver<StreamRequest>,
        stop: Arc<AtomicBool>,
    ) {
        while let Ok(req) = rx.recv() {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            Self::deliver_one(&data, events.as_ref(), &req, &stop);
        }
    }

    fn deliver_one(
        data: &FixtureData,
        events: &dyn StreamEvents,
        req: &StreamRequest,
        stop: &AtomicBool,
    ) {
        let log = &data.vbuckets[req.vbno as usize];
        if req.from.vbuuid != 0 && req.from.vbuuid != log.vbuuid {
            events.stream_end(
                req.vbno,
                Err(ClusterError::Stream {
                    vbno: req.vbno,
                    reason: format!(
                        "vbuuid mismatch: stream requested {:#x}, vbucket is on {:#x}",
                        req.from.vbuuid, log.vbuuid
                    ),
                }),
            );
            return;
        }

        let pending: Vec<&Mutation> = log
            .mutations
            .iter()
            .filter(|m| m.seqno > req.from.seqno && m.seqno <= req.end_seqno)
            .collect();

        if let (Some(first), Some(last)) = (pending.first(), pending.last()) {
            events.snapshot_marker(req.vbno, first.seqno, last.seqno);
            for mutation in pending {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                events.mutation(mutation.clone());
            }
        }
        events.stream_end(req.vbno, Ok(()));
    }
}

impl StreamClient for FixtureStreamClient {
    fn start_vbucket_stream(
        &mut self,
        vbno: u16,
        from: &Checkpoint,
        end_seqno: u64,
    ) -> Result<(), ClusterError> {
        let tx = self.tx.as_ref().ok_or(ClusterError::Stream {
            vbno,
            reason: "stream client closed".to_string(),
        })?;
        tx.send(StreamRequest {
            vbno,
            from: *from,
            end_seqno,
        })
        .map_err(|_| ClusterError::Stream {
            vbno,
            reason: "stream delivery thread gone".to_string(),
        })
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for FixtureStreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct FixtureMetaClient {
    data: Arc<FixtureData>,
}

impl MetaClient for FixtureMetaClient {
    fn get_meta(&self, key: &[u8], callback: MetaCallback) -> Result<(), ClusterError> {
        match self.data.docs.get(key) {
            Some(meta) => callback(Ok(meta.clone())),
            None => callback(Err(ClusterError::KeyNotFound)),
        }
        Ok(())
    }
}
