//! Per-cluster checkpoint manager.
//!
//! Fetches per-vbucket high seqnos and vbuuids at start, builds the
//! start-VBTS map (optionally resuming from a prior checkpoint document),
//! tracks seqnos and snapshot windows while streams run, persists periodic
//! and final checkpoints, and decides per-mutation range acceptance and
//! end-seqno completion.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, tick};

use crate::cluster::StatsClient;
use crate::core::checkpoint::{
    Checkpoint, CheckpointDoc, CheckpointError, NUM_VBUCKETS, SnapshotWindow, Vbts,
};
use crate::core::mutation::Mutation;
use crate::dcp::{CompletionReason, DcpError, VbucketCompletionSink};
use crate::utils::{BackoffPolicy, retry_with_backoff};

const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct CheckpointManagerConfig {
    pub cluster_name: String,
    pub checkpoint_file_dir: PathBuf,
    pub old_checkpoint_file_name: Option<String>,
    pub new_checkpoint_file_name: Option<String>,
    pub complete_by_seqno: bool,
    /// `None` disables periodic checkpointing.
    pub checkpoint_interval: Option<Duration>,
    pub get_stats_retry: BackoffPolicy,
}

impl CheckpointManagerConfig {
    fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.checkpoint_file_dir
            .join(format!("{}_{name}", self.cluster_name))
    }
}

pub struct CheckpointManager {
    cluster_name: String,
    new_checkpoint_path: Option<PathBuf>,
    complete_by_seqno: bool,
    vbuuids: Vec<u64>,
    end_seqnos: Vec<u64>,
    start_vbts: Vec<Vbts>,
    seqnos: Vec<AtomicU64>,
    snapshots: Vec<RwLock<SnapshotWindow>>,
    completion: Arc<dyn VbucketCompletionSink>,
    fin_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl CheckpointManager {
    /// Run the start sequence: stats fetch with retry, end-seqno
    /// construction, optional resume from the old checkpoint document, and
    /// the periodic writer / status reporter threads.
    pub fn start(
        config: CheckpointManagerConfig,
        stats_client: &dyn StatsClient,
        completion: Arc<dyn VbucketCompletionSink>,
    ) -> Result<Arc<Self>, DcpError> {
        let stats = retry_with_backoff(
            "fetch vbucket seqno stats",
            &config.get_stats_retry,
            || stats_client.vbucket_seqno_stats(),
        )?;
        stats.validate()?;
        tracing::info!(
            cluster = %config.cluster_name,
            total_docs = stats.total_docs(),
            "retrieved vbucket high seqnos"
        );

        let end_seqnos: Vec<u64> = if config.complete_by_seqno {
            stats.high_seqnos.clone()
        } else {
            vec![u64::MAX; NUM_VBUCKETS]
        };

        let mut start_vbts = vec![Vbts::default(); NUM_VBUCKETS];
        let seqnos: Vec<AtomicU64> = (0..NUM_VBUCKETS).map(|_| AtomicU64::new(0)).collect();
        for (vbno, vbts) in start_vbts.iter_mut().enumerate() {
            vbts.end_seqno = end_seqnos[vbno];
        }

        if let Some(old_name) = &config.old_checkpoint_file_name {
            let old_path = config.checkpoint_path(old_name);
            let doc = CheckpointDoc::load(&old_path)?;
            tracing::info!(
                cluster = %config.cluster_name,
                path = %old_path.display(),
                "resuming from checkpoint document"
            );
            for (vbno, checkpoint) in doc.checkpoints {
                let vbts = &mut start_vbts[vbno as usize];
                vbts.checkpoint = checkpoint;
                if config.complete_by_seqno && checkpoint.seqno >= vbts.end_seqno {
                    vbts.no_need_to_start_stream = true;
                }
                seqnos[vbno as usize].store(checkpoint.seqno, Ordering::SeqCst);
            }
        }

        let manager = Arc::new(Self {
            cluster_name: config.cluster_name.clone(),
            new_checkpoint_path: config
                .new_checkpoint_file_name
                .as_deref()
                .map(|name| config.checkpoint_path(name)),
            complete_by_seqno: config.complete_by_seqno,
            vbuuids: stats.vbuuids,
            end_seqnos,
            start_vbts,
            seqnos,
            snapshots: (0..NUM_VBUCKETS)
                .map(|_| RwLock::new(SnapshotWindow::default()))
                .collect(),
            completion,
            fin_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let (fin_tx, fin_rx) = bounded::<()>(0);
        *manager.fin_tx.lock().expect("fin lock poisoned") = Some(fin_tx);

        let mut threads = manager.threads.lock().expect("threads lock poisoned");
        if let Some(interval) = config.checkpoint_interval {
            let writer = manager.clone();
            let rx = fin_rx.clone();
            threads.push(std::thread::spawn(move || {
                writer.periodic_checkpointing(interval, rx);
            }));
        }
        let reporter = manager.clone();
        threads.push(std::thread::spawn(move || {
            reporter.report_status(fin_rx);
        }));
        drop(threads);

        Ok(manager)
    }

    pub fn start_vbts(&self, vbno: u16) -> &Vbts {
        &self.start_vbts[vbno as usize]
    }

    /// Range-check one mutation and advance its vbucket seqno. Returns false
    /// when the mutation lies beyond the end seqno and must be dropped.
    /// Reaching the end seqno reports the vbucket complete.
    pub fn handle_mutation(&self, mutation: &Mutation) -> bool {
        if !self.complete_by_seqno {
            self.advance_seqno(mutation.vbno, mutation.seqno);
            return true;
        }

        let end_seqno = self.end_seqnos[mutation.vbno as usize];
        if mutation.seqno >= end_seqno {
            self.completion.handle_vbucket_completion(
                mutation.vbno,
                Ok(()),
                CompletionReason::EndSeqnoReached,
            );
        }
        if mutation.seqno <= end_seqno {
            self.advance_seqno(mutation.vbno, mutation.seqno);
            true
        } else {
            false
        }
    }

    fn advance_seqno(&self, vbno: u16, seqno: u64) {
        self.seqnos[vbno as usize].fetch_max(seqno, Ordering::SeqCst);
    }

    pub fn update_snapshot(&self, vbno: u16, start_seqno: u64, end_seqno: u64) {
        let mut snapshot = self.snapshots[vbno as usize]
            .write()
            .expect("snapshot lock poisoned");
        snapshot.start_seqno = start_seqno;
        snapshot.end_seqno = end_seqno;
    }

    fn snapshot(&self, vbno: u16) -> SnapshotWindow {
        *self.snapshots[vbno as usize]
            .read()
            .expect("snapshot lock poisoned")
    }

    pub fn seqno(&self, vbno: u16) -> u64 {
        self.seqnos[vbno as usize].load(Ordering::SeqCst)
    }

    fn seqno_sum(&self) -> u64 {
        self.seqnos.iter().map(|s| s.load(Ordering::SeqCst)).sum()
    }

    /// Assemble the checkpoint document from the live maps. A vbucket that
    /// made no progress since start keeps its start snapshot window, so the
    /// resume invariant holds even when streams never advanced.
    pub fn build_checkpoint_doc(&self) -> CheckpointDoc {
        let mut doc = CheckpointDoc::default();
        for vbno in 0..NUM_VBUCKETS as u16 {
            let seqno = self.seqno(vbno);
            let start_checkpoint = &self.start_vbts[vbno as usize].checkpoint;
            let snapshot = if seqno != start_checkpoint.seqno {
                self.snapshot(vbno)
            } else {
                SnapshotWindow {
                    start_seqno: start_checkpoint.snapshot_start_seqno,
                    end_seqno: start_checkpoint.snapshot_end_seqno,
                }
            };
            doc.checkpoints.insert(
                vbno,
                Checkpoint {
                    vbuuid: self.vbuuids[vbno as usize],
                    seqno,
                    snapshot_start_seqno: snapshot.start_seqno,
                    snapshot_end_seqno: snapshot.end_seqno,
                },
            );
        }
        doc
    }

    /// Write the final checkpoint. A no-op when checkpointing is disabled.
    pub fn save_checkpoint(&self) -> Result<(), CheckpointError> {
        match &self.new_checkpoint_path {
            Some(path) => self.save_checkpoint_to(path),
            None => {
                tracing::info!(
                    cluster = %self.cluster_name,
                    "skipping checkpoint save, checkpointing is disabled"
                );
                Ok(())
            }
        }
    }

    fn save_checkpoint_to(&self, path: &Path) -> Result<(), CheckpointError> {
        let doc = self.build_checkpoint_doc();
        let total: u64 = doc.checkpoints.values().map(|c| c.seqno).sum();
        doc.save(path)?;
        tracing::info!(
            cluster = %self.cluster_name,
            path = %path.display(),
            total_mutations = total,
            "saved checkpoints"
        );
        Ok(())
    }

    fn periodic_checkpointing(&self, interval: Duration, fin_rx: Receiver<()>) {
        let Some(base_path) = self.new_checkpoint_path.clone() else {
            return;
        };
        let ticker = tick(interval);
        // the iteration counter keeps periodic checkpoint file names unique
        let mut iteration = 0u64;
        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => {
                    let mut path = base_path.clone().into_os_string();
                    path.push(format!("_{iteration}"));
                    if let Err(err) = self.save_checkpoint_to(Path::new(&path)) {
                        tracing::warn!(
                            cluster = %self.cluster_name,
                            "periodic checkpoint save failed: {err}"
                        );
                    }
                    iteration += 1;
                }
                recv(fin_rx) -> _ => return,
            }
        }
    }

    fn report_status(&self, fin_rx: Receiver<()>) {
        let ticker = tick(STATUS_REPORT_INTERVAL);
        let mut prev_sum: Option<u64> = None;
        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => {
                    let sum = self.seqno_sum();
                    match prev_sum {
                        Some(prev) => tracing::info!(
                            cluster = %self.cluster_name,
                            processed = sum,
                            rate = (sum - prev) / STATUS_REPORT_INTERVAL.as_secs(),
                            "mutation progress"
                        ),
                        None => tracing::info!(
                            cluster = %self.cluster_name,
                            processed = sum,
                            "mutation progress"
                        ),
                    }
                    prev_sum = Some(sum);
                }
                recv(fin_rx) -> _ => return,
            }
        }
    }

    /// Save the final checkpoint and stop the background threads. Idempotent;
    /// save errors are logged and do not fail the stop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(cluster = %self.cluster_name, "checkpoint manager stopping");
        if let Err(err) = self.save_checkpoint() {
            tracing::warn!(
                cluster = %self.cluster_name,
                "error saving final checkpoint: {err}"
            );
        }
        self.fin_tx.lock().expect("fin lock poisoned").take();
        let threads = std::mem::take(&mut *self.threads.lock().expect("threads lock poisoned"));
        for thread in threads {
            let _ = thread.join();
        }
        tracing::debug!(cluster = %self.cluster_name, "checkpoint manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    use crate::cluster::{ClusterError, VbucketStats};
    use crate::core::mutation::OpCode;

    struct FixedStats {
        high_seqno: u64,
    }

    impl StatsClient for FixedStats {
        fn vbucket_seqno_stats(&self) -> Result<VbucketStats, ClusterError> {
            Ok(VbucketStats {
                high_seqnos: vec![self.high_seqno; NUM_VBUCKETS],
                vbuuids: (0..NUM_VBUCKETS as u64).map(|v| 0x1000 + v).collect(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        completions: StdMutex<Vec<(u16, CompletionReason)>>,
    }

    impl VbucketCompletionSink for RecordingSink {
        fn handle_vbucket_completion(
            &self,
            vbno: u16,
            _result: Result<(), ClusterError>,
            reason: CompletionReason,
        ) {
            self.completions.lock().unwrap().push((vbno, reason));
        }
    }

    fn manager_config(dir: &Path, complete_by_seqno: bool) -> CheckpointManagerConfig {
        CheckpointManagerConfig {
            cluster_name: "source".to_string(),
            checkpoint_file_dir: dir.to_path_buf(),
            old_checkpoint_file_name: None,
            new_checkpoint_file_name: Some("ckpt".to_string()),
            complete_by_seqno,
            checkpoint_interval: None,
            get_stats_retry: BackoffPolicy::new(
                Duration::from_millis(1),
                2,
                2,
                Duration::from_millis(2),
            ),
        }
    }

    fn mutation(vbno: u16, seqno: u64) -> Mutation {
        Mutation {
            vbno,
            key: Bytes::from_static(b"k"),
            seqno,
            rev_id: 1,
            cas: seqno,
            flags: 0,
            expiry: 0,
            op: OpCode::Mutation,
            value: Bytes::from_static(b"v"),
            datatype: 0,
        }
    }

    #[test]
    fn seqno_mode_accepts_in_range_and_drops_beyond_end() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let manager = CheckpointManager::start(
            manager_config(dir.path(), true),
            &FixedStats { high_seqno: 100 },
            sink.clone(),
        )
        .unwrap();

        assert!(manager.handle_mutation(&mutation(5, 50)));
        assert_eq!(manager.seqno(5), 50);
        assert!(sink.completions.lock().unwrap().is_empty());

        // beyond end: dropped, seqno untouched, vbucket completed
        assert!(!manager.handle_mutation(&mutation(5, 101)));
        assert_eq!(manager.seqno(5), 50);
        assert_eq!(
            *sink.completions.lock().unwrap(),
            vec![(5, CompletionReason::EndSeqnoReached)]
        );

        // exactly the end: accepted and completed
        assert!(manager.handle_mutation(&mutation(6, 100)));
        assert_eq!(manager.seqno(6), 100);
        manager.stop();
    }

    #[test]
    fn duration_mode_always_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let manager = CheckpointManager::start(
            manager_config(dir.path(), false),
            &FixedStats { high_seqno: 10 },
            sink.clone(),
        )
        .unwrap();

        assert_eq!(manager.start_vbts(0).end_seqno, u64::MAX);
        assert!(manager.handle_mutation(&mutation(0, 10_000)));
        assert_eq!(manager.seqno(0), 10_000);
        assert!(sink.completions.lock().unwrap().is_empty());
        manager.stop();
    }

    #[test]
    fn checkpoint_preserves_start_snapshot_without_progress() {
        let dir = tempfile::tempdir().unwrap();

        // seed an old checkpoint with a distinctive snapshot window
        let mut old_doc = CheckpointDoc::default();
        for vbno in 0..NUM_VBUCKETS as u16 {
            old_doc.checkpoints.insert(
                vbno,
                Checkpoint {
                    vbuuid: 0x1000 + vbno as u64,
                    seqno: 40,
                    snapshot_start_seqno: 30,
                    snapshot_end_seqno: 45,
                },
            );
        }
        old_doc.save(&dir.path().join("source_old")).unwrap();

        let mut config = manager_config(dir.path(), true);
        config.old_checkpoint_file_name = Some("old".to_string());
        let manager = CheckpointManager::start(
            config,
            &FixedStats { high_seqno: 100 },
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        // vb 1 advances inside a new snapshot; vb 2 stays put
        manager.update_snapshot(1, 50, 60);
        assert!(manager.handle_mutation(&mutation(1, 55)));

        let doc = manager.build_checkpoint_doc();
        let advanced = doc.checkpoints[&1];
        assert_eq!(advanced.seqno, 55);
        assert_eq!(advanced.snapshot_start_seqno, 50);
        assert_eq!(advanced.snapshot_end_seqno, 60);

        let untouched = doc.checkpoints[&2];
        assert_eq!(untouched.seqno, 40);
        assert_eq!(untouched.snapshot_start_seqno, 30);
        assert_eq!(untouched.snapshot_end_seqno, 45);

        for checkpoint in doc.checkpoints.values() {
            assert!(checkpoint.snapshot_start_seqno <= checkpoint.seqno);
            assert!(checkpoint.seqno <= checkpoint.snapshot_end_seqno);
        }
        manager.stop();
    }

    #[test]
    fn resume_at_end_seqno_skips_stream() {
        let dir = tempfile::tempdir().unwrap();

        let mut old_doc = CheckpointDoc::default();
        for vbno in 0..NUM_VBUCKETS as u16 {
            old_doc.checkpoints.insert(
                vbno,
                Checkpoint {
                    vbuuid: 0x1000 + vbno as u64,
                    seqno: if vbno == 3 { 100 } else { 10 },
                    snapshot_start_seqno: 0,
                    snapshot_end_seqno: 100,
                },
            );
        }
        old_doc.save(&dir.path().join("source_old")).unwrap();

        let mut config = manager_config(dir.path(), true);
        config.old_checkpoint_file_name = Some("old".to_string());
        let manager = CheckpointManager::start(
            config,
            &FixedStats { high_seqno: 100 },
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        assert!(manager.start_vbts(3).no_need_to_start_stream);
        assert!(!manager.start_vbts(4).no_need_to_start_stream);
        assert_eq!(manager.seqno(3), 100);
        assert_eq!(manager.seqno(4), 10);
        manager.stop();
    }

    #[test]
    fn stop_writes_final_checkpoint_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::start(
            manager_config(dir.path(), true),
            &FixedStats { high_seqno: 10 },
            Arc::new(RecordingSink::default()),
        )
        .unwrap();
        manager.handle_mutation(&mutation(0, 5));
        manager.update_snapshot(0, 5, 10);
        manager.stop();
        manager.stop();

        let saved = CheckpointDoc::load(&dir.path().join("source_ckpt")).unwrap();
        assert_eq!(saved.checkpoints[&0].seqno, 5);
        assert_eq!(saved.checkpoints[&0].vbuuid, 0x1000);
    }
}
