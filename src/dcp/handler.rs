//! Per-client mutation handler: drains a bounded channel on its own thread
//! and turns accepted mutations into binned records.
//!
//! Processing order per event is filter -> checkpoint -> bin write. The
//! checkpoint update runs regardless of the filter verdict so end-seqno
//! detection never stalls behind filtered keys.
//!
//! Stream-end notifications travel through the same queue as mutations, so
//! a vbucket is reported complete only after every mutation delivered before
//! its stream end has been processed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, TryRecvError, bounded, select};

use crate::cluster::ClusterError;
use crate::core::mutation::Mutation;
use crate::dcp::bin_writer::{BinError, BinWriter};
use crate::dcp::checkpoint_manager::CheckpointManager;
use crate::dcp::fd_pool::FdPool;
use crate::dcp::filter::MutationFilter;
use crate::dcp::{CompletionReason, DcpError, VbucketCompletionSink};
use crate::utils::bin_index;

enum HandlerEvent {
    Mutation(Mutation),
    StreamEnd {
        vbno: u16,
        result: Result<(), ClusterError>,
    },
}

pub struct DcpHandler {
    cluster_name: String,
    index: usize,
    data_tx: Sender<HandlerEvent>,
    fin_rx: Receiver<()>,
    fin_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    filtered_count: Arc<AtomicU64>,
}

struct DrainContext {
    cluster_name: String,
    index: usize,
    num_bins: usize,
    writers: HashMap<u16, Vec<BinWriter>>,
    filter: Option<Arc<dyn MutationFilter>>,
    checkpoints: Arc<CheckpointManager>,
    completion: Arc<dyn VbucketCompletionSink>,
    err_tx: Sender<crate::Error>,
    filtered_count: Arc<AtomicU64>,
}

impl DcpHandler {
    /// Build the bin writers for the owned vbuckets and start the drain
    /// thread.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        cluster_name: &str,
        index: usize,
        vb_list: Vec<u16>,
        file_dir: &Path,
        num_bins: usize,
        chan_size: usize,
        fd_pool: Option<&Arc<FdPool>>,
        filter: Option<Arc<dyn MutationFilter>>,
        checkpoints: Arc<CheckpointManager>,
        completion: Arc<dyn VbucketCompletionSink>,
        err_tx: Sender<crate::Error>,
    ) -> Result<Arc<Self>, DcpError> {
        if vb_list.is_empty() {
            return Err(DcpError::EmptyHandler {
                cluster: cluster_name.to_string(),
                index,
            });
        }

        let mut writers: HashMap<u16, Vec<BinWriter>> = HashMap::with_capacity(vb_list.len());
        for &vbno in &vb_list {
            let mut bins = Vec::with_capacity(num_bins);
            for bin in 0..num_bins {
                bins.push(BinWriter::new(file_dir, vbno, bin, fd_pool)?);
            }
            writers.insert(vbno, bins);
        }

        let (data_tx, data_rx) = bounded::<HandlerEvent>(chan_size.max(1));
        let (fin_tx, fin_rx) = bounded::<()>(0);
        let filtered_count = Arc::new(AtomicU64::new(0));

        let context = DrainContext {
            cluster_name: cluster_name.to_string(),
            index,
            num_bins,
            writers,
            filter,
            checkpoints,
            completion,
            err_tx,
            filtered_count: filtered_count.clone(),
        };
        let drain_fin_rx = fin_rx.clone();
        let thread = std::thread::spawn(move || drain_loop(context, data_rx, drain_fin_rx));

        Ok(Arc::new(Self {
            cluster_name: cluster_name.to_string(),
            index,
            data_tx,
            fin_rx,
            fin_tx: Mutex::new(Some(fin_tx)),
            thread: Mutex::new(Some(thread)),
            filtered_count,
        }))
    }

    /// Called from the stream library's callback thread. Blocks when the
    /// queue is full until capacity appears or the handler stops; on stop
    /// the event is dropped.
    pub fn enqueue(&self, mutation: Mutation) {
        self.enqueue_event(HandlerEvent::Mutation(mutation));
    }

    /// Queue a stream-end notification behind the vbucket's pending
    /// mutations.
    pub fn enqueue_stream_end(&self, vbno: u16, result: Result<(), ClusterError>) {
        self.enqueue_event(HandlerEvent::StreamEnd { vbno, result });
    }

    fn enqueue_event(&self, event: HandlerEvent) {
        select! {
            send(self.data_tx, event) -> _ => {}
            recv(self.fin_rx) -> _ => {}
        }
    }

    /// Signal the drain thread and wait for it to flush and close its bin
    /// writers. Idempotent.
    pub fn stop(&self) {
        self.fin_tx.lock().expect("fin lock poisoned").take();
        if let Some(thread) = self.thread.lock().expect("thread lock poisoned").take() {
            let _ = thread.join();
        }
        let filtered = self.filtered_count.load(Ordering::SeqCst);
        if filtered > 0 {
            tracing::info!(
                cluster = %self.cluster_name,
                handler = self.index,
                filtered,
                "events dropped by filter"
            );
        }
    }
}

fn drain_loop(mut context: DrainContext, data_rx: Receiver<HandlerEvent>, fin_rx: Receiver<()>) {
    tracing::debug!(
        cluster = %context.cluster_name,
        handler = context.index,
        "handler drain loop started"
    );
    loop {
        // pending events are dropped, not drained, once stop is signaled
        if matches!(fin_rx.try_recv(), Err(TryRecvError::Disconnected)) {
            break;
        }
        let stop = select! {
            recv(fin_rx) -> _ => true,
            recv(data_rx) -> event => match event {
                Ok(HandlerEvent::Mutation(mutation)) => {
                    !process_mutation(&mut context, mutation)
                }
                Ok(HandlerEvent::StreamEnd { vbno, result }) => {
                    context.completion.handle_vbucket_completion(
                        vbno,
                        result,
                        CompletionReason::StreamEnded,
                    );
                    false
                }
                Err(_) => true,
            },
        };
        if stop {
            break;
        }
    }

    for (vbno, bins) in context.writers.drain() {
        for writer in bins {
            if let Err(err) = writer.close() {
                tracing::warn!(
                    cluster = %context.cluster_name,
                    vbno,
                    "error closing bin writer: {err}"
                );
            }
        }
    }
    tracing::debug!(
        cluster = %context.cluster_name,
        handler = context.index,
        "handler drain loop exited"
    );
}

/// Returns false when a bin write failed and the drain loop must exit.
fn process_mutation(context: &mut DrainContext, mutation: Mutation) -> bool {
    let mut filtered = false;
    if let Some(filter) = &context.filter {
        match filter.matches(&mutation) {
            Ok(true) => {}
            Ok(false) => filtered = true,
            Err(err) => {
                tracing::warn!(
                    cluster = %context.cluster_name,
                    key = %String::from_utf8_lossy(&mutation.key),
                    "filter evaluation failed, treating as non-matching: {err}"
                );
                filtered = true;
            }
        }
    }

    // checkpoint advancement is independent of the filter verdict
    let in_range = context.checkpoints.handle_mutation(&mutation);
    if !in_range {
        return true;
    }
    if filtered {
        context.filtered_count.fetch_add(1, Ordering::SeqCst);
        return true;
    }

    let bin = bin_index(&mutation.key, context.num_bins);
    let Some(bins) = context.writers.get_mut(&mutation.vbno) else {
        tracing::warn!(
            cluster = %context.cluster_name,
            handler = context.index,
            vbno = mutation.vbno,
            "mutation for unassigned vbucket dropped"
        );
        return true;
    };
    if let Err(err) = bins[bin].write(&mutation.to_record_bytes()) {
        report_bin_error(context, mutation.vbno, bin, err);
        return false;
    }
    true
}

fn report_bin_error(context: &DrainContext, vbno: u16, bin: usize, err: BinError) {
    tracing::error!(
        cluster = %context.cluster_name,
        vbno,
        bin,
        "bin write failed, aborting stage: {err}"
    );
    let _ = context.err_tx.try_send(crate::Error::Dcp(err.into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::cluster::{StatsClient, VbucketStats};
    use crate::core::checkpoint::NUM_VBUCKETS;
    use crate::core::mutation::{BinnedRecord, OpCode};
    use crate::dcp::checkpoint_manager::CheckpointManagerConfig;
    use crate::dcp::filter::KeyRegexFilter;
    use crate::utils::{BackoffPolicy, bin_file_path};

    struct FixedStats;

    impl StatsClient for FixedStats {
        fn vbucket_seqno_stats(&self) -> Result<VbucketStats, ClusterError> {
            Ok(VbucketStats {
                high_seqnos: vec![1_000; NUM_VBUCKETS],
                vbuuids: vec![7; NUM_VBUCKETS],
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

    fn test_checkpoints(dir: &Path) -> Arc<CheckpointManager> {
        CheckpointManager::start(
            CheckpointManagerConfig {
                cluster_name: "source".to_string(),
                checkpoint_file_dir: dir.to_path_buf(),
                old_checkpoint_file_name: None,
                new_checkpoint_file_name: None,
                complete_by_seqno: true,
                checkpoint_interval: None,
                get_stats_retry: BackoffPolicy::new(
                    Duration::from_millis(1),
                    1,
                    2,
                    Duration::from_millis(1),
                ),
            },
            &FixedStats,
            Arc::new(RecordingSink::default()),
        )
        .unwrap()
    }

    fn mutation(vbno: u16, key: &'static [u8], seqno: u64) -> Mutation {
        Mutation {
            vbno,
            key: Bytes::from_static(key),
            seqno,
            rev_id: 1,
            cas: seqno,
            flags: 0,
            expiry: 0,
            op: OpCode::Mutation,
            value: Bytes::from_static(b"value"),
            datatype: 0,
        }
    }

    #[test]
    fn handler_bins_accepted_mutations_and_skips_filtered() {
        let checkpoint_dir = tempfile::tempdir().unwrap();
        let file_dir = tempfile::tempdir().unwrap();
        let checkpoints = test_checkpoints(checkpoint_dir.path());
        let sink = Arc::new(RecordingSink::default());
        let (err_tx, err_rx) = bounded::<crate::Error>(2);

        let num_bins = 2;
        let filter = Arc::new(KeyRegexFilter::new("^app:").unwrap());
        let handler = DcpHandler::start(
            "source",
            0,
            vec![9],
            file_dir.path(),
            num_bins,
            16,
            None,
            Some(filter),
            checkpoints.clone(),
            sink.clone(),
            err_tx,
        )
        .unwrap();

        handler.enqueue(mutation(9, b"app:one", 1));
        handler.enqueue(mutation(9, b"_sys:hidden", 2));
        handler.enqueue(mutation(9, b"app:two", 3));
        handler.enqueue_stream_end(9, Ok(()));

        // stream end is processed strictly after the mutations queued ahead
        // of it
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.completions.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "stream end not processed");
            std::thread::sleep(Duration::from_millis(5));
        }
        handler.stop();

        // filtered mutation advanced the checkpoint but was not binned
        assert_eq!(checkpoints.seqno(9), 3);
        assert!(err_rx.try_recv().is_err());
        assert_eq!(
            *sink.completions.lock().unwrap(),
            vec![(9, CompletionReason::StreamEnded)]
        );

        let mut keys = Vec::new();
        for bin in 0..num_bins {
            let path = bin_file_path(file_dir.path(), 9, bin);
            let data = std::fs::read(&path).unwrap();
            let mut offset = 0;
            while offset < data.len() {
                let (record, next) = BinnedRecord::decode(&data, offset).unwrap();
                keys.push(String::from_utf8(record.key).unwrap());
                offset = next;
            }
        }
        keys.sort();
        assert_eq!(keys, vec!["app:one", "app:two"]);
        checkpoints.stop();
    }

    #[test]
    fn records_land_in_their_hashed_bin() {
        let checkpoint_dir = tempfile::tempdir().unwrap();
        let file_dir = tempfile::tempdir().unwrap();
        let checkpoints = test_checkpoints(checkpoint_dir.path());
        let sink = Arc::new(RecordingSink::default());
        let (err_tx, _err_rx) = bounded::<crate::Error>(2);

        let num_bins = 4;
        let handler = DcpHandler::start(
            "source",
            1,
            vec![3],
            file_dir.path(),
            num_bins,
            16,
            None,
            None,
            checkpoints.clone(),
            sink.clone(),
            err_tx,
        )
        .unwrap();

        let key: &[u8] = b"some-key";
        handler.enqueue(mutation(3, b"some-key", 1));
        handler.enqueue_stream_end(3, Ok(()));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.completions.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "stream end not processed");
            std::thread::sleep(Duration::from_millis(5));
        }
        handler.stop();

        let expected_bin = bin_index(key, num_bins);
        for bin in 0..num_bins {
            let data = std::fs::read(bin_file_path(file_dir.path(), 3, bin)).unwrap();
            if bin == expected_bin {
                let (record, _) = BinnedRecord::decode(&data, 0).unwrap();
                assert_eq!(record.key, key);
            } else {
                assert!(data.is_empty());
            }
        }
        checkpoints.stop();
    }
}
