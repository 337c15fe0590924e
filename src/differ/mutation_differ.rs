//! Stage 3: re-fetch each suspect key's metadata from both clusters and
//! classify the final disagreement.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{after, tick};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterConnector, ClusterError, DocMeta, MetaClient};
use crate::config::DiffConfig;
use crate::differ::{DifferError, MUTATION_DIFF_FILE_NAME, load_diff_keys};
use crate::utils::{BackoffPolicy, balanced_chunks, retry_with_backoff};

const RESULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The three-section final report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MutationDiffReport {
    #[serde(rename = "Mismatch")]
    pub mismatch: BTreeMap<String, (DocMeta, DocMeta)>,
    #[serde(rename = "MissingFromSource")]
    pub missing_from_source: BTreeMap<String, DocMeta>,
    #[serde(rename = "MissingFromTarget")]
    pub missing_from_target: BTreeMap<String, DocMeta>,
}

impl MutationDiffReport {
    pub fn is_empty(&self) -> bool {
        self.mismatch.is_empty()
            && self.missing_from_source.is_empty()
            && self.missing_from_target.is_empty()
    }

    fn merge(&mut self, other: MutationDiffReport) {
        self.mismatch.extend(other.mismatch);
        self.missing_from_source.extend(other.missing_from_source);
        self.missing_from_target.extend(other.missing_from_target);
    }
}

pub struct MutationDiffer {
    source_connector: Arc<dyn ClusterConnector>,
    target_connector: Arc<dyn ClusterConnector>,
    input_dir: PathBuf,
    output_dir: PathBuf,
    num_workers: usize,
    batch_size: usize,
    timeout: Duration,
    send_batch_retry: BackoffPolicy,
}

impl MutationDiffer {
    pub fn new(
        config: &DiffConfig,
        source_connector: Arc<dyn ClusterConnector>,
        target_connector: Arc<dyn ClusterConnector>,
    ) -> Self {
        Self {
            source_connector,
            target_connector,
            input_dir: config
                .input_diff_keys_dir
                .clone()
                .unwrap_or_else(|| config.file_differ_dir.clone()),
            output_dir: config.mutation_differ_dir.clone(),
            num_workers: config.mutation_differ_workers.max(1),
            batch_size: config.mutation_differ_batch_size.max(1),
            timeout: config.mutation_differ_timeout,
            send_batch_retry: config.send_batch_retry,
        }
    }

    pub fn run(&self) -> Result<MutationDiffReport, DifferError> {
        let keys = load_diff_keys(&self.input_dir)?;
        tracing::info!(keys = keys.len(), "mutation differ starting");

        let mut report = MutationDiffReport::default();
        if !keys.is_empty() {
            let source_meta = self.source_connector.meta_client()?;
            let target_meta = self.target_connector.meta_client()?;

            let merged = Mutex::new(MutationDiffReport::default());
            std::thread::scope(|scope| {
                for (low, high) in balanced_chunks(self.num_workers, keys.len()) {
                    if low == high {
                        continue;
                    }
                    let keys = &keys[low..high];
                    let source_meta = &source_meta;
                    let target_meta = &target_meta;
                    let merged = &merged;
                    scope.spawn(move || {
                        let worker = DifferWorker::new(
                            keys,
                            self.batch_size,
                            self.timeout,
                            self.send_batch_retry,
                        );
                        let result = worker.run(source_meta.as_ref(), target_meta.as_ref());
                        merged
                            .lock()
                            .expect("report lock poisoned")
                            .merge(result);
                    });
                }
            });
            report = merged.into_inner().expect("report lock poisoned");
        }

        self.write_report(&report)?;
        tracing::info!(
            mismatch = report.mismatch.len(),
            missing_from_source = report.missing_from_source.len(),
            missing_from_target = report.missing_from_target.len(),
            "mutation differ completed"
        );
        Ok(report)
    }

    fn write_report(&self, report: &MutationDiffReport) -> Result<(), DifferError> {
        let path = self.output_dir.join(MUTATION_DIFF_FILE_NAME);
        let bytes = serde_json::to_vec(report).map_err(|source| DifferError::Serialize {
            what: "mutation diff report",
            source,
        })?;
        fs::write(&path, bytes).map_err(|source| DifferError::Io { path, source })
    }
}

type GetOutcome = Result<DocMeta, ClusterError>;

struct SideResults {
    slots: Arc<Vec<Mutex<Option<GetOutcome>>>>,
    completed: Arc<AtomicU32>,
}

impl SideResults {
    fn new(len: usize) -> Self {
        Self {
            slots: Arc::new((0..len).map(|_| Mutex::new(None)).collect()),
            completed: Arc::new(AtomicU32::new(0)),
        }
    }

    fn callback(&self, index: usize) -> crate::cluster::MetaCallback {
        let slots = self.slots.clone();
        let completed = self.completed.clone();
        Box::new(move |outcome| {
            *slots[index].lock().expect("result slot poisoned") = Some(outcome);
            completed.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn take(&self, index: usize) -> Option<GetOutcome> {
        self.slots[index].lock().expect("result slot poisoned").take()
    }
}

struct DifferWorker<'a> {
    keys: &'a [String],
    batch_size: usize,
    timeout: Duration,
    send_batch_retry: BackoffPolicy,
}

impl<'a> DifferWorker<'a> {
    fn new(
        keys: &'a [String],
        batch_size: usize,
        timeout: Duration,
        send_batch_retry: BackoffPolicy,
    ) -> Self {
        Self {
            keys,
            batch_size,
            timeout,
            send_batch_retry,
        }
    }

    fn run(&self, source_meta: &dyn MetaClient, target_meta: &dyn MetaClient) -> MutationDiffReport {
        let source_results = SideResults::new(self.keys.len());
        let target_results = SideResults::new(self.keys.len());

        self.send_gets(source_meta, &source_results, "source");
        self.send_gets(target_meta, &target_results, "target");
        self.await_results(&source_results, &target_results);
        self.classify(&source_results, &target_results)
    }

    /// Issue the asynchronous gets in batches; each batch send is retried
    /// under the send-batch backoff policy, re-issuing only keys whose
    /// request could not be handed to the client.
    fn send_gets(&self, meta: &dyn MetaClient, results: &SideResults, side: &str) {
        let mut issued = vec![false; self.keys.len()];
        for batch_start in (0..self.keys.len()).step_by(self.batch_size) {
            let batch_end = (batch_start + self.batch_size).min(self.keys.len());
            let send_result = retry_with_backoff(
                "send metadata get batch",
                &self.send_batch_retry,
                || -> Result<(), ClusterError> {
                    for index in batch_start..batch_end {
                        if issued[index] {
                            continue;
                        }
                        meta.get_meta(self.keys[index].as_bytes(), results.callback(index))?;
                        issued[index] = true;
                    }
                    Ok(())
                },
            );
            if let Err(err) = send_result {
                tracing::warn!(
                    side,
                    batch_start,
                    "metadata get batch failed after retries: {err}"
                );
            }
        }
    }

    fn await_results(&self, source: &SideResults, target: &SideResults) {
        let expected = self.keys.len() as u32;
        let ticker = tick(RESULT_POLL_INTERVAL);
        let deadline = after(self.timeout);
        loop {
            if source.completed.load(Ordering::SeqCst) >= expected
                && target.completed.load(Ordering::SeqCst) >= expected
            {
                return;
            }
            crossbeam::channel::select! {
                recv(ticker) -> _ => {}
                recv(deadline) -> _ => {
                    tracing::warn!(
                        keys = self.keys.len(),
                        timeout_secs = self.timeout.as_secs(),
                        "metadata get timed out, classifying what arrived"
                    );
                    return;
                }
            }
        }
    }

    fn classify(&self, source: &SideResults, target: &SideResults) -> MutationDiffReport {
        let mut report = MutationDiffReport::default();
        for (index, key) in self.keys.iter().enumerate() {
            let source_outcome = source.take(index);
            let target_outcome = target.take(index);
            let (Some(source_outcome), Some(target_outcome)) = (source_outcome, target_outcome)
            else {
                tracing::info!(key = %key, "skipping diff, one side never responded");
                continue;
            };

            match (source_outcome, target_outcome) {
                (Err(source_err), Err(target_err))
                    if source_err.is_key_not_found() && target_err.is_key_not_found() => {}
                (Err(source_err), Ok(target_doc)) if source_err.is_key_not_found() => {
                    report.missing_from_source.insert(key.clone(), target_doc);
                }
                (Ok(source_doc), Err(target_err)) if target_err.is_key_not_found() => {
                    report.missing_from_target.insert(key.clone(), source_doc);
                }
                (Ok(source_doc), Ok(target_doc)) => {
                    if source_doc != target_doc {
                        report
                            .mismatch
                            .insert(key.clone(), (source_doc, target_doc));
                    }
                }
                (source_outcome, target_outcome) => {
                    tracing::warn!(
                        key = %key,
                        source_err = source_outcome.err().map(|e| e.to_string()),
                        target_err = target_outcome.err().map(|e| e.to_string()),
                        "skipping diff, transient fetch error"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MetaCallback;

    struct MapMeta {
        docs: BTreeMap<&'static str, DocMeta>,
    }

    impl MetaClient for MapMeta {
        fn get_meta(&self, key: &[u8], callback: MetaCallback) -> Result<(), ClusterError> {
            match std::str::from_utf8(key).ok().and_then(|k| self.docs.get(k)) {
                Some(doc) => callback(Ok(doc.clone())),
                None => callback(Err(ClusterError::KeyNotFound)),
            }
            Ok(())
        }
    }

    fn doc(value: &[u8], cas: u64) -> DocMeta {
        DocMeta {
            value: value.to_vec(),
            flags: 0,
            datatype: 0,
            cas,
            expiry: 0,
            seqno: 1,
            deleted: false,
        }
    }

    fn worker_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), 2, 2, Duration::from_millis(2))
    }

    #[test]
    fn classification_covers_all_sections() {
        let keys: Vec<String> = ["equal", "mismatched", "source-only", "target-only", "gone"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        let source = MapMeta {
            docs: BTreeMap::from([
                ("equal", doc(b"v", 1)),
                ("mismatched", doc(b"a", 2)),
                ("source-only", doc(b"v", 3)),
            ]),
        };
        let target = MapMeta {
            docs: BTreeMap::from([
                ("equal", doc(b"v", 1)),
                ("mismatched", doc(b"b", 2)),
                ("target-only", doc(b"v", 4)),
            ]),
        };

        let worker = DifferWorker::new(&keys, 2, Duration::from_secs(5), worker_policy());
        let report = worker.run(&source, &target);

        assert_eq!(
            report.mismatch.keys().collect::<Vec<_>>(),
            vec!["mismatched"]
        );
        assert_eq!(
            report.missing_from_source.keys().collect::<Vec<_>>(),
            vec!["target-only"]
        );
        assert_eq!(
            report.missing_from_target.keys().collect::<Vec<_>>(),
            vec!["source-only"]
        );
        // both sides key-not-found drops out entirely
        assert!(!report.mismatch.contains_key("gone"));
        assert!(!report.missing_from_source.contains_key("gone"));
        assert!(!report.missing_from_target.contains_key("gone"));
    }

    #[test]
    fn equal_metadata_is_not_reported() {
        let keys = vec!["k".to_string()];
        let source = MapMeta {
            docs: BTreeMap::from([("k", doc(b"same", 9))]),
        };
        let target = MapMeta {
            docs: BTreeMap::from([("k", doc(b"same", 9))]),
        };
        let worker = DifferWorker::new(&keys, 10, Duration::from_secs(5), worker_policy());
        assert!(worker.run(&source, &target).is_empty());
    }

    #[test]
    fn unresponsive_side_is_skipped_not_misclassified() {
        struct SilentMeta;
        impl MetaClient for SilentMeta {
            fn get_meta(&self, _key: &[u8], _callback: MetaCallback) -> Result<(), ClusterError> {
                // swallow the callback: the key never completes
                Ok(())
            }
        }

        let keys = vec!["k".to_string()];
        let source = MapMeta {
            docs: BTreeMap::from([("k", doc(b"v", 1))]),
        };
        let worker = DifferWorker::new(&keys, 10, Duration::from_millis(50), worker_policy());
        let report = worker.run(&source, &SilentMeta);
        assert!(report.is_empty());
    }
}
