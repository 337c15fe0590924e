//! Per-cluster orchestrator for stage 1.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Sender;
use crossbeam::sync::WaitGroup;

use crate::cluster::{ClusterConnector, ClusterError};
use crate::config::DiffConfig;
use crate::core::checkpoint::NUM_VBUCKETS;
use crate::dcp::checkpoint_manager::{CheckpointManager, CheckpointManagerConfig};
use crate::dcp::client::{ClientConfig, DcpClient};
use crate::dcp::fd_pool::FdPool;
use crate::dcp::filter::MutationFilter;
use crate::dcp::{CompletionReason, DcpError, VbucketCompletionSink};
use crate::utils::BackoffPolicy;

#[derive(Clone, Debug)]
pub struct DcpDriverConfig {
    pub cluster_name: String,
    pub file_dir: PathBuf,
    pub checkpoint_file_dir: PathBuf,
    pub old_checkpoint_file_name: Option<String>,
    pub new_checkpoint_file_name: Option<String>,
    pub num_clients: usize,
    pub handlers_per_client: usize,
    pub num_bins: usize,
    pub chan_size: usize,
    pub complete_by_seqno: bool,
    pub checkpoint_interval: Option<Duration>,
    pub get_stats_retry: BackoffPolicy,
}

impl DcpDriverConfig {
    pub fn for_source(config: &DiffConfig) -> Self {
        Self {
            cluster_name: crate::config::SOURCE_CLUSTER_NAME.to_string(),
            file_dir: config.source_file_dir.clone(),
            checkpoint_file_dir: config.checkpoint_file_dir.clone(),
            old_checkpoint_file_name: config.old_source_checkpoint_file_name.clone(),
            new_checkpoint_file_name: config.new_checkpoint_file_name.clone(),
            num_clients: config.num_source_dcp_clients,
            handlers_per_client: config.workers_per_source_dcp_client,
            num_bins: config.num_bins,
            chan_size: config.source_dcp_handler_chan_size,
            complete_by_seqno: config.complete_by_seqno,
            checkpoint_interval: config.checkpoint_interval,
            get_stats_retry: config.get_stats_retry,
        }
    }

    pub fn for_target(config: &DiffConfig) -> Self {
        Self {
            cluster_name: crate::config::TARGET_CLUSTER_NAME.to_string(),
            file_dir: config.target_file_dir.clone(),
            checkpoint_file_dir: config.checkpoint_file_dir.clone(),
            old_checkpoint_file_name: config.old_target_checkpoint_file_name.clone(),
            new_checkpoint_file_name: config.new_checkpoint_file_name.clone(),
            num_clients: config.num_target_dcp_clients,
            handlers_per_client: config.workers_per_target_dcp_client,
            num_bins: config.num_bins,
            chan_size: config.target_dcp_handler_chan_size,
            complete_by_seqno: config.complete_by_seqno,
            checkpoint_interval: config.checkpoint_interval,
            get_stats_retry: config.get_stats_retry,
        }
    }
}

/// Completion bookkeeping shared by the driver, its clients' stream
/// observers, and the checkpoint manager's end-seqno detector.
pub struct DriverCore {
    cluster_name: String,
    completed: Mutex<Vec<bool>>,
    completed_count: AtomicUsize,
    err_tx: Sender<crate::Error>,
    wait_group: Mutex<Option<WaitGroup>>,
}

impl DriverCore {
    fn new(cluster_name: String, err_tx: Sender<crate::Error>, wait_group: WaitGroup) -> Arc<Self> {
        Arc::new(Self {
            cluster_name,
            completed: Mutex::new(vec![false; NUM_VBUCKETS]),
            completed_count: AtomicUsize::new(0),
            err_tx,
            wait_group: Mutex::new(Some(wait_group)),
        })
    }

    fn release_wait_group(&self) {
        self.wait_group.lock().expect("wait group lock poisoned").take();
    }
}

impl VbucketCompletionSink for DriverCore {
    fn handle_vbucket_completion(
        &self,
        vbno: u16,
        result: Result<(), ClusterError>,
        reason: CompletionReason,
    ) {
        if let Err(err) = result {
            tracing::error!(
                cluster = %self.cluster_name,
                vbno,
                %reason,
                "vbucket stream failed: {err}"
            );
            let _ = self.err_tx.try_send(err.into());
        }

        {
            let mut completed = self.completed.lock().expect("completed lock poisoned");
            if completed[vbno as usize] {
                return;
            }
            completed[vbno as usize] = true;
        }

        let count = self.completed_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(cluster = %self.cluster_name, vbno, %reason, "vbucket completed");
        if count == NUM_VBUCKETS {
            tracing::info!(cluster = %self.cluster_name, "all vbuckets completed");
            self.release_wait_group();
        }
    }
}

pub struct DcpDriver {
    config: DcpDriverConfig,
    connector: Arc<dyn ClusterConnector>,
    fd_pool: Option<Arc<FdPool>>,
    filter: Option<Arc<dyn MutationFilter>>,
    core: Arc<DriverCore>,
    err_tx: Sender<crate::Error>,
    checkpoints: Mutex<Option<Arc<CheckpointManager>>>,
    clients: Mutex<Vec<DcpClient>>,
    stopped: AtomicBool,
}

impl DcpDriver {
    pub fn new(
        config: DcpDriverConfig,
        connector: Arc<dyn ClusterConnector>,
        fd_pool: Option<Arc<FdPool>>,
        filter: Option<Arc<dyn MutationFilter>>,
        err_tx: Sender<crate::Error>,
        wait_group: WaitGroup,
    ) -> Arc<Self> {
        let core = DriverCore::new(config.cluster_name.clone(), err_tx.clone(), wait_group);
        Arc::new(Self {
            config,
            connector,
            fd_pool,
            filter,
            core,
            err_tx,
            checkpoints: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the checkpoint manager, then the clients concurrently, each
    /// owning a contiguous slice of the vbucket space.
    pub fn start(&self) -> Result<(), DcpError> {
        let stats_client = self.connector.stats_client()?;
        let checkpoints = CheckpointManager::start(
            CheckpointManagerConfig {
                cluster_name: self.config.cluster_name.clone(),
                checkpoint_file_dir: self.config.checkpoint_file_dir.clone(),
                old_checkpoint_file_name: self.config.old_checkpoint_file_name.clone(),
                new_checkpoint_file_name: self.config.new_checkpoint_file_name.clone(),
                complete_by_seqno: self.config.complete_by_seqno,
                checkpoint_interval: self.config.checkpoint_interval,
                get_stats_retry: self.config.get_stats_retry,
            },
            stats_client.as_ref(),
            self.core.clone(),
        )?;
        *self.checkpoints.lock().expect("checkpoints lock poisoned") = Some(checkpoints.clone());

        let num_clients = self.config.num_clients.clamp(1, NUM_VBUCKETS);
        let chunk = NUM_VBUCKETS / num_clients;
        let ranges: Vec<Vec<u16>> = (0..num_clients)
            .map(|i| {
                let low = i * chunk;
                let high = if i == num_clients - 1 {
                    NUM_VBUCKETS
                } else {
                    low + chunk
                };
                (low as u16..high as u16).collect()
            })
            .collect();

        let client_config = ClientConfig {
            file_dir: self.config.file_dir.clone(),
            num_handlers: self.config.handlers_per_client,
            num_bins: self.config.num_bins,
            chan_size: self.config.chan_size,
            fd_pool: self.fd_pool.clone(),
            filter: self.filter.clone(),
            err_tx: self.err_tx.clone(),
        };

        let results: Vec<Result<DcpClient, DcpError>> = std::thread::scope(|scope| {
            let client_config = &client_config;
            let checkpoints = &checkpoints;
            let handles: Vec<_> = ranges
                .into_iter()
                .enumerate()
                .map(|(index, vb_list)| {
                    scope.spawn(move || {
                        DcpClient::start(
                            &self.config.cluster_name,
                            index,
                            vb_list,
                            &*self.connector,
                            &self.core,
                            checkpoints,
                            client_config,
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("client start thread panicked"))
                .collect()
        });

        {
            let mut clients = self.clients.lock().expect("clients lock poisoned");
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(client) => clients.push(client),
                    Err(err) => first_error = first_error.or(Some(err)),
                }
            }
            // stop() may have raced ahead of registration (every vbucket can
            // complete before the slowest client start returns); it found an
            // empty client list, so shut the fresh clients down here
            if self.stopped.load(Ordering::SeqCst) {
                for client in clients.iter_mut() {
                    client.stop();
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        tracing::info!(cluster = %self.config.cluster_name, "dcp driver started");
        Ok(())
    }

    /// Stop clients (stopping handlers, flushing bin writers), then flush
    /// the final checkpoint. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(cluster = %self.config.cluster_name, "dcp driver stopping");
        {
            // taken by start() while it registers clients, so a stop that
            // races with startup either sees the registered clients or leaves
            // the stopped flag for start() to act on
            let mut clients = self.clients.lock().expect("clients lock poisoned");
            for client in clients.iter_mut() {
                client.stop();
            }
        }
        if let Some(checkpoints) = self
            .checkpoints
            .lock()
            .expect("checkpoints lock poisoned")
            .clone()
        {
            checkpoints.stop();
        }
        self.core.release_wait_group();
        tracing::info!(cluster = %self.config.cluster_name, "dcp driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn duplicate_completions_are_idempotent() {
        let (err_tx, _err_rx) = bounded(2);
        let core = DriverCore::new("source".to_string(), err_tx, WaitGroup::new());
        for _ in 0..3 {
            core.handle_vbucket_completion(42, Ok(()), CompletionReason::StreamEnded);
        }
        assert_eq!(core.completed_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completing_every_vbucket_releases_the_wait_group() {
        let (err_tx, _err_rx) = bounded(2);
        let wait_group = WaitGroup::new();
        let core = DriverCore::new("source".to_string(), err_tx, wait_group.clone());
        for vbno in 0..NUM_VBUCKETS as u16 {
            core.handle_vbucket_completion(vbno, Ok(()), CompletionReason::EndSeqnoReached);
        }
        // would hang if the driver's clone were still held
        wait_group.wait();
    }

    #[test]
    fn stream_errors_reach_the_error_channel() {
        let (err_tx, err_rx) = bounded(2);
        let core = DriverCore::new("source".to_string(), err_tx, WaitGroup::new());
        core.handle_vbucket_completion(
            7,
            Err(ClusterError::Stream {
                vbno: 7,
                reason: "connection reset".to_string(),
            }),
            CompletionReason::StreamEnded,
        );
        assert!(err_rx.try_recv().is_ok());
        assert_eq!(core.completed_count.load(Ordering::SeqCst), 1);
    }
}
