//! The immutable run configuration.
//!
//! Built once from the CLI (or by hand in tests) and passed by reference
//! into every subsystem constructor; no component reads process-wide state.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::ClusterSpec;
use crate::utils::BackoffPolicy;

pub const SOURCE_CLUSTER_NAME: &str = "source";
pub const TARGET_CLUSTER_NAME: &str = "target";

pub const DEFAULT_SOURCE_FILE_DIR: &str = "source";
pub const DEFAULT_TARGET_FILE_DIR: &str = "target";
pub const DEFAULT_CHECKPOINT_FILE_DIR: &str = "checkpoint";
pub const DEFAULT_FILE_DIFFER_DIR: &str = "fileDiff";
pub const DEFAULT_MUTATION_DIFFER_DIR: &str = "mutationDiff";

pub const DEFAULT_NUM_DCP_CLIENTS: usize = 4;
pub const DEFAULT_WORKERS_PER_DCP_CLIENT: usize = 256;
pub const DEFAULT_FILE_DIFFER_WORKERS: usize = 30;
pub const DEFAULT_MUTATION_DIFFER_WORKERS: usize = 30;
pub const DEFAULT_NUM_BINS: usize = 10;
pub const DEFAULT_NUM_FILE_DESC: usize = 500;
pub const DEFAULT_DCP_HANDLER_CHAN_SIZE: usize = 10_000;
pub const DEFAULT_MUTATION_BATCH_SIZE: usize = 100;
pub const DEFAULT_MUTATION_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_BUCKET_OP_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_GET_STATS_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_GET_STATS_RETRY_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_GET_STATS_MAX_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_SEND_BATCH_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SEND_BATCH_RETRY_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SEND_BATCH_MAX_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_DELAY_BETWEEN_SOURCE_AND_TARGET_SECS: u64 = 2;
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 600;

/// Exponential backoff multiplier shared by both retry paths.
pub const BACKOFF_FACTOR: u32 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiffConfig {
    pub source: ClusterSpec,
    pub target: ClusterSpec,

    pub source_file_dir: PathBuf,
    pub target_file_dir: PathBuf,
    pub checkpoint_file_dir: PathBuf,
    pub file_differ_dir: PathBuf,
    pub mutation_differ_dir: PathBuf,
    /// When set, the mutation differ reads its key list here instead of the
    /// file differ's output directory.
    pub input_diff_keys_dir: Option<PathBuf>,

    pub old_source_checkpoint_file_name: Option<String>,
    pub old_target_checkpoint_file_name: Option<String>,
    /// `None` disables checkpointing entirely.
    pub new_checkpoint_file_name: Option<String>,

    pub num_source_dcp_clients: usize,
    pub workers_per_source_dcp_client: usize,
    pub num_target_dcp_clients: usize,
    pub workers_per_target_dcp_client: usize,
    pub file_differ_workers: usize,
    pub mutation_differ_workers: usize,
    pub num_bins: usize,
    /// Zero disables the shared file descriptor pool.
    pub num_file_desc: usize,

    /// Wall-clock bound for stage 1; required when `complete_by_seqno` is
    /// off.
    pub complete_by_duration: Option<Duration>,
    /// Stop each vbucket at the high seqno observed at start.
    pub complete_by_seqno: bool,

    pub mutation_differ_batch_size: usize,
    pub mutation_differ_timeout: Duration,
    pub source_dcp_handler_chan_size: usize,
    pub target_dcp_handler_chan_size: usize,

    pub get_stats_retry: BackoffPolicy,
    pub send_batch_retry: BackoffPolicy,

    pub delay_between_source_and_target: Duration,
    /// `None` disables periodic checkpointing; the final checkpoint on stop
    /// is governed by `new_checkpoint_file_name` alone.
    pub checkpoint_interval: Option<Duration>,

    /// Replication filter expression; only matching keys are compared.
    pub filter_expression: Option<String>,

    pub run_data_generation: bool,
    pub run_file_differ: bool,
    pub run_mutation_differ: bool,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            source: ClusterSpec::empty(),
            target: ClusterSpec::empty(),
            source_file_dir: PathBuf::from(DEFAULT_SOURCE_FILE_DIR),
            target_file_dir: PathBuf::from(DEFAULT_TARGET_FILE_DIR),
            checkpoint_file_dir: PathBuf::from(DEFAULT_CHECKPOINT_FILE_DIR),
            file_differ_dir: PathBuf::from(DEFAULT_FILE_DIFFER_DIR),
            mutation_differ_dir: PathBuf::from(DEFAULT_MUTATION_DIFFER_DIR),
            input_diff_keys_dir: None,
            old_source_checkpoint_file_name: None,
            old_target_checkpoint_file_name: None,
            new_checkpoint_file_name: None,
            num_source_dcp_clients: DEFAULT_NUM_DCP_CLIENTS,
            workers_per_source_dcp_client: DEFAULT_WORKERS_PER_DCP_CLIENT,
            num_target_dcp_clients: DEFAULT_NUM_DCP_CLIENTS,
            workers_per_target_dcp_client: DEFAULT_WORKERS_PER_DCP_CLIENT,
            file_differ_workers: DEFAULT_FILE_DIFFER_WORKERS,
            mutation_differ_workers: DEFAULT_MUTATION_DIFFER_WORKERS,
            num_bins: DEFAULT_NUM_BINS,
            num_file_desc: DEFAULT_NUM_FILE_DESC,
            complete_by_duration: None,
            complete_by_seqno: true,
            mutation_differ_batch_size: DEFAULT_MUTATION_BATCH_SIZE,
            mutation_differ_timeout: Duration::from_secs(DEFAULT_MUTATION_TIMEOUT_SECS),
            source_dcp_handler_chan_size: DEFAULT_DCP_HANDLER_CHAN_SIZE,
            target_dcp_handler_chan_size: DEFAULT_DCP_HANDLER_CHAN_SIZE,
            get_stats_retry: BackoffPolicy::new(
                Duration::from_secs(DEFAULT_GET_STATS_RETRY_INTERVAL_SECS),
                DEFAULT_GET_STATS_MAX_ATTEMPTS,
                BACKOFF_FACTOR,
                Duration::from_secs(DEFAULT_GET_STATS_MAX_BACKOFF_SECS),
            ),
            send_batch_retry: BackoffPolicy::new(
                Duration::from_millis(DEFAULT_SEND_BATCH_RETRY_INTERVAL_MS),
                DEFAULT_SEND_BATCH_MAX_ATTEMPTS,
                BACKOFF_FACTOR,
                Duration::from_secs(DEFAULT_SEND_BATCH_MAX_BACKOFF_SECS),
            ),
            delay_between_source_and_target: Duration::from_secs(
                DEFAULT_DELAY_BETWEEN_SOURCE_AND_TARGET_SECS,
            ),
            checkpoint_interval: Some(Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS)),
            filter_expression: None,
            run_data_generation: true,
            run_file_differ: true,
            run_mutation_differ: true,
        }
    }
}

impl DiffConfig {
    /// True when any enabled stage talks to the clusters.
    pub fn needs_clusters(&self) -> bool {
        self.run_data_generation || self.run_mutation_differ
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_data_generation && !self.complete_by_seqno && self.complete_by_duration.is_none()
        {
            return Err(ConfigError::invalid(
                "completeByDuration is required when completeBySeqno is false",
            ));
        }
        if self.needs_clusters() {
            if self.source.url.is_empty() {
                return Err(ConfigError::invalid("sourceUrl is required"));
            }
            if self.target.url.is_empty() {
                return Err(ConfigError::invalid("targetUrl is required"));
            }
        }
        if self.num_bins == 0 {
            return Err(ConfigError::invalid("numberOfBins must be at least 1"));
        }
        if self.run_data_generation
            && (self.num_source_dcp_clients == 0 || self.num_target_dcp_clients == 0)
        {
            return Err(ConfigError::invalid(
                "the number of dcp clients must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_urls() -> DiffConfig {
        let mut config = DiffConfig::default();
        config.source.url = "fixture:///tmp/source.json".to_string();
        config.target.url = "fixture:///tmp/target.json".to_string();
        config
    }

    #[test]
    fn default_config_with_urls_validates() {
        config_with_urls().validate().unwrap();
    }

    #[test]
    fn duration_mode_requires_a_duration() {
        let mut config = config_with_urls();
        config.complete_by_seqno = false;
        assert!(config.validate().is_err());
        config.complete_by_duration = Some(Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn cluster_urls_are_required_only_when_a_cluster_stage_runs() {
        let mut config = DiffConfig::default();
        config.run_data_generation = false;
        config.run_mutation_differ = false;
        config.validate().unwrap();

        config.run_mutation_differ = true;
        assert!(config.validate().is_err());
    }
}
