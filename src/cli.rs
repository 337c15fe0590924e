//! CLI surface.
//!
//! Long flag names match the original tool's so existing invocations carry
//! over. Everything funnels into the immutable [`DiffConfig`] record.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::cluster::ClusterSpec;
use crate::config::{self, ConfigError, DiffConfig};
use crate::utils::BackoffPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "vbdiff",
    version,
    about = "Compares the two buckets of a replication pair and reports diverging keys"
)]
pub struct Cli {
    /// Url for the source cluster.
    #[arg(long = "sourceUrl", default_value = "")]
    pub source_url: String,

    /// Username for the source cluster.
    #[arg(long = "sourceUsername", default_value = "")]
    pub source_username: String,

    /// Password for the source cluster.
    #[arg(long = "sourcePassword", default_value = "")]
    pub source_password: String,

    /// Bucket name for the source cluster.
    #[arg(long = "sourceBucketName", default_value = "")]
    pub source_bucket_name: String,

    /// Remote cluster reference name used when creating the replication.
    #[arg(long = "remoteClusterName")]
    pub remote_cluster_name: Option<String>,

    /// Directory for mutations streamed from the source cluster.
    #[arg(long = "sourceFileDir", default_value = config::DEFAULT_SOURCE_FILE_DIR)]
    pub source_file_dir: PathBuf,

    /// Url for the target cluster.
    #[arg(long = "targetUrl", default_value = "")]
    pub target_url: String,

    /// Username for the target cluster.
    #[arg(long = "targetUsername", default_value = "")]
    pub target_username: String,

    /// Password for the target cluster.
    #[arg(long = "targetPassword", default_value = "")]
    pub target_password: String,

    /// Bucket name for the target cluster.
    #[arg(long = "targetBucketName", default_value = "")]
    pub target_bucket_name: String,

    /// Directory for mutations streamed from the target cluster.
    #[arg(long = "targetFileDir", default_value = config::DEFAULT_TARGET_FILE_DIR)]
    pub target_file_dir: PathBuf,

    /// Number of source dcp clients.
    #[arg(long = "numberOfSourceDcpClients", default_value_t = config::DEFAULT_NUM_DCP_CLIENTS)]
    pub number_of_source_dcp_clients: usize,

    /// Number of handler workers per source dcp client.
    #[arg(long = "numberOfWorkersPerSourceDcpClient", default_value_t = config::DEFAULT_WORKERS_PER_DCP_CLIENT)]
    pub number_of_workers_per_source_dcp_client: usize,

    /// Number of target dcp clients.
    #[arg(long = "numberOfTargetDcpClients", default_value_t = config::DEFAULT_NUM_DCP_CLIENTS)]
    pub number_of_target_dcp_clients: usize,

    /// Number of handler workers per target dcp client.
    #[arg(long = "numberOfWorkersPerTargetDcpClient", default_value_t = config::DEFAULT_WORKERS_PER_DCP_CLIENT)]
    pub number_of_workers_per_target_dcp_client: usize,

    /// Number of worker threads for the file differ.
    #[arg(long = "numberOfWorkersForFileDiffer", default_value_t = config::DEFAULT_FILE_DIFFER_WORKERS)]
    pub number_of_workers_for_file_differ: usize,

    /// Number of worker threads for the mutation differ.
    #[arg(long = "numberOfWorkersForMutationDiffer", default_value_t = config::DEFAULT_MUTATION_DIFFER_WORKERS)]
    pub number_of_workers_for_mutation_differ: usize,

    /// Number of bins per vbucket.
    #[arg(long = "numberOfBins", default_value_t = config::DEFAULT_NUM_BINS)]
    pub number_of_bins: usize,

    /// Number of pooled file descriptors; 0 disables pooling.
    #[arg(long = "numberOfFileDesc", default_value_t = config::DEFAULT_NUM_FILE_DESC)]
    pub number_of_file_desc: usize,

    /// Duration that stage 1 should run, in seconds; 0 means unbounded.
    #[arg(long = "completeByDuration", default_value_t = 0)]
    pub complete_by_duration: u64,

    /// Complete each vbucket after processing all mutations present at
    /// start time.
    #[arg(long = "completeBySeqno", default_value_t = true, action = ArgAction::Set)]
    pub complete_by_seqno: bool,

    /// Directory for checkpoint files.
    #[arg(long = "checkpointFileDir", default_value = config::DEFAULT_CHECKPOINT_FILE_DIR)]
    pub checkpoint_file_dir: PathBuf,

    /// Source checkpoint file to resume from; unset starts from zero.
    #[arg(long = "oldSourceCheckpointFileName")]
    pub old_source_checkpoint_file_name: Option<String>,

    /// Target checkpoint file to resume from; unset starts from zero.
    #[arg(long = "oldTargetCheckpointFileName")]
    pub old_target_checkpoint_file_name: Option<String>,

    /// Checkpoint file to write on shutdown; unset disables checkpointing.
    #[arg(long = "newCheckpointFileName")]
    pub new_checkpoint_file_name: Option<String>,

    /// Output directory for the file differ.
    #[arg(long = "fileDifferDir", default_value = config::DEFAULT_FILE_DIFFER_DIR)]
    pub file_differ_dir: PathBuf,

    /// Directory to load the diff key list from, overriding the file
    /// differ's output directory.
    #[arg(long = "inputDiffKeysFileDir")]
    pub input_diff_keys_file_dir: Option<PathBuf>,

    /// Output directory for the mutation differ.
    #[arg(long = "mutationDifferDir", default_value = config::DEFAULT_MUTATION_DIFFER_DIR)]
    pub mutation_differ_dir: PathBuf,

    /// Batch size used by the mutation differ.
    #[arg(long = "mutationDifferBatchSize", default_value_t = config::DEFAULT_MUTATION_BATCH_SIZE)]
    pub mutation_differ_batch_size: usize,

    /// Per-worker timeout for the mutation differ, in seconds.
    #[arg(long = "mutationDifferTimeout", default_value_t = config::DEFAULT_MUTATION_TIMEOUT_SECS)]
    pub mutation_differ_timeout: u64,

    /// Capacity of each source dcp handler channel.
    #[arg(long = "sourceDcpHandlerChanSize", default_value_t = config::DEFAULT_DCP_HANDLER_CHAN_SIZE)]
    pub source_dcp_handler_chan_size: usize,

    /// Capacity of each target dcp handler channel.
    #[arg(long = "targetDcpHandlerChanSize", default_value_t = config::DEFAULT_DCP_HANDLER_CHAN_SIZE)]
    pub target_dcp_handler_chan_size: usize,

    /// Timeout for bucket-level operations such as stats, in seconds.
    #[arg(long = "bucketOpTimeout", default_value_t = config::DEFAULT_BUCKET_OP_TIMEOUT_SECS)]
    pub bucket_op_timeout: u64,

    /// Max number of attempts for the stats fetch.
    #[arg(long = "maxNumOfGetStatsRetry", default_value_t = config::DEFAULT_GET_STATS_MAX_ATTEMPTS)]
    pub max_num_of_get_stats_retry: u32,

    /// Max number of attempts for a metadata send batch.
    #[arg(long = "maxNumOfSendBatchRetry", default_value_t = config::DEFAULT_SEND_BATCH_MAX_ATTEMPTS)]
    pub max_num_of_send_batch_retry: u32,

    /// Retry interval for the stats fetch, in seconds.
    #[arg(long = "getStatsRetryInterval", default_value_t = config::DEFAULT_GET_STATS_RETRY_INTERVAL_SECS)]
    pub get_stats_retry_interval: u64,

    /// Retry interval for a metadata send batch, in milliseconds.
    #[arg(long = "sendBatchRetryInterval", default_value_t = config::DEFAULT_SEND_BATCH_RETRY_INTERVAL_MS)]
    pub send_batch_retry_interval: u64,

    /// Max backoff for the stats fetch, in seconds.
    #[arg(long = "getStatsMaxBackoff", default_value_t = config::DEFAULT_GET_STATS_MAX_BACKOFF_SECS)]
    pub get_stats_max_backoff: u64,

    /// Max backoff for a metadata send batch, in seconds.
    #[arg(long = "sendBatchMaxBackoff", default_value_t = config::DEFAULT_SEND_BATCH_MAX_BACKOFF_SECS)]
    pub send_batch_max_backoff: u64,

    /// Delay between source and target cluster startup, in seconds.
    #[arg(long = "delayBetweenSourceAndTarget", default_value_t = config::DEFAULT_DELAY_BETWEEN_SOURCE_AND_TARGET_SECS)]
    pub delay_between_source_and_target: u64,

    /// Interval for periodic checkpointing, in seconds; 0 disables it.
    #[arg(long = "checkpointInterval", default_value_t = config::DEFAULT_CHECKPOINT_INTERVAL_SECS)]
    pub checkpoint_interval: u64,

    /// Filter expression; only mutations with matching keys are compared.
    #[arg(long = "filterExpression")]
    pub filter_expression: Option<String>,

    /// Whether to run data generation (stage 1).
    #[arg(long = "runDataGeneration", default_value_t = true, action = ArgAction::Set)]
    pub run_data_generation: bool,

    /// Whether to run the file differ (stage 2).
    #[arg(long = "runFileDiffer", default_value_t = true, action = ArgAction::Set)]
    pub run_file_differ: bool,

    /// Whether to verify diff keys through metadata gets (stage 3).
    #[arg(long = "runMutationDiffer", default_value_t = true, action = ArgAction::Set)]
    pub run_mutation_differ: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

impl Cli {
    pub fn into_config(self) -> Result<DiffConfig, ConfigError> {
        if self.remote_cluster_name.is_some() {
            return Err(ConfigError::invalid(
                "replication spec lookup requires a metadata service; \
                 pass sourceUrl/targetUrl and credentials directly",
            ));
        }

        let op_timeout = Duration::from_secs(self.bucket_op_timeout.max(1));
        let config = DiffConfig {
            source: ClusterSpec {
                url: self.source_url,
                username: self.source_username,
                password: self.source_password,
                bucket: self.source_bucket_name,
                op_timeout,
            },
            target: ClusterSpec {
                url: self.target_url,
                username: self.target_username,
                password: self.target_password,
                bucket: self.target_bucket_name,
                op_timeout,
            },
            source_file_dir: self.source_file_dir,
            target_file_dir: self.target_file_dir,
            checkpoint_file_dir: self.checkpoint_file_dir,
            file_differ_dir: self.file_differ_dir,
            mutation_differ_dir: self.mutation_differ_dir,
            input_diff_keys_dir: self.input_diff_keys_file_dir,
            old_source_checkpoint_file_name: self.old_source_checkpoint_file_name,
            old_target_checkpoint_file_name: self.old_target_checkpoint_file_name,
            new_checkpoint_file_name: self.new_checkpoint_file_name,
            num_source_dcp_clients: self.number_of_source_dcp_clients,
            workers_per_source_dcp_client: self.number_of_workers_per_source_dcp_client,
            num_target_dcp_clients: self.number_of_target_dcp_clients,
            workers_per_target_dcp_client: self.number_of_workers_per_target_dcp_client,
            file_differ_workers: self.number_of_workers_for_file_differ,
            mutation_differ_workers: self.number_of_workers_for_mutation_differ,
            num_bins: self.number_of_bins,
            num_file_desc: self.number_of_file_desc,
            complete_by_duration: (self.complete_by_duration > 0)
                .then(|| Duration::from_secs(self.complete_by_duration)),
            complete_by_seqno: self.complete_by_seqno,
            mutation_differ_batch_size: self.mutation_differ_batch_size,
            mutation_differ_timeout: Duration::from_secs(self.mutation_differ_timeout.max(1)),
            source_dcp_handler_chan_size: self.source_dcp_handler_chan_size,
            target_dcp_handler_chan_size: self.target_dcp_handler_chan_size,
            get_stats_retry: BackoffPolicy::new(
                Duration::from_secs(self.get_stats_retry_interval.max(1)),
                self.max_num_of_get_stats_retry,
                config::BACKOFF_FACTOR,
                Duration::from_secs(self.get_stats_max_backoff.max(1)),
            ),
            send_batch_retry: BackoffPolicy::new(
                Duration::from_millis(self.send_batch_retry_interval.max(1)),
                self.max_num_of_send_batch_retry,
                config::BACKOFF_FACTOR,
                Duration::from_secs(self.send_batch_max_backoff.max(1)),
            ),
            delay_between_source_and_target: Duration::from_secs(
                self.delay_between_source_and_target,
            ),
            checkpoint_interval: (self.checkpoint_interval > 0)
                .then(|| Duration::from_secs(self.checkpoint_interval)),
            filter_expression: self.filter_expression,
            run_data_generation: self.run_data_generation,
            run_file_differ: self.run_file_differ,
            run_mutation_differ: self.run_mutation_differ,
        };
        config.validate()?;
        Ok(config)
    }
}
