//! One stream connection covering a contiguous vbucket range.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::cluster::{ClusterConnector, ClusterError, StreamClient, StreamEvents};
use crate::core::mutation::Mutation;
use crate::dcp::checkpoint_manager::CheckpointManager;
use crate::dcp::driver::DriverCore;
use crate::dcp::fd_pool::FdPool;
use crate::dcp::filter::MutationFilter;
use crate::dcp::handler::DcpHandler;
use crate::dcp::{CompletionReason, DcpError, VbucketCompletionSink};

/// Shared per-cluster knobs the driver hands to each client.
pub struct ClientConfig {
    pub file_dir: PathBuf,
    pub num_handlers: usize,
    pub num_bins: usize,
    pub chan_size: usize,
    pub fd_pool: Option<Arc<FdPool>>,
    pub filter: Option<Arc<dyn MutationFilter>>,
    pub err_tx: Sender<crate::Error>,
}

pub struct DcpClient {
    name: String,
    handlers: Vec<Arc<DcpHandler>>,
    stream: Option<Box<dyn StreamClient>>,
}

impl DcpClient {
    /// Start handlers for the assigned vbuckets, open the stream connection,
    /// and request one vbucket stream per assigned vbucket. Vbuckets whose
    /// resumed seqno already reached the end report completion immediately
    /// without a stream.
    pub fn start(
        cluster_name: &str,
        client_index: usize,
        vb_list: Vec<u16>,
        connector: &dyn ClusterConnector,
        core: &Arc<DriverCore>,
        checkpoints: &Arc<CheckpointManager>,
        config: &ClientConfig,
    ) -> Result<Self, DcpError> {
        let name = format!("{cluster_name}/client-{client_index}");

        // round-robin vbucket assignment across this client's handlers
        let num_handlers = config.num_handlers.clamp(1, vb_list.len().max(1));
        let mut assignments: Vec<Vec<u16>> = vec![Vec::new(); num_handlers];
        for (i, vbno) in vb_list.iter().enumerate() {
            assignments[i % num_handlers].push(*vbno);
        }

        let mut handlers = Vec::with_capacity(num_handlers);
        let mut by_vb: HashMap<u16, Arc<DcpHandler>> = HashMap::with_capacity(vb_list.len());
        for (index, vbs) in assignments.into_iter().enumerate() {
            let handler = DcpHandler::start(
                &name,
                index,
                vbs.clone(),
                &config.file_dir,
                config.num_bins,
                config.chan_size,
                config.fd_pool.as_ref(),
                config.filter.clone(),
                checkpoints.clone(),
                core.clone(),
                config.err_tx.clone(),
            )?;
            for vbno in vbs {
                by_vb.insert(vbno, handler.clone());
            }
            handlers.push(handler);
        }

        let router = Arc::new(HandlerRouter {
            name: name.clone(),
            by_vb,
            checkpoints: checkpoints.clone(),
            core: core.clone(),
        });
        let mut stream = connector.stream_client(router)?;

        for &vbno in &vb_list {
            let vbts = checkpoints.start_vbts(vbno);
            if vbts.no_need_to_start_stream {
                core.handle_vbucket_completion(vbno, Ok(()), CompletionReason::AlreadyCaughtUp);
                continue;
            }
            stream.start_vbucket_stream(vbno, &vbts.checkpoint, vbts.end_seqno)?;
        }

        tracing::debug!(client = %name, vbuckets = vb_list.len(), "dcp client started");
        Ok(Self {
            name,
            handlers,
            stream: Some(stream),
        })
    }

    /// Stop stream delivery first, then the handlers (which flush their bin
    /// writers).
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        for handler in &self.handlers {
            handler.stop();
        }
        tracing::debug!(client = %self.name, "dcp client stopped");
    }
}

/// Stream observer wired per client: markers feed the checkpoint manager,
/// mutations are routed to the owning handler's queue, and stream ends
/// become vbucket completions.
struct HandlerRouter {
    name: String,
    by_vb: HashMap<u16, Arc<DcpHandler>>,
    checkpoints: Arc<CheckpointManager>,
    core: Arc<DriverCore>,
}

impl StreamEvents for HandlerRouter {
    fn snapshot_marker(&self, vbno: u16, start_seqno: u64, end_seqno: u64) {
        self.checkpoints.update_snapshot(vbno, start_seqno, end_seqno);
    }

    fn mutation(&self, mutation: Mutation) {
        match self.by_vb.get(&mutation.vbno) {
            Some(handler) => handler.enqueue(mutation),
            None => tracing::warn!(
                client = %self.name,
                vbno = mutation.vbno,
                "stream delivered mutation for unassigned vbucket"
            ),
        }
    }

    fn stream_end(&self, vbno: u16, result: Result<(), ClusterError>) {
        // queued behind the vbucket's mutations so completion follows
        // processing
        match self.by_vb.get(&vbno) {
            Some(handler) => handler.enqueue_stream_end(vbno, result),
            None => self
                .core
                .handle_vbucket_completion(vbno, result, CompletionReason::StreamEnded),
        }
    }
}
