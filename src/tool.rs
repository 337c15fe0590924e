//! Top-level coordinator: sequences the three stages, owns the delay between
//! source and target startup, and implements the interrupt policy.
//!
//! Interrupts: before any driver has started, exit immediately; during
//! stage 1, stop both drivers and continue to stages 2 and 3; any further
//! interrupt exits.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, after, bounded};
use crossbeam::sync::WaitGroup;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::cluster::{self, ClusterConnector};
use crate::config::{ConfigError, DiffConfig};
use crate::dcp::{DcpDriver, DcpDriverConfig, FdPool, KeyRegexFilter, MutationFilter};
use crate::differ::{FileDiffer, MutationDiffer};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ToolPhase {
    Initial,
    Streaming,
    Final,
}

type DriverPair = (Arc<DcpDriver>, Arc<DcpDriver>);

pub struct DiffTool {
    config: DiffConfig,
    source_connector: Option<Arc<dyn ClusterConnector>>,
    target_connector: Option<Arc<dyn ClusterConnector>>,
    phase: Arc<Mutex<ToolPhase>>,
    drivers: Arc<Mutex<Option<DriverPair>>>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
}

impl DiffTool {
    /// Validate the configuration and resolve cluster connectors from the
    /// URL schemes when an enabled stage needs them.
    pub fn new(config: DiffConfig) -> Result<Self> {
        config.validate()?;
        let (source_connector, target_connector) = if config.needs_clusters() {
            (
                Some(cluster::connect(&config.source)?),
                Some(cluster::connect(&config.target)?),
            )
        } else {
            (None, None)
        };
        Ok(Self::assemble(config, source_connector, target_connector))
    }

    /// Inject connectors directly, bypassing URL resolution. Used by tests
    /// and embedding applications with their own transports.
    pub fn with_connectors(
        config: DiffConfig,
        source_connector: Arc<dyn ClusterConnector>,
        target_connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(
            config,
            Some(source_connector),
            Some(target_connector),
        ))
    }

    fn assemble(
        config: DiffConfig,
        source_connector: Option<Arc<dyn ClusterConnector>>,
        target_connector: Option<Arc<dyn ClusterConnector>>,
    ) -> Self {
        let (interrupt_tx, interrupt_rx) = bounded(1);
        Self {
            config,
            source_connector,
            target_connector,
            phase: Arc::new(Mutex::new(ToolPhase::Initial)),
            drivers: Arc::new(Mutex::new(None)),
            interrupt_tx,
            interrupt_rx,
        }
    }

    /// Install the signal monitor and run the enabled stages in order.
    pub fn run(&self) -> Result<()> {
        self.spawn_signal_monitor();

        if self.config.run_data_generation {
            self.generate_data_files()?;
        } else {
            tracing::info!("skipping data generation, stage is disabled");
        }

        if self.config.run_file_differ {
            self.diff_data_files()?;
        } else {
            tracing::info!("skipping file differ, stage is disabled");
        }

        if self.config.run_mutation_differ {
            self.diff_mutations()?;
        } else {
            tracing::info!("skipping mutation differ, stage is disabled");
        }

        Ok(())
    }

    fn connectors(&self) -> Result<(Arc<dyn ClusterConnector>, Arc<dyn ClusterConnector>)> {
        match (&self.source_connector, &self.target_connector) {
            (Some(source), Some(target)) => Ok((source.clone(), target.clone())),
            _ => Err(ConfigError::invalid("cluster connectors are not configured").into()),
        }
    }

    /// Stage 1: start both drivers (target delayed), then wait for seqno
    /// completion or the configured duration.
    fn generate_data_files(&self) -> Result<()> {
        tracing::info!("data generation started");
        let (source_connector, target_connector) = self.connectors()?;

        for dir in [
            &self.config.source_file_dir,
            &self.config.target_file_dir,
            &self.config.checkpoint_file_dir,
        ] {
            fs::create_dir_all(dir).map_err(|err| {
                Error::Config(ConfigError::invalid(format!(
                    "cannot create directory {}: {err}",
                    dir.display()
                )))
            })?;
        }

        let filter: Option<Arc<dyn MutationFilter>> = match &self.config.filter_expression {
            Some(expression) => {
                tracing::info!(expression, "using replication filter");
                Some(Arc::new(
                    KeyRegexFilter::new(expression).map_err(crate::dcp::DcpError::from)?,
                ))
            }
            None => None,
        };

        let fd_pool = (self.config.num_file_desc > 0)
            .then(|| FdPool::new(self.config.num_file_desc));

        let (err_tx, err_rx) = bounded::<Error>(2);
        let wait_group = WaitGroup::new();

        tracing::info!(url = %self.config.source.url, "starting source dcp driver");
        let source_driver = DcpDriver::new(
            DcpDriverConfig::for_source(&self.config),
            source_connector,
            fd_pool.clone(),
            filter.clone(),
            err_tx.clone(),
            wait_group.clone(),
        );
        start_driver_async(&source_driver, &err_tx);

        let delay = self.config.delay_between_source_and_target;
        tracing::info!(delay_secs = delay.as_secs(), "waiting before starting target");
        std::thread::sleep(delay);

        tracing::info!(url = %self.config.target.url, "starting target dcp driver");
        let target_driver = DcpDriver::new(
            DcpDriverConfig::for_target(&self.config),
            target_connector,
            fd_pool,
            filter,
            err_tx.clone(),
            wait_group.clone(),
        );
        start_driver_async(&target_driver, &err_tx);

        *self.drivers.lock().expect("drivers lock poisoned") =
            Some((source_driver.clone(), target_driver.clone()));
        *self.phase.lock().expect("phase lock poisoned") = ToolPhase::Streaming;

        let result = if self.config.complete_by_seqno {
            self.wait_for_completion(wait_group, &err_rx, &source_driver, &target_driver)
        } else {
            let duration = self
                .config
                .complete_by_duration
                .expect("validated in DiffConfig::validate");
            self.wait_for_duration(duration, delay, &err_rx, &source_driver, &target_driver)
        };

        *self.phase.lock().expect("phase lock poisoned") = ToolPhase::Final;
        tracing::info!("data generation completed");
        result
    }

    fn wait_for_completion(
        &self,
        wait_group: WaitGroup,
        err_rx: &Receiver<Error>,
        source_driver: &Arc<DcpDriver>,
        target_driver: &Arc<DcpDriver>,
    ) -> Result<()> {
        let (done_tx, done_rx) = bounded::<()>(1);
        std::thread::spawn(move || {
            wait_group.wait();
            let _ = done_tx.send(());
        });

        let result = crossbeam::channel::select! {
            recv(err_rx) -> err => match err {
                Ok(err) => {
                    tracing::error!("stopping diff generation on stage error: {err}");
                    Err(err)
                }
                Err(_) => Ok(()),
            },
            recv(done_rx) -> _ => {
                tracing::info!("source and target clusters have completed");
                Ok(())
            }
            recv(self.interrupt_rx) -> _ => {
                tracing::warn!("diff generation interrupted");
                Ok(())
            }
        };

        source_driver.stop();
        target_driver.stop();
        result
    }

    fn wait_for_duration(
        &self,
        duration: Duration,
        delay: Duration,
        err_rx: &Receiver<Error>,
        source_driver: &Arc<DcpDriver>,
        target_driver: &Arc<DcpDriver>,
    ) -> Result<()> {
        let timer = after(duration);
        let result = crossbeam::channel::select! {
            recv(err_rx) -> err => match err {
                Ok(err) => {
                    tracing::error!("stopping diff generation on stage error: {err}");
                    Err(err)
                }
                Err(_) => Ok(()),
            },
            recv(timer) -> _ => {
                tracing::info!("stopping diff generation after the configured duration");
                Ok(())
            }
            recv(self.interrupt_rx) -> _ => {
                tracing::warn!("diff generation interrupted");
                Ok(())
            }
        };

        source_driver.stop();
        std::thread::sleep(delay);
        target_driver.stop();
        result
    }

    /// Stage 2: recreate the output directory and run the file differ.
    fn diff_data_files(&self) -> Result<()> {
        tracing::info!("file differ started");
        recreate_dir(&self.config.file_differ_dir)?;
        FileDiffer::new(&self.config).run()?;
        Ok(())
    }

    /// Stage 3: recreate the output directory and run the mutation differ.
    fn diff_mutations(&self) -> Result<()> {
        tracing::info!("mutation differ started");
        let (source_connector, target_connector) = self.connectors()?;
        recreate_dir(&self.config.mutation_differ_dir)?;
        MutationDiffer::new(&self.config, source_connector, target_connector).run()?;
        Ok(())
    }

    fn spawn_signal_monitor(&self) {
        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => signals,
            Err(err) => {
                tracing::warn!("cannot install signal handler: {err}");
                return;
            }
        };
        let phase = self.phase.clone();
        let drivers = self.drivers.clone();
        let interrupt_tx = self.interrupt_tx.clone();
        std::thread::spawn(move || {
            for _signal in signals.forever() {
                let mut phase = phase.lock().expect("phase lock poisoned");
                match *phase {
                    ToolPhase::Initial => std::process::exit(0),
                    ToolPhase::Streaming => {
                        tracing::warn!("interrupt received, stopping dcp drivers");
                        if let Some((source, target)) =
                            drivers.lock().expect("drivers lock poisoned").clone()
                        {
                            source.stop();
                            target.stop();
                        }
                        *phase = ToolPhase::Final;
                        let _ = interrupt_tx.try_send(());
                    }
                    ToolPhase::Final => std::process::exit(0),
                }
            }
        });
    }
}

fn start_driver_async(driver: &Arc<DcpDriver>, err_tx: &Sender<Error>) {
    let driver = driver.clone();
    let err_tx = err_tx.clone();
    std::thread::spawn(move || {
        if let Err(err) = driver.start() {
            tracing::error!("dcp driver start failed: {err}");
            let _ = err_tx.try_send(err.into());
        }
    });
}

fn recreate_dir(dir: &Path) -> Result<()> {
    if let Err(err) = fs::remove_dir_all(dir)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), "cannot remove output directory: {err}");
    }
    fs::create_dir_all(dir).map_err(|err| {
        Error::Config(ConfigError::invalid(format!(
            "cannot create directory {}: {err}",
            dir.display()
        )))
    })
}
