//! Service assembly for loopcast
//!
//! Wires the folder watcher, orchestrator, status endpoint and optional
//! viewer sampler together around one cancellation token.

use crate::config::{Config, ConfigError};
use crate::encode::StreamEncodeParams;
use crate::inventory::MediaInventory;
use crate::job_runner::FfmpegRunner;
use crate::metrics::{new_shared_status, run_system_updater, SharedStatus};
use crate::metrics_server::run_status_server;
use crate::orchestrator::{OrchestratorError, OrchestratorSettings, StreamOrchestrator};
use crate::startup::{run_startup_checks, StartupError};
use crate::viewers::run_sampler;
use crate::watcher::{FolderWatcher, WatcherError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often system metrics in the status snapshot are refreshed
const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Folder watcher could not be set up
    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    /// Orchestrator stopped on a fatal condition
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Which parts of the service to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonOptions {
    /// Verify the encoder binary before starting
    pub check_encoder: bool,
    /// React to filesystem events instead of relying on polling alone
    pub watch: bool,
    /// Run the viewer sampler in-process and publish its counts
    pub with_viewers: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            check_encoder: true,
            watch: true,
            with_viewers: false,
        }
    }
}

/// Streaming service state
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    options: DaemonOptions,
    status: SharedStatus,
}

impl Daemon {
    /// Validate `config` and run the startup checks
    ///
    /// # Returns
    /// * `Ok(Daemon)` - ready to run
    /// * `Err(DaemonError)` - the configuration or environment is unusable
    pub fn new(config: Config, options: DaemonOptions) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config, options.check_encoder)?;

        Ok(Self {
            config,
            options,
            status: new_shared_status(),
        })
    }

    /// Get the shared status
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Start the status HTTP server as a background task
    pub fn start_status_server(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let status = self.status.clone();
        let bind_addr = self.config.status.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(status, &bind_addr, cancel).await {
                error!(error = %e, "status server stopped");
            }
        })
    }

    /// Periodically refresh system metrics in the shared status
    pub fn start_system_updater(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_system_updater(
            self.status.clone(),
            SYSTEM_METRICS_INTERVAL,
            cancel,
        ))
    }

    /// Start the viewer sampler, publishing into the shared status
    pub fn start_viewer_sampler(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let settings = self.config.viewers.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            if let Err(e) = run_sampler(&settings, Some(status), cancel).await {
                warn!(error = %e, "viewer sampler unavailable");
            }
        })
    }

    /// Run the service until `cancel` fires or the orchestrator fails
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let cfg = &self.config;
        let inventory = MediaInventory::new(&cfg.source.watch_dir, &cfg.source.extensions);

        let (signal_tx, signal_rx) = mpsc::channel(cfg.timing.signal_queue_capacity.max(1));
        let watcher = if self.options.watch {
            Some(FolderWatcher::start(
                inventory.clone(),
                cfg.timing.settle_delay(),
                signal_tx,
                cancel.clone(),
            )?)
        } else {
            info!("folder watcher disabled, relying on polling");
            None
        };
        let signals = watcher.as_ref().map(|_| signal_rx);

        let mut background = vec![self.start_system_updater(cancel.clone())];
        if cfg.status.enabled {
            background.push(self.start_status_server(cancel.clone()));
        }
        if self.options.with_viewers {
            background.push(self.start_viewer_sampler(cancel.clone()));
        }

        let encoder = FfmpegRunner::new(
            StreamEncodeParams::from(&cfg.encoder),
            cfg.source.manifest_path(),
            cfg.encoder.job_timeout(),
        );
        let mut orchestrator = StreamOrchestrator::new(
            OrchestratorSettings::from(cfg),
            inventory,
            encoder,
            signals,
            self.status.clone(),
            cancel.clone(),
        );

        let result = orchestrator.run().await;

        // Stop the helpers whether the loop ended cleanly or not
        cancel.cancel();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        for handle in background {
            let _ = handle.await;
        }

        result.map_err(DaemonError::from)
    }
}
