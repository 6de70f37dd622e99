//! CLI entry point for loopcast
//!
//! Parses command line arguments, sets up logging and runs the requested
//! service until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loopcast::relegation::{run_relegation, RelegationOutcome};
use loopcast::viewers::run_sampler;
use loopcast::{Config, Daemon, DaemonOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Config file looked up when `--config` is not given
const DEFAULT_CONFIG: &str = "loopcast.toml";

/// loopcast - loop a growing directory of videos into one live stream
#[derive(Parser, Debug)]
#[command(name = "loopcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults to ./loopcast.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream the media pool to the configured sink
    Stream {
        /// Skip the ffmpeg availability check. For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,

        /// Do not watch the source directory; rely on polling only
        #[arg(long, default_value = "false")]
        no_watch: bool,

        /// Also sample viewer counts and publish them on the status endpoint
        #[arg(long, default_value = "false")]
        with_viewers: bool,
    },

    /// Log viewer counts per stream port
    Viewers,

    /// Rename the configured stream directory to <name>_relegated after the delay
    Relegate {
        /// Skip the delay
        #[arg(long, default_value = "false")]
        now: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let cancel = shutdown_on_ctrl_c();

    match args.command {
        Command::Stream {
            skip_checks,
            no_watch,
            with_viewers,
        } => {
            if skip_checks {
                warn!("Skipping ffmpeg check (--skip-checks enabled)");
            }
            let options = DaemonOptions {
                check_encoder: !skip_checks,
                watch: !no_watch,
                with_viewers,
            };

            let daemon = Daemon::new(config, options).context("Failed to initialize loopcast")?;
            if daemon.config.status.enabled {
                info!(
                    "Status endpoint on http://{}/status",
                    daemon.config.status.bind_addr
                );
            }
            daemon.run(cancel).await.context("Streaming stopped")?;
        }
        Command::Viewers => {
            run_sampler(&config.viewers, None, cancel)
                .await
                .context("Viewer sampler failed")?;
        }
        Command::Relegate { now } => {
            let mut settings = config.relegation.clone();
            if now {
                settings.delay_secs = 0;
            }
            match run_relegation(&settings, cancel)
                .await
                .context("Relegation failed")?
            {
                RelegationOutcome::Renamed { from, to } => {
                    info!("Renamed {} to {}", from.display(), to.display())
                }
                RelegationOutcome::Missing => {
                    info!("{} does not exist, nothing to do", settings.target_dir.display())
                }
                RelegationOutcome::Cancelled => info!("Relegation cancelled"),
            }
        }
    }

    Ok(())
}

/// Load the explicit config file, or the default one if it exists, or defaults
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG)),
        None => {
            info!("No {} found, using defaults", DEFAULT_CONFIG);
            Config::from_env().context("Invalid configuration from environment")
        }
    }
}

/// Token cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                trigger.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    cancel
}
