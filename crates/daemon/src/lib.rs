//! loopcast
//!
//! Turns a growing directory of video files into one continuous live stream:
//! batches the pool through an external encoder, loops over it forever and
//! reclaims space after every full pass.

pub mod batch;
pub mod daemon;
pub mod encode;
pub mod inventory;
pub mod job_runner;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod relegation;
pub mod retention;
pub mod stability;
pub mod startup;
pub mod viewers;
pub mod watcher;

pub use loopcast_config as config;
pub use loopcast_config::Config;

pub use batch::{plan_batches, Batch};
pub use daemon::{Daemon, DaemonError, DaemonOptions};
pub use encode::{build_ffmpeg_command, render_manifest, write_manifest, StreamEncodeParams};
pub use inventory::{InventoryError, MediaClass, MediaFile, MediaInventory};
pub use job_runner::{BatchEncoder, EncodeError, EncodeJob, FfmpegRunner, JobOutcome};
pub use metrics::{
    collect_system_metrics, new_shared_status, PipelineSnapshot, PipelineState, SharedStatus,
    SystemMetrics, ViewerCounts,
};
pub use metrics_server::{create_status_router, run_status_server, ServerError};
pub use orchestrator::{
    CycleEnd, CycleState, OrchestratorError, OrchestratorSettings, Readiness, StreamOrchestrator,
};
pub use relegation::{relegate, relegated_path, run_relegation, RelegationError, RelegationOutcome};
pub use retention::{reclaim, surviving, RetentionReport};
pub use startup::{
    check_ffmpeg_available, check_sink_url, check_source_dir, parse_ffmpeg_version,
    run_startup_checks, StartupError,
};
pub use viewers::{run_sampler, sample_viewers, SamplerError};
pub use watcher::{FolderWatcher, RescanSignal, WatcherError};
