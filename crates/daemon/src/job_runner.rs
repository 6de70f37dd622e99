//! Encode job runner for loopcast
//!
//! Runs one external encoder invocation per batch and reports how it ended.
//! A single-permit semaphore guarantees that at most one job is active.

use crate::batch::Batch;
use crate::encode::{build_ffmpeg_command, write_manifest, StreamEncodeParams};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Lines of encoder stderr kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// How long a failed encoder's stderr may stay open after it exited
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Error type for job runner operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Another job holds the single-flight permit
    #[error("an encode job is already active")]
    AlreadyActive,
}

/// How an encoder invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Process exited with status 0
    Completed,
    /// Process exited non-zero (`exit_code`) or was killed by a signal (`None`)
    Failed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    /// The manifest could not be written or the process could not be started
    LaunchFailed { reason: String },
    /// The configured job timeout elapsed and the process was killed
    TimedOut,
    /// Shutdown was requested and the process was killed
    Cancelled,
}

impl JobOutcome {
    /// Convert outcome to string for status reporting
    pub fn as_str(&self) -> &str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::LaunchFailed { .. } => "launch_failed",
            JobOutcome::TimedOut => "timed_out",
            JobOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }
}

/// One encoder invocation bound to one batch
#[derive(Debug, Clone)]
pub struct EncodeJob {
    /// Unique job identifier
    pub id: String,
    /// Index of the batch within its cycle
    pub batch_index: usize,
    /// Files concatenated by this job, in order
    pub members: Vec<PathBuf>,
    /// Network sink the encoder publishes to
    pub sink_url: String,
}

impl EncodeJob {
    /// Create a job for `batch`
    pub fn for_batch(batch: &Batch, sink_url: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            batch_index: batch.index,
            members: batch.files.iter().map(|f| f.path.clone()).collect(),
            sink_url: sink_url.to_string(),
        }
    }
}

/// Something that can stream one batch and report the result.
///
/// The orchestrator only talks to this seam, which keeps it testable
/// without spawning an encoder.
#[async_trait]
pub trait BatchEncoder: Send + Sync {
    /// Run `job` to completion; `cancel` asks for the job to be torn down.
    async fn run(&self, job: &EncodeJob, cancel: &CancellationToken)
        -> Result<JobOutcome, EncodeError>;
}

/// Runs batches through the FFmpeg concat pipeline
pub struct FfmpegRunner {
    params: StreamEncodeParams,
    manifest_path: PathBuf,
    timeout: Option<Duration>,
    /// Single permit: at most one process may read the manifest
    permit: Arc<Semaphore>,
}

impl FfmpegRunner {
    /// Create a new runner
    ///
    /// # Arguments
    /// * `params` - Encoder parameters shared by every batch
    /// * `manifest_path` - Where the concat manifest is written
    /// * `timeout` - Optional limit per invocation; `None` waits indefinitely
    pub fn new(params: StreamEncodeParams, manifest_path: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            params,
            manifest_path,
            timeout,
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn manifest_path(&self) -> &PathBuf {
        &self.manifest_path
    }

    /// Whether a job currently holds the permit
    pub fn is_active(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Try to take the single-flight permit without waiting
    fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permit.clone().try_acquire_owned().ok()
    }
}

#[async_trait]
impl BatchEncoder for FfmpegRunner {
    async fn run(
        &self,
        job: &EncodeJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, EncodeError> {
        let _permit = self.try_reserve().ok_or(EncodeError::AlreadyActive)?;

        if let Err(e) = write_manifest(&self.manifest_path, &job.members).await {
            return Ok(JobOutcome::LaunchFailed {
                reason: format!(
                    "failed to write manifest {}: {}",
                    self.manifest_path.display(),
                    e
                ),
            });
        }

        let cmd = Command::from(build_ffmpeg_command(
            &self.params,
            &self.manifest_path,
            &job.sink_url,
        ));

        Ok(supervise(cmd, &job.id, self.timeout, cancel).await)
    }
}

/// Spawn `cmd` and wait for it to end, be cancelled, or time out.
///
/// Stdout is discarded; stderr is logged at debug level and its last lines
/// are attached to a failure outcome.
pub async fn supervise(
    mut cmd: Command,
    job_id: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> JobOutcome {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return JobOutcome::LaunchFailed {
                reason: format!(
                    "failed to start {}: {}",
                    cmd.as_std().get_program().to_string_lossy(),
                    e
                ),
            }
        }
    };
    info!(job_id, pid = child.id(), "encoder started");

    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(collect_stderr_tail(
            stderr,
            job_id.to_string(),
            tail.clone(),
        ))
    });

    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = deadline(timeout) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let outcome = match waited {
        Waited::Exited(Ok(status)) if status.success() => JobOutcome::Completed,
        Waited::Exited(Ok(status)) => JobOutcome::Failed {
            exit_code: status.code(),
            stderr_tail: String::new(),
        },
        Waited::Exited(Err(e)) => JobOutcome::LaunchFailed {
            reason: format!("failed waiting for encoder: {}", e),
        },
        Waited::TimedOut => {
            let _ = child.kill().await;
            JobOutcome::TimedOut
        }
        Waited::Cancelled => {
            let _ = child.kill().await;
            JobOutcome::Cancelled
        }
    };

    // Grandchildren of the encoder may keep the pipe open after it exits
    if let Some(mut handle) = stderr_task {
        if matches!(outcome, JobOutcome::Failed { .. }) {
            if tokio::time::timeout(STDERR_DRAIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                debug!(job_id, "encoder stderr still open, keeping partial tail");
                handle.abort();
            }
        } else {
            handle.abort();
        }
    }
    let tail = tail
        .lock()
        .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();

    debug!(
        job_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        outcome = outcome.as_str(),
        "encoder finished"
    );

    match outcome {
        JobOutcome::Failed { exit_code, .. } => JobOutcome::Failed {
            exit_code,
            stderr_tail: tail,
        },
        other => other,
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

async fn collect_stderr_tail(
    stderr: ChildStderr,
    job_id: String,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(job_id = %job_id, "encoder: {}", line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}
