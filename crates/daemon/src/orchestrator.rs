//! Stream orchestrator: the top-level loop of loopcast.
//!
//! Decides whether enough media exists, plans batches, streams them one at a
//! time through a [`BatchEncoder`], reclaims disk space after each full pass
//! and then starts over. The folder watcher only feeds a signal queue that is
//! drained here between batches; it never reaches into a running cycle.

use crate::batch::plan_batches;
use crate::config::Config;
use crate::inventory::{InventoryError, MediaFile, MediaInventory};
use crate::job_runner::{BatchEncoder, EncodeError, EncodeJob, JobOutcome};
use crate::metrics::{LastOutcome, PipelineSnapshot, PipelineState, SharedStatus};
use crate::retention::{reclaim, surviving, RetentionReport};
use crate::watcher::RescanSignal;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Conditions that stop the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The encoder refused a job, meaning single-flight was broken
    #[error("encoder rejected job: {0}")]
    Encoder(#[from] EncodeError),

    /// A blocking filesystem task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Settings the orchestrator reads once at construction
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub sink_url: String,
    pub batch_size: usize,
    pub min_media: usize,
    pub delete_count: usize,
    /// First wait while idle
    pub poll_interval: Duration,
    /// Ceiling for the idle wait as it backs off
    pub max_poll_interval: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            sink_url: cfg.stream.sink_url.clone(),
            batch_size: cfg.stream.batch_size,
            min_media: cfg.stream.min_media,
            delete_count: cfg.stream.delete_count,
            poll_interval: cfg.timing.poll_interval(),
            max_poll_interval: cfg.timing.max_poll_interval(),
        }
    }
}

/// Run state of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Below the minimum media threshold, waiting
    Idle,
    /// Streaming batch `batch_index` of `batch_count`
    Streaming { batch_index: usize, batch_count: usize },
    /// Every batch of the current pass has finished
    CycleComplete,
}

impl From<CycleState> for PipelineState {
    fn from(state: CycleState) -> Self {
        match state {
            CycleState::Idle => PipelineState::Idle,
            CycleState::Streaming { .. } => PipelineState::Streaming,
            CycleState::CycleComplete => PipelineState::CycleComplete,
        }
    }
}

/// Result of a readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Enough media; the snapshot to stream
    Ready(Vec<MediaFile>),
    /// Not enough media yet
    Waiting { found: usize, required: usize },
}

/// Summary of a finished cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub batch_sizes: Vec<usize>,
    pub outcomes: Vec<JobOutcome>,
    /// `None` when the post-cycle listing failed and retention was skipped
    pub retention: Option<RetentionReport>,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEnd {
    Completed(CycleReport),
    /// Stopped at a batch boundary; retention did not run
    Cancelled { batches_run: usize },
}

/// Idle wait that grows from `base` to `max`, doubling each time.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Wait to use now; the following one doubles up to the ceiling.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Streams the media pool in batches, forever, until cancelled.
pub struct StreamOrchestrator<E: BatchEncoder> {
    settings: OrchestratorSettings,
    inventory: MediaInventory,
    encoder: E,
    /// `None` when running without a watcher or after the watcher went away
    signals: Option<mpsc::Receiver<RescanSignal>>,
    status: SharedStatus,
    cancel: CancellationToken,
    state: CycleState,
    cycle: u64,
}

impl<E: BatchEncoder> StreamOrchestrator<E> {
    pub fn new(
        settings: OrchestratorSettings,
        inventory: MediaInventory,
        encoder: E,
        signals: Option<mpsc::Receiver<RescanSignal>>,
        status: SharedStatus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            inventory,
            encoder,
            signals,
            status,
            cancel,
            state: CycleState::Idle,
            cycle: 0,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Number of cycles started so far
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Scan the inventory and decide whether a cycle can start.
    ///
    /// Read-only: calling it repeatedly on an unchanged directory gives the
    /// same answer and touches nothing.
    pub async fn evaluate_readiness(&self) -> Result<Readiness, InventoryError> {
        let files = self.snapshot_inventory().await?;
        let required = self.settings.min_media.max(1);

        if files.len() >= required {
            Ok(Readiness::Ready(files))
        } else {
            Ok(Readiness::Waiting {
                found: files.len(),
                required,
            })
        }
    }

    /// Run until cancelled.
    ///
    /// An empty or short inventory, a failed scan and any encoder outcome are
    /// all handled inside the loop; only a broken encoder contract or a
    /// crashed background task ends it with an error.
    pub async fn run(&mut self) -> Result<(), OrchestratorError> {
        let mut backoff = Backoff::new(self.settings.poll_interval, self.settings.max_poll_interval);
        info!(
            dir = %self.inventory.dir().display(),
            sink = %self.settings.sink_url,
            batch_size = self.settings.batch_size,
            min_media = self.settings.min_media,
            delete_count = self.settings.delete_count,
            "orchestrator started"
        );

        while !self.cancel.is_cancelled() {
            match self.evaluate_readiness().await {
                Ok(Readiness::Ready(files)) => {
                    backoff.reset();
                    match self.run_cycle(files).await? {
                        // Re-scan right away; a full pool starts the next cycle without waiting
                        CycleEnd::Completed(_) => continue,
                        CycleEnd::Cancelled { .. } => break,
                    }
                }
                Ok(Readiness::Waiting { found, required }) => {
                    self.set_state(CycleState::Idle, |s| s.inventory_size = found)
                        .await;
                    let wait = backoff.next_wait();
                    info!(
                        found,
                        required,
                        retry_secs = wait.as_secs_f64(),
                        "waiting for media, will retry"
                    );
                    self.wait_idle(wait).await;
                }
                Err(e) => {
                    self.set_state(CycleState::Idle, |_| {}).await;
                    let wait = backoff.next_wait();
                    warn!(error = %e, retry_secs = wait.as_secs_f64(), "inventory scan failed, will retry");
                    self.wait_idle(wait).await;
                }
            }
        }

        self.status.write().await.state = PipelineState::Stopped;
        info!(cycles = self.cycle, "orchestrator stopped");
        Ok(())
    }

    /// Stream one pass over `files`, then reclaim space.
    ///
    /// The batch plan is fixed when the cycle starts; files arriving or
    /// vanishing later do not change it. Every batch runs regardless of how
    /// the previous one ended. Cancellation is honoured between batches.
    pub async fn run_cycle(&mut self, files: Vec<MediaFile>) -> Result<CycleEnd, OrchestratorError> {
        self.cycle += 1;
        let cycle = self.cycle;
        let batches = plan_batches(&files, self.settings.batch_size);
        let batch_count = batches.len();

        info!(cycle, files = files.len(), batch_count, "starting cycle");
        {
            let mut status = self.status.write().await;
            status.cycle = cycle;
            status.batch_count = batch_count;
            status.inventory_size = files.len();
        }

        let mut outcomes = Vec::with_capacity(batch_count);
        for batch in &batches {
            if self.cancel.is_cancelled() {
                info!(cycle, batch_index = batch.index, "shutdown requested, stopping at batch boundary");
                return Ok(CycleEnd::Cancelled {
                    batches_run: outcomes.len(),
                });
            }

            let drained = self.drain_signals();
            if drained > 0 {
                // The cycle-end rescan picks up whatever these announced
                debug!(cycle, drained, "re-evaluation requests deferred to cycle end");
                self.status.write().await.counters.signals_received += drained as u64;
            }

            let job = EncodeJob::for_batch(batch, &self.settings.sink_url);
            let members: Vec<String> = job
                .members
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            self.set_state(
                CycleState::Streaming {
                    batch_index: batch.index,
                    batch_count,
                },
                |s| {
                    s.batch_index = Some(batch.index);
                    s.current_members = members;
                },
            )
            .await;

            info!(
                cycle,
                batch_index = batch.index,
                batch_count,
                job_id = %job.id,
                members = ?job.members,
                "streaming batch"
            );

            let outcome = self.encoder.run(&job, &self.cancel).await?;
            self.record_outcome(cycle, &job, &outcome).await;

            let cancelled = outcome == JobOutcome::Cancelled;
            outcomes.push(outcome);
            if cancelled {
                return Ok(CycleEnd::Cancelled {
                    batches_run: outcomes.len(),
                });
            }
        }

        self.set_state(CycleState::CycleComplete, |s| {
            s.batch_index = None;
            s.current_members.clear();
            s.counters.cycles_completed += 1;
        })
        .await;
        info!(cycle, batch_count, "cycle complete, restarting from the first file");

        let retention = self.reclaim_space(&files).await?;

        Ok(CycleEnd::Completed(CycleReport {
            cycle,
            batch_sizes: batches.iter().map(|b| b.len()).collect(),
            outcomes,
            retention,
        }))
    }

    async fn snapshot_inventory(&self) -> Result<Vec<MediaFile>, InventoryError> {
        let inventory = self.inventory.clone();
        match tokio::task::spawn_blocking(move || inventory.list()).await {
            Ok(listing) => listing,
            Err(e) => Err(InventoryError::Unavailable {
                path: self.inventory.dir().to_path_buf(),
                reason: format!("listing task failed: {}", e),
            }),
        }
    }

    /// Delete the oldest files of the cycle snapshot that are still present.
    async fn reclaim_space(
        &mut self,
        snapshot: &[MediaFile],
    ) -> Result<Option<RetentionReport>, OrchestratorError> {
        let current = match self.snapshot_inventory().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "skipping retention, inventory scan failed");
                return Ok(None);
            }
        };

        let candidates = surviving(snapshot, &current);
        let delete_count = self.settings.delete_count;
        let report = tokio::task::spawn_blocking(move || reclaim(&candidates, delete_count)).await?;

        {
            let mut status = self.status.write().await;
            status.counters.deleted_files += report.deleted.len() as u64;
            status.counters.deletion_failures += report.failures.len() as u64;
        }
        debug!(
            deleted = report.deleted.len(),
            failures = report.failures.len(),
            skipped = report.skipped,
            "retention finished"
        );

        Ok(Some(report))
    }

    async fn record_outcome(&self, cycle: u64, job: &EncodeJob, outcome: &JobOutcome) {
        let batch_index = job.batch_index;
        let job_id = job.id.as_str();
        let mut exit_code = None;

        match outcome {
            JobOutcome::Completed => {
                info!(cycle, batch_index, job_id, "batch finished");
                exit_code = Some(0);
            }
            JobOutcome::Failed {
                exit_code: code,
                stderr_tail,
            } => {
                exit_code = *code;
                warn!(
                    cycle,
                    batch_index,
                    job_id,
                    exit_code = ?code,
                    stderr_tail = %stderr_tail,
                    "encoder failed, continuing with next batch"
                );
            }
            JobOutcome::LaunchFailed { reason } => {
                warn!(cycle, batch_index, job_id, reason = %reason, "encoder could not be launched, continuing with next batch");
            }
            JobOutcome::TimedOut => {
                warn!(cycle, batch_index, job_id, "encoder timed out and was killed, continuing with next batch");
            }
            JobOutcome::Cancelled => {
                info!(cycle, batch_index, job_id, "encoder stopped for shutdown");
            }
        }

        let mut status = self.status.write().await;
        match outcome {
            JobOutcome::Completed => status.counters.completed_jobs += 1,
            JobOutcome::Failed { .. } => status.counters.failed_jobs += 1,
            JobOutcome::LaunchFailed { .. } => status.counters.launch_failed_jobs += 1,
            JobOutcome::TimedOut => status.counters.timed_out_jobs += 1,
            JobOutcome::Cancelled => {}
        }
        status.last_outcome = Some(LastOutcome {
            job_id: job.id.clone(),
            batch_index,
            outcome: outcome.as_str().to_string(),
            exit_code,
        });
    }

    async fn set_state(&mut self, state: CycleState, update: impl FnOnce(&mut PipelineSnapshot)) {
        self.state = state;
        let mut status = self.status.write().await;
        status.state = state.into();
        update(&mut status);
    }

    /// Take every pending signal without waiting; returns how many there were.
    fn drain_signals(&mut self) -> usize {
        let Some(rx) = self.signals.as_mut() else {
            return 0;
        };

        let mut drained = 0;
        loop {
            match rx.try_recv() {
                Ok(_) => drained += 1,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("watcher signal queue closed");
                    self.signals = None;
                    break;
                }
            }
        }
        drained
    }

    /// Sleep for `wait`, waking early on a watcher signal or shutdown.
    async fn wait_idle(&mut self, wait: Duration) {
        let cancel = &self.cancel;
        let signals = &mut self.signals;
        let signal = async move {
            match signals.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        let woke = tokio::select! {
            _ = cancel.cancelled() => return,
            received = signal => Some(received),
            _ = tokio::time::sleep(wait) => None,
        };

        match woke {
            Some(Some(signal)) => {
                let extra = self.drain_signals();
                debug!(path = %signal.path.display(), coalesced = extra, "woken by watcher");
                self.status.write().await.counters.signals_received += 1 + extra as u64;
            }
            Some(None) => {
                debug!("watcher signal queue closed");
                self.signals = None;
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_status;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    /// In-memory encoder that plays back scripted outcomes.
    #[derive(Clone, Default)]
    struct ScriptedEncoder {
        inner: Arc<ScriptState>,
    }

    #[derive(Default)]
    struct ScriptState {
        script: Mutex<VecDeque<JobOutcome>>,
        calls: Mutex<Vec<Vec<PathBuf>>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        cancel_on_call: Option<usize>,
    }

    impl ScriptedEncoder {
        fn new(outcomes: Vec<JobOutcome>) -> Self {
            Self::build(outcomes, Duration::ZERO, None)
        }

        fn build(outcomes: Vec<JobOutcome>, delay: Duration, cancel_on_call: Option<usize>) -> Self {
            Self {
                inner: Arc::new(ScriptState {
                    script: Mutex::new(outcomes.into()),
                    delay,
                    cancel_on_call,
                    ..ScriptState::default()
                }),
            }
        }

        fn calls(&self) -> Vec<Vec<PathBuf>> {
            self.inner.calls.lock().unwrap().clone()
        }

        fn max_active(&self) -> usize {
            self.inner.max_active.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchEncoder for ScriptedEncoder {
        async fn run(
            &self,
            job: &EncodeJob,
            cancel: &CancellationToken,
        ) -> Result<JobOutcome, EncodeError> {
            let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.max_active.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.inner.delay).await;

            let call = {
                let mut calls = self.inner.calls.lock().unwrap();
                calls.push(job.members.clone());
                calls.len()
            };
            let outcome = self
                .inner
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(JobOutcome::Completed);
            if self.inner.cancel_on_call == Some(call) {
                cancel.cancel();
            }

            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            Ok(outcome)
        }
    }

    fn populate(dir: &Path, count: usize) {
        for i in 0..count {
            std::fs::write(dir.join(format!("clip_{:03}.mp4", i)), b"media").unwrap();
        }
    }

    fn settings(batch_size: usize, min_media: usize, delete_count: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            sink_url: "rtmp://localhost:1935/live".to_string(),
            batch_size,
            min_media,
            delete_count,
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_millis(50),
        }
    }

    fn orchestrator(
        dir: &Path,
        settings: OrchestratorSettings,
        encoder: ScriptedEncoder,
        signals: Option<mpsc::Receiver<RescanSignal>>,
    ) -> (StreamOrchestrator<ScriptedEncoder>, SharedStatus, CancellationToken) {
        let status = new_shared_status();
        let cancel = CancellationToken::new();
        let orch = StreamOrchestrator::new(
            settings,
            MediaInventory::new(dir, &["mp4", "mkv", "mov"]),
            encoder,
            signals,
            status.clone(),
            cancel.clone(),
        );
        (orch, status, cancel)
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn cancel_after(cancel: &CancellationToken, delay: Duration) {
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let waits: Vec<u64> = (0..5).map(|_| backoff.next_wait().as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_wait(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_equal_bounds_is_fixed() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(30));
        for _ in 0..4 {
            assert_eq!(backoff.next_wait(), Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn test_seven_files_two_batches_then_retention() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 7);
        let encoder = ScriptedEncoder::new(vec![]);
        let (mut orch, status, _cancel) =
            orchestrator(temp_dir.path(), settings(5, 3, 2), encoder.clone(), None);

        let files = match orch.evaluate_readiness().await.unwrap() {
            Readiness::Ready(files) => files,
            other => panic!("expected ready, got {:?}", other),
        };
        let end = orch.run_cycle(files).await.unwrap();

        let report = match end {
            CycleEnd::Completed(report) => report,
            other => panic!("expected completed cycle, got {:?}", other),
        };
        assert_eq!(report.batch_sizes, vec![5, 2]);
        assert_eq!(orch.state(), CycleState::CycleComplete);

        let calls = encoder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(names(&calls[1]), vec!["clip_005.mp4", "clip_006.mp4"]);

        let retention = report.retention.unwrap();
        assert_eq!(names(&retention.deleted), vec!["clip_000.mp4", "clip_001.mp4"]);

        let remaining = MediaInventory::new(temp_dir.path(), &["mp4"]).list().unwrap();
        assert_eq!(remaining.len(), 5);

        let status = status.read().await;
        assert_eq!(status.state, PipelineState::CycleComplete);
        assert_eq!(status.counters.completed_jobs, 2);
        assert_eq!(status.counters.deleted_files, 2);
        assert_eq!(status.counters.cycles_completed, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_below_threshold_stays_idle() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 2);
        let encoder = ScriptedEncoder::new(vec![]);
        let (mut orch, status, cancel) =
            orchestrator(temp_dir.path(), settings(5, 3, 2), encoder.clone(), None);

        cancel_after(&cancel, Duration::from_millis(200));
        orch.run().await.unwrap();

        assert!(encoder.calls().is_empty());
        assert_eq!(orch.cycle(), 0);
        assert_eq!(orch.state(), CycleState::Idle);
        assert_eq!(status.read().await.state, PipelineState::Stopped);
        assert_eq!(status.read().await.inventory_size, 2);
        assert!(logs_contain("waiting for media, will retry"));
        assert_eq!(MediaInventory::new(temp_dir.path(), &["mp4"]).list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_directory_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let encoder = ScriptedEncoder::new(vec![]);
        let (mut orch, _status, cancel) =
            orchestrator(temp_dir.path(), settings(5, 1, 2), encoder.clone(), None);

        assert_eq!(
            orch.evaluate_readiness().await.unwrap(),
            Readiness::Waiting {
                found: 0,
                required: 1
            }
        );

        cancel_after(&cancel, Duration::from_millis(150));
        assert!(orch.run().await.is_ok());
        assert!(encoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 4);
        let (orch, _status, _cancel) = orchestrator(
            temp_dir.path(),
            settings(5, 3, 2),
            ScriptedEncoder::new(vec![]),
            None,
        );

        let first = orch.evaluate_readiness().await.unwrap();
        for _ in 0..5 {
            assert_eq!(orch.evaluate_readiness().await.unwrap(), first);
        }
        assert!(matches!(first, Readiness::Ready(ref files) if files.len() == 4));
        assert_eq!(MediaInventory::new(temp_dir.path(), &["mp4"]).list().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_cycle() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 7);
        let encoder = ScriptedEncoder::new(vec![
            JobOutcome::Failed {
                exit_code: Some(1),
                stderr_tail: "Connection refused".to_string(),
            },
            JobOutcome::LaunchFailed {
                reason: "No such file or directory".to_string(),
            },
            JobOutcome::TimedOut,
        ]);
        let (mut orch, status, _cancel) =
            orchestrator(temp_dir.path(), settings(3, 1, 2), encoder.clone(), None);

        let Readiness::Ready(files) = orch.evaluate_readiness().await.unwrap() else {
            panic!("expected ready");
        };
        let end = orch.run_cycle(files).await.unwrap();

        assert_eq!(encoder.calls().len(), 3);
        match end {
            CycleEnd::Completed(report) => {
                assert_eq!(report.batch_sizes, vec![3, 3, 1]);
                assert!(report.outcomes.iter().all(|o| !o.is_success()));
                assert_eq!(report.retention.unwrap().deleted.len(), 2);
            }
            other => panic!("expected completed cycle, got {:?}", other),
        }

        let status = status.read().await;
        assert_eq!(status.counters.failed_jobs, 1);
        assert_eq!(status.counters.launch_failed_jobs, 1);
        assert_eq!(status.counters.timed_out_jobs, 1);
        assert_eq!(status.last_outcome.as_ref().unwrap().outcome, "timed_out");
    }

    #[tokio::test]
    async fn test_single_flight_while_watcher_fires() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 4);
        let (tx, rx) = mpsc::channel(8);
        let encoder = ScriptedEncoder::build(vec![], Duration::from_millis(40), None);
        let (mut orch, status, _cancel) =
            orchestrator(temp_dir.path(), settings(1, 1, 0), encoder.clone(), Some(rx));

        let path = temp_dir.path().join("clip_000.mp4");
        let spammer = tokio::spawn(async move {
            for _ in 0..40 {
                let _ = tx.try_send(RescanSignal { path: path.clone() });
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let Readiness::Ready(files) = orch.evaluate_readiness().await.unwrap() else {
            panic!("expected ready");
        };
        let end = orch.run_cycle(files).await.unwrap();
        spammer.await.unwrap();

        assert!(matches!(end, CycleEnd::Completed(_)));
        assert_eq!(encoder.calls().len(), 4);
        assert_eq!(encoder.max_active(), 1);
        assert!(status.read().await.counters.signals_received > 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_batch_boundary() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 6);
        let encoder = ScriptedEncoder::build(vec![], Duration::ZERO, Some(1));
        let (mut orch, _status, _cancel) =
            orchestrator(temp_dir.path(), settings(2, 1, 2), encoder.clone(), None);

        let Readiness::Ready(files) = orch.evaluate_readiness().await.unwrap() else {
            panic!("expected ready");
        };
        let end = orch.run_cycle(files).await.unwrap();

        assert_eq!(end, CycleEnd::Cancelled { batches_run: 1 });
        assert_eq!(encoder.calls().len(), 1);
        // No retention after an interrupted cycle
        assert_eq!(MediaInventory::new(temp_dir.path(), &["mp4"]).list().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_job_ends_cycle() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 4);
        let encoder = ScriptedEncoder::new(vec![JobOutcome::Cancelled]);
        let (mut orch, _status, _cancel) =
            orchestrator(temp_dir.path(), settings(2, 1, 2), encoder.clone(), None);

        let Readiness::Ready(files) = orch.evaluate_readiness().await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(
            orch.run_cycle(files).await.unwrap(),
            CycleEnd::Cancelled { batches_run: 1 }
        );
        assert_eq!(encoder.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_next_cycle_starts_without_waiting() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 3);
        // Cancel during the second cycle's only batch
        let encoder = ScriptedEncoder::build(vec![], Duration::ZERO, Some(2));
        let mut slow_poll = settings(5, 1, 1);
        slow_poll.poll_interval = Duration::from_secs(60);
        slow_poll.max_poll_interval = Duration::from_secs(60);
        let (mut orch, status, _cancel) =
            orchestrator(temp_dir.path(), slow_poll, encoder.clone(), None);

        tokio::time::timeout(Duration::from_secs(5), orch.run())
            .await
            .expect("second cycle should start immediately")
            .unwrap();

        let calls = encoder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(names(&calls[0]).len(), 3);
        // One file reclaimed after the first cycle
        assert_eq!(names(&calls[1]), vec!["clip_001.mp4", "clip_002.mp4"]);
        assert_eq!(orch.cycle(), 2);
        assert_eq!(status.read().await.state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_watcher_signal_wakes_idle_loop() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let encoder = ScriptedEncoder::build(vec![], Duration::ZERO, Some(1));
        let mut slow_poll = settings(5, 1, 0);
        slow_poll.poll_interval = Duration::from_secs(60);
        slow_poll.max_poll_interval = Duration::from_secs(60);
        let (mut orch, status, _cancel) =
            orchestrator(temp_dir.path(), slow_poll, encoder.clone(), Some(rx));

        let dir = temp_dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let path = dir.join("arrival.mkv");
            std::fs::write(&path, b"media").unwrap();
            tx.send(RescanSignal { path }).await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), orch.run())
            .await
            .expect("signal should end the idle wait")
            .unwrap();

        assert_eq!(encoder.calls().len(), 1);
        assert_eq!(names(&encoder.calls()[0]), vec!["arrival.mkv"]);
        assert_eq!(status.read().await.counters.signals_received, 1);
    }

    #[tokio::test]
    async fn test_file_added_mid_cycle_is_not_deleted() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), 3);
        let (mut orch, _status, _cancel) = orchestrator(
            temp_dir.path(),
            settings(5, 1, 2),
            ScriptedEncoder::new(vec![]),
            None,
        );

        let Readiness::Ready(files) = orch.evaluate_readiness().await.unwrap() else {
            panic!("expected ready");
        };
        // Sorts before every snapshot member
        std::fs::write(temp_dir.path().join("aaa_new.mp4"), b"media").unwrap();

        let CycleEnd::Completed(report) = orch.run_cycle(files).await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert_eq!(
            names(&report.retention.unwrap().deleted),
            vec!["clip_000.mp4", "clip_001.mp4"]
        );
        assert!(temp_dir.path().join("aaa_new.mp4").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_keeps_retrying() {
        let temp_dir = TempDir::new().unwrap();
        let gone = temp_dir.path().join("raw");
        let encoder = ScriptedEncoder::new(vec![]);
        let (mut orch, status, cancel) =
            orchestrator(&gone, settings(5, 1, 2), encoder.clone(), None);

        assert!(orch.evaluate_readiness().await.is_err());

        cancel_after(&cancel, Duration::from_millis(150));
        assert!(orch.run().await.is_ok());
        assert!(encoder.calls().is_empty());
        assert_eq!(status.read().await.state, PipelineState::Stopped);
    }
}
