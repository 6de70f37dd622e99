//! Pipeline status for loopcast
//!
//! A lock-guarded snapshot the orchestrator writes and the status endpoint
//! and dashboard read, with JSON serialization support.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-port viewer counts, keyed by local port
pub type ViewerCounts = BTreeMap<u16, usize>;

/// Orchestrator run state as reported to observers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Streaming,
    CycleComplete,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Streaming => "streaming",
            PipelineState::CycleComplete => "cycle_complete",
            PipelineState::Stopped => "stopped",
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Running totals since the process started
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PipelineCounters {
    pub cycles_completed: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub launch_failed_jobs: u64,
    pub timed_out_jobs: u64,
    pub deleted_files: u64,
    pub deletion_failures: u64,
    pub signals_received: u64,
}

/// Most recent encoder result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastOutcome {
    pub job_id: String,
    pub batch_index: usize,
    pub outcome: String,
    pub exit_code: Option<i32>,
}

/// Complete status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineSnapshot {
    pub timestamp_unix_ms: i64,
    pub state: PipelineState,
    /// Number of the current (or last) cycle, starting at 1
    pub cycle: u64,
    pub batch_index: Option<usize>,
    pub batch_count: usize,
    pub current_members: Vec<String>,
    pub inventory_size: usize,
    pub counters: PipelineCounters,
    pub last_outcome: Option<LastOutcome>,
    pub viewers: ViewerCounts,
    pub system: SystemMetrics,
}

/// Shared status for concurrent access across loopcast components
pub type SharedStatus = Arc<RwLock<PipelineSnapshot>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(PipelineSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn timestamp_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Refresh system metrics in `status` every `interval` until cancelled.
pub async fn run_system_updater(status: SharedStatus, interval: Duration, cancel: CancellationToken) {
    loop {
        let system = tokio::task::spawn_blocking(collect_system_metrics)
            .await
            .unwrap_or_default();
        {
            let mut snapshot = status.write().await;
            snapshot.system = system;
            snapshot.timestamp_unix_ms = timestamp_unix_ms();
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&PipelineState::CycleComplete).unwrap();
        assert_eq!(json, "\"cycle_complete\"");
        assert_eq!(PipelineState::CycleComplete.as_str(), "cycle_complete");
        assert_eq!(PipelineState::default(), PipelineState::Idle);
    }

    #[test]
    fn test_timestamp_is_recent() {
        // After Jan 1, 2020
        assert!(timestamp_unix_ms() > 1577836800000);
    }

    #[tokio::test]
    async fn test_system_updater_stops_on_cancel() {
        let status = new_shared_status();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_system_updater(
            status.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("updater should stop")
            .unwrap();

        assert!(status.read().await.timestamp_unix_ms > 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_snapshot_json_round_trip(
            cycle in any::<u64>(),
            batch_index in proptest::option::of(0usize..100),
            batch_count in 0usize..100,
            inventory_size in 0usize..1000,
            completed in any::<u64>(),
            failed in any::<u64>(),
            deleted in any::<u64>(),
            cpu_usage in 0.0f32..100.0,
            viewers in proptest::collection::btree_map(1000u16..2000, 0usize..50, 0..5),
        ) {
            let snapshot = PipelineSnapshot {
                timestamp_unix_ms: 1_700_000_000_000,
                state: PipelineState::Streaming,
                cycle,
                batch_index,
                batch_count,
                current_members: vec!["/pool/a.mp4".to_string()],
                inventory_size,
                counters: PipelineCounters {
                    completed_jobs: completed,
                    failed_jobs: failed,
                    deleted_files: deleted,
                    ..PipelineCounters::default()
                },
                last_outcome: Some(LastOutcome {
                    job_id: "job-1".to_string(),
                    batch_index: 0,
                    outcome: "failed".to_string(),
                    exit_code: Some(1),
                }),
                viewers,
                system: SystemMetrics {
                    cpu_usage_percent: cpu_usage,
                    ..SystemMetrics::default()
                },
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: PipelineSnapshot = serde_json::from_str(&json)
                .expect("deserialization should succeed");
            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
