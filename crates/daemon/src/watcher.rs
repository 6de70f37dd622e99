//! Folder watcher: turns filesystem events in the source directory into
//! re-evaluation signals for the orchestrator.
//!
//! The watcher never calls into the orchestrator. It posts a [`RescanSignal`]
//! into a bounded queue that the orchestrator drains between batches; when
//! the queue is full a re-evaluation is already pending and the signal is
//! dropped.

use crate::inventory::MediaInventory;
use crate::stability::{check_stability, StabilityResult};
use notify::event::{AccessKind, AccessMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Errors raised while setting up the watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to create filesystem watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Request to re-check the inventory, caused by a settled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescanSignal {
    pub path: PathBuf,
}

/// Whether an event kind can mean "a media file appeared or finished writing".
pub fn is_relevant_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Media paths of `event` worth settling, or nothing for irrelevant events.
pub fn relevant_paths(event: &Event, inventory: &MediaInventory) -> Vec<PathBuf> {
    if !is_relevant_kind(&event.kind) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| inventory.accepts(p))
        .cloned()
        .collect()
}

/// Handle to a running watcher; dropping it stops event delivery.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FolderWatcher {
    /// Start watching `inventory.dir()` (non-recursively).
    ///
    /// Every relevant event is settled until the file holds its size for a
    /// whole `settle` window, then a [`RescanSignal`] is offered to `signals`.
    /// Cancelling `cancel` stops the watcher from posting further signals.
    pub fn start(
        inventory: MediaInventory,
        settle: Duration,
        signals: mpsc::Sender<RescanSignal>,
        cancel: CancellationToken,
    ) -> Result<Self, WatcherError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // Unbounded, so this never blocks the notify thread
                if events_tx.send(result).is_err() {
                    trace!("watcher event dropped after shutdown");
                }
            },
            NotifyConfig::default(),
        )
        .map_err(WatcherError::Init)?;

        watcher
            .watch(inventory.dir(), RecursiveMode::NonRecursive)
            .map_err(|source| WatcherError::Watch {
                path: inventory.dir().to_path_buf(),
                source,
            })?;

        info!(dir = %inventory.dir().display(), settle_ms = settle.as_millis() as u64, "watching source directory");

        let task = tokio::spawn(dispatch_events(
            events_rx,
            inventory,
            settle,
            signals,
            cancel,
        ));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop the dispatch task and the underlying watcher.
    pub fn stop(self) {
        self.task.abort();
    }
}

async fn dispatch_events(
    mut events_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    inventory: MediaInventory,
    settle: Duration,
    signals: mpsc::Sender<RescanSignal>,
    cancel: CancellationToken,
) {
    // Paths with a settle already in flight
    let settling: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events_rx.recv() => match received {
                Some(result) => result,
                None => break,
            },
        };

        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "filesystem watcher error");
                continue;
            }
        };

        for path in relevant_paths(&event, &inventory) {
            let fresh = settling
                .lock()
                .map(|mut set| set.insert(path.clone()))
                .unwrap_or(false);
            if !fresh {
                continue;
            }

            trace!(path = %path.display(), kind = ?event.kind, "settling file");
            tokio::spawn(settle_and_signal(
                path,
                settle,
                signals.clone(),
                cancel.clone(),
                settling.clone(),
            ));
        }
    }

    debug!("watcher dispatch stopped");
}

async fn settle_and_signal(
    path: PathBuf,
    settle: Duration,
    signals: mpsc::Sender<RescanSignal>,
    cancel: CancellationToken,
    settling: Arc<Mutex<HashSet<PathBuf>>>,
) {
    let verdict = tokio::select! {
        _ = cancel.cancelled() => None,
        verdict = settle_file(&path, settle) => Some(verdict),
    };

    if let Ok(mut set) = settling.lock() {
        set.remove(&path);
    }

    match verdict {
        Some(true) => match signals.try_send(RescanSignal { path: path.clone() }) {
            Ok(()) => debug!(path = %path.display(), "re-evaluation requested"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(path = %path.display(), "re-evaluation already pending")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(path = %path.display(), "orchestrator gone, signal dropped")
            }
        },
        Some(false) | None => {}
    }
}

/// Wait until `path` holds its size for a full settle delay.
///
/// Events for a path are ignored while it settles, so a size change restarts
/// the wait instead of giving up. Returns false when the path is not a
/// regular file or disappears. Callers bound the wait with cancellation.
async fn settle_file(path: &Path, settle: Duration) -> bool {
    let mut size = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return false,
    };

    loop {
        match check_stability(path, size, settle).await {
            Ok(StabilityResult::Stable) => return true,
            Ok(StabilityResult::Unstable {
                initial_size,
                current_size,
            }) => {
                debug!(path = %path.display(), initial_size, current_size, "file still growing");
                size = current_size;
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "file vanished while settling");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn inventory(dir: &Path) -> MediaInventory {
        MediaInventory::new(dir, &["mp4", "mkv", "mov"])
    }

    #[test]
    fn test_relevant_kinds() {
        assert!(is_relevant_kind(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant_kind(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_relevant_kind(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_relevant_kind(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_relevant_kind(&EventKind::Access(AccessKind::Read)));
    }

    #[test]
    fn test_relevant_paths_filters_non_media() {
        let inv = inventory(Path::new("/pool"));
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/pool/new.mp4"))
            .add_path(PathBuf::from("/pool/file_list.txt"))
            .add_path(PathBuf::from("/pool/.partial.mp4"));

        assert_eq!(
            relevant_paths(&event, &inv),
            vec![PathBuf::from("/pool/new.mp4")]
        );

        let removal = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/pool/old.mp4"));
        assert!(relevant_paths(&removal, &inv).is_empty());
    }

    #[tokio::test]
    async fn test_new_media_file_posts_signal() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let watcher = FolderWatcher::start(
            inventory(temp_dir.path()),
            Duration::from_millis(50),
            tx,
            cancel.clone(),
        )
        .unwrap();

        let file = temp_dir.path().join("arrival.mp4");
        tokio::fs::write(&file, b"video bytes").await.unwrap();

        let signal = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal should arrive")
            .expect("channel open");
        assert_eq!(signal.path.file_name(), file.file_name());

        cancel.cancel();
        watcher.stop();
    }

    #[tokio::test]
    async fn test_file_finished_inside_settle_window_still_signals() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let watcher = FolderWatcher::start(
            inventory(temp_dir.path()),
            Duration::from_millis(300),
            tx,
            cancel.clone(),
        )
        .unwrap();

        let file = temp_dir.path().join("copy.mp4");
        tokio::fs::write(&file, b"head").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::fs::write(&file, b"head and the rest of the clip")
            .await
            .unwrap();

        let signal = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("signal should arrive once the copy is complete")
            .expect("channel open");
        assert_eq!(signal.path.file_name(), file.file_name());

        cancel.cancel();
        watcher.stop();
    }

    #[tokio::test]
    async fn test_settle_waits_for_growth_to_stop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("growing.mp4");
        std::fs::write(&path, b"0").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for len in 2..6usize {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tokio::fs::write(&writer_path, vec![0u8; len]).await.unwrap();
            }
        });

        let started = std::time::Instant::now();
        assert!(settle_file(&path, Duration::from_millis(150)).await);
        writer.await.unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);
        // At least one window saw growth, then a full quiet window
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_settle_rejects_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!settle_file(&temp_dir.path().join("none.mp4"), Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_non_media_file_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let watcher = FolderWatcher::start(
            inventory(temp_dir.path()),
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        )
        .unwrap();

        tokio::fs::write(temp_dir.path().join("file_list.txt"), b"file 'x'\n")
            .await
            .unwrap();

        assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());

        cancel.cancel();
        watcher.stop();
    }

    #[tokio::test]
    async fn test_cancelled_watcher_posts_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let watcher = FolderWatcher::start(
            inventory(temp_dir.path()),
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        )
        .unwrap();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::fs::write(temp_dir.path().join("late.mp4"), b"data")
            .await
            .unwrap();

        match timeout(Duration::from_millis(500), rx.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(signal)) => panic!("unexpected signal {:?}", signal),
        }
        watcher.stop();
    }

    #[tokio::test]
    async fn test_missing_directory_fails_setup() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(1);

        let result = FolderWatcher::start(
            inventory(&temp_dir.path().join("absent")),
            Duration::from_millis(20),
            tx,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(WatcherError::Watch { .. })));
    }
}
