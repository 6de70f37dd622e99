//! Retention: bounds the media pool by deleting the oldest files after a cycle.

use crate::inventory::MediaFile;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A file that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Files removed, oldest first
    pub deleted: Vec<PathBuf>,
    /// Files selected for removal that could not be removed
    pub failures: Vec<DeletionFailure>,
    /// True when the pool was too small to delete anything
    pub skipped: bool,
}

/// Files of the cycle snapshot that are still present, in current listing order.
///
/// Anything that appeared after the cycle started is left out, so retention
/// never touches media the current cycle has not streamed.
pub fn surviving(snapshot: &[MediaFile], current: &[MediaFile]) -> Vec<MediaFile> {
    let streamed: HashSet<&Path> = snapshot.iter().map(|f| f.path.as_path()).collect();
    current
        .iter()
        .filter(|f| streamed.contains(f.path.as_path()))
        .cloned()
        .collect()
}

/// Delete the first `delete_count` entries of `files`.
///
/// When `files.len() <= delete_count` nothing is deleted and the report is
/// marked as skipped, so the pool is never emptied. A failure on one file is
/// recorded and the pass moves on to the next.
pub fn reclaim(files: &[MediaFile], delete_count: usize) -> RetentionReport {
    if files.len() <= delete_count {
        info!(
            available = files.len(),
            delete_count, "not enough media to reclaim, keeping every file"
        );
        return RetentionReport {
            skipped: true,
            ..RetentionReport::default()
        };
    }

    let mut report = RetentionReport::default();
    for file in &files[..delete_count] {
        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                info!(path = %file.path.display(), "deleted oldest media");
                report.deleted.push(file.path.clone());
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "failed to delete media");
                report.failures.push(DeletionFailure {
                    path: file.path.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::MediaInventory;
    use proptest::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn populate(dir: &Path, count: usize) -> Vec<MediaFile> {
        for i in 0..count {
            File::create(dir.join(format!("clip_{:03}.mp4", i))).unwrap();
        }
        MediaInventory::new(dir, &["mp4"]).list().unwrap()
    }

    #[test]
    fn test_seven_files_delete_two() {
        let temp_dir = TempDir::new().unwrap();
        let files = populate(temp_dir.path(), 7);

        let report = reclaim(&files, 2);

        assert!(!report.skipped);
        assert_eq!(report.deleted, vec![files[0].path.clone(), files[1].path.clone()]);
        assert!(report.failures.is_empty());

        let remaining = MediaInventory::new(temp_dir.path(), &["mp4"]).list().unwrap();
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].file_name(), "clip_002.mp4");
    }

    #[test]
    fn test_floor_protects_small_pool() {
        let temp_dir = TempDir::new().unwrap();
        let files = populate(temp_dir.path(), 2);

        let report = reclaim(&files, 2);

        assert!(report.skipped);
        assert!(report.deleted.is_empty());
        assert!(files.iter().all(|f| f.path.exists()));
    }

    #[test]
    fn test_missing_file_does_not_abort_pass() {
        let temp_dir = TempDir::new().unwrap();
        let files = populate(temp_dir.path(), 5);
        std::fs::remove_file(&files[0].path).unwrap();

        let report = reclaim(&files, 3);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, files[0].path);
        assert_eq!(report.deleted, vec![files[1].path.clone(), files[2].path.clone()]);
        assert!(files[3].path.exists());
        assert!(files[4].path.exists());
    }

    #[test]
    fn test_surviving_excludes_new_and_removed_files() {
        let snapshot: Vec<MediaFile> = ["b.mp4", "c.mp4", "d.mp4"]
            .iter()
            .enumerate()
            .map(|(position, n)| MediaFile {
                path: PathBuf::from(format!("/pool/{}", n)),
                position,
            })
            .collect();
        // "a.mp4" arrived mid-cycle and sorts first; "c.mp4" vanished
        let current: Vec<MediaFile> = ["a.mp4", "b.mp4", "d.mp4"]
            .iter()
            .enumerate()
            .map(|(position, n)| MediaFile {
                path: PathBuf::from(format!("/pool/{}", n)),
                position,
            })
            .collect();

        let candidates = surviving(&snapshot, &current);
        let names: Vec<String> = candidates.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["b.mp4", "d.mp4"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        #[test]
        fn prop_retention_floor(count in 0usize..15, delete_count in 0usize..10) {
            let temp_dir = TempDir::new().unwrap();
            let files = populate(temp_dir.path(), count);

            let report = reclaim(&files, delete_count);
            let remaining = MediaInventory::new(temp_dir.path(), &["mp4"]).list().unwrap();

            if count <= delete_count {
                prop_assert!(report.skipped);
                prop_assert!(report.deleted.is_empty());
                prop_assert_eq!(remaining.len(), count);
            } else {
                prop_assert!(!report.skipped);
                prop_assert_eq!(report.deleted.len(), delete_count);
                prop_assert_eq!(remaining.len(), count - delete_count);
                // The oldest-ordered files are the ones removed
                let expected: Vec<PathBuf> =
                    files[..delete_count].iter().map(|f| f.path.clone()).collect();
                prop_assert_eq!(&report.deleted, &expected);
            }
        }
    }
}
