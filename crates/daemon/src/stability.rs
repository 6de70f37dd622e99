//! Stability checking module for verifying files are not being written to.
//!
//! After a filesystem event the watcher waits for the settle delay and
//! compares the file size before and after, so a half-copied file does not
//! trigger a re-evaluation on its own.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the settle delay.
    Stable,
    /// File size changed during the settle delay.
    Unstable {
        /// Size when first checked.
        initial_size: u64,
        /// Size after waiting.
        current_size: u64,
    },
}

/// Check if a file is stable by comparing its size before and after a wait period.
///
/// # Arguments
/// * `path` - Path to the file to check
/// * `initial_size` - The file size when the event was seen
/// * `settle` - How long to wait before re-checking
///
/// # Returns
/// * `Ok(StabilityResult::Stable)` if the file size is unchanged
/// * `Ok(StabilityResult::Unstable { .. })` if the file size changed
/// * `Err` if the file cannot be read (for example it was moved away)
pub async fn check_stability(
    path: &Path,
    initial_size: u64,
    settle: Duration,
) -> Result<StabilityResult, std::io::Error> {
    sleep(settle).await;

    let metadata = tokio::fs::metadata(path).await?;
    Ok(compare_sizes(initial_size, metadata.len()))
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}
