//! Relegation timer: after a delay, retires a stream slot directory by
//! renaming it to `<name>_relegated`.

use crate::config::RelegationConfig;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors raised while relegating a directory
#[derive(Debug, Error)]
pub enum RelegationError {
    #[error("{0} has no directory name to relegate")]
    NoName(PathBuf),

    #[error("cannot inspect {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a relegation attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelegationOutcome {
    Renamed { from: PathBuf, to: PathBuf },
    /// The directory did not exist; nothing was renamed
    Missing,
    /// Cancelled before the delay elapsed
    Cancelled,
}

/// Sibling path `<name>_relegated` for `dir`.
pub fn relegated_path(dir: &Path) -> Result<PathBuf, RelegationError> {
    let name = dir
        .file_name()
        .ok_or_else(|| RelegationError::NoName(dir.to_path_buf()))?;

    let mut relegated = OsString::from(name);
    relegated.push("_relegated");
    Ok(dir.with_file_name(relegated))
}

/// Rename `dir` to its relegated name if it exists.
pub async fn relegate(dir: &Path) -> Result<RelegationOutcome, RelegationError> {
    let to = relegated_path(dir)?;

    match tokio::fs::metadata(dir).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "relegation target does not exist");
            return Ok(RelegationOutcome::Missing);
        }
        Err(source) => {
            return Err(RelegationError::Stat {
                path: dir.to_path_buf(),
                source,
            })
        }
    }

    tokio::fs::rename(dir, &to)
        .await
        .map_err(|source| RelegationError::Rename {
            from: dir.to_path_buf(),
            to: to.clone(),
            source,
        })?;

    info!(from = %dir.display(), to = %to.display(), "directory relegated");
    Ok(RelegationOutcome::Renamed {
        from: dir.to_path_buf(),
        to,
    })
}

/// Wait `settings.delay_secs`, then relegate `settings.target_dir` once.
pub async fn run_relegation(
    settings: &RelegationConfig,
    cancel: CancellationToken,
) -> Result<RelegationOutcome, RelegationError> {
    info!(
        dir = %settings.target_dir.display(),
        delay_secs = settings.delay_secs,
        "relegation scheduled"
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("relegation cancelled");
            return Ok(RelegationOutcome::Cancelled);
        }
        _ = tokio::time::sleep(settings.delay()) => {}
    }

    relegate(&settings.target_dir).await
}
