//! Startup checks module for loopcast
//!
//! Provides preflight checks to verify the environment before streaming starts:
//! - Source directory exists and is listable and writable
//! - FFmpeg availability and version
//! - Sink URL uses a supported scheme

use crate::config::Config;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// URL schemes the encoder can publish to
const SUPPORTED_SINK_SCHEMES: &[&str] = &[
    "rtmp", "rtmps", "srt", "udp", "rtp", "tcp", "http", "https", "file",
];

/// Name of the throwaway file used to probe write access
const WRITE_PROBE_NAME: &str = ".loopcast-write-probe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Source directory {path} is unusable: {reason}")]
    SourceDir { path: PathBuf, reason: String },

    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Unsupported sink URL '{url}': {reason}")]
    SinkUrl { url: String, reason: String },
}

/// Check that `path` is a directory the daemon can list and write into
///
/// Write access is probed by creating and removing a hidden file, which the
/// inventory never lists.
pub fn check_source_dir(path: &Path) -> Result<(), StartupError> {
    let fail = |reason: String| StartupError::SourceDir {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| fail(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(fail("not a directory".to_string()));
    }

    std::fs::read_dir(path).map_err(|e| fail(format!("cannot list: {}", e)))?;

    let probe = path.join(WRITE_PROBE_NAME);
    std::fs::write(&probe, b"").map_err(|e| fail(format!("not writable: {}", e)))?;
    std::fs::remove_file(&probe).map_err(|e| fail(format!("cannot remove probe file: {}", e)))?;

    Ok(())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    // Handle n-prefixed versions (e.g., "n6.1-...")
    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that the configured FFmpeg binary runs, returning its major version
pub fn check_ffmpeg_available(ffmpeg_path: &Path) -> Result<u32, StartupError> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
                ffmpeg_path.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg_path.display(),
            output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegUnavailable(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    info!(ffmpeg = %ffmpeg_path.display(), major_version, "ffmpeg available");
    Ok(major_version)
}

/// Check that `url` names a scheme the encoder can publish to
pub fn check_sink_url(url: &str) -> Result<(), StartupError> {
    let fail = |reason: &str| StartupError::SinkUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, rest) = url.split_once("://").ok_or_else(|| fail("missing scheme"))?;
    if rest.is_empty() {
        return Err(fail("missing destination"));
    }

    let scheme = scheme.to_ascii_lowercase();
    if !SUPPORTED_SINK_SCHEMES.contains(&scheme.as_str()) {
        return Err(fail("scheme not supported"));
    }

    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Sink URL
/// 2. Source directory
/// 3. FFmpeg availability, unless `check_encoder` is false
pub fn run_startup_checks(cfg: &Config, check_encoder: bool) -> Result<(), StartupError> {
    check_sink_url(&cfg.stream.sink_url)?;
    check_source_dir(&cfg.source.watch_dir)?;
    if check_encoder {
        check_ffmpeg_available(&cfg.encoder.ffmpeg_path)?;
    }
    Ok(())
}
