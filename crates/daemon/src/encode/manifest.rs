//! Concat manifest consumed by the encoder.
//!
//! One `file '<path>'` line per batch member. The file is rewritten in full
//! for every batch, so only one encoder may read it at a time.

use std::io;
use std::path::{Path, PathBuf};

/// Render manifest text for `paths`, quoting each path for the concat demuxer.
pub fn render_manifest(paths: &[PathBuf]) -> String {
    let mut out = String::new();
    for path in paths {
        let raw = path.to_string_lossy();
        // A quote closes the string, an escaped quote, then reopens it
        let quoted = raw.replace('\'', r"'\''");
        out.push_str("file '");
        out.push_str(&quoted);
        out.push_str("'\n");
    }
    out
}

/// Overwrite `manifest_path` with the entries for `paths`.
///
/// Relative members are made absolute first; the concat demuxer would
/// otherwise resolve them against the manifest's own directory.
pub async fn write_manifest(manifest_path: &Path, paths: &[PathBuf]) -> io::Result<()> {
    let absolute: Vec<PathBuf> = paths
        .iter()
        .map(|p| std::path::absolute(p).unwrap_or_else(|_| p.clone()))
        .collect();
    tokio::fs::write(manifest_path, render_manifest(&absolute)).await
}
