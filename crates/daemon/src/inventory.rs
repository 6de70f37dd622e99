//! Media inventory for the watched source directory.
//!
//! Lists the media pool in a stable, name-ordered sequence. The position of a
//! file in that sequence is the only notion of age the pipeline uses; no
//! modification times are read.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors raised while listing the source directory.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The source directory is missing or not a directory.
    #[error("source directory {path} is not available: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// The directory exists but could not be read.
    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Extension class of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Supported,
    Ignored,
}

/// A media file seen in one inventory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Full path to the file.
    pub path: PathBuf,
    /// Position in the name-ordered listing; lower means older.
    pub position: usize,
}

impl MediaFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Classify a path by its extension (case-insensitive).
///
/// `extensions` holds lowercase extensions without the leading dot.
pub fn classify(path: &Path, extensions: &[String]) -> MediaClass {
    let supported = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            extensions.iter().any(|e| *e == ext_lower)
        })
        .unwrap_or(false);

    if supported {
        MediaClass::Supported
    } else {
        MediaClass::Ignored
    }
}

/// Normalise configured extensions: trim, drop a leading dot, lowercase.
pub fn normalize_extensions<S: AsRef<str>>(extensions: &[S]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Lists supported media in a single directory.
#[derive(Debug, Clone)]
pub struct MediaInventory {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl MediaInventory {
    pub fn new<S: AsRef<str>>(dir: impl Into<PathBuf>, extensions: &[S]) -> Self {
        Self {
            dir: dir.into(),
            extensions: normalize_extensions(extensions),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Whether `path` would be part of a listing (ignoring existence).
    pub fn accepts(&self, path: &Path) -> bool {
        !is_hidden(path) && classify(path, &self.extensions) == MediaClass::Supported
    }

    /// Take a fresh snapshot of the directory.
    ///
    /// This function:
    /// - Reads only the top level of the directory (no recursion)
    /// - Skips hidden entries (names starting with `.`) and non-files
    /// - Keeps files whose extension is configured (case-insensitive)
    /// - Orders the result by file name
    ///
    /// An empty result is a normal outcome.
    pub fn list(&self) -> Result<Vec<MediaFile>, InventoryError> {
        let metadata = std::fs::metadata(&self.dir).map_err(|e| InventoryError::Unavailable {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(InventoryError::Unavailable {
                path: self.dir.clone(),
                reason: "not a directory".to_string(),
            });
        }

        let walker = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        let mut paths = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // The root itself failing means the listing is unusable
                    if e.depth() == 0 {
                        let source = e
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                        return Err(InventoryError::Io {
                            path: self.dir.clone(),
                            source,
                        });
                    }
                    debug!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if !self.accepts(path) {
                continue;
            }

            paths.push(path.to_path_buf());
        }

        Ok(paths
            .into_iter()
            .enumerate()
            .map(|(position, path)| MediaFile { path, position })
            .collect())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
