//! Batch planning: fixed-size, order-preserving partition of an inventory.

use crate::inventory::MediaFile;

/// Ordered group of files handed to one encoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based index of the batch within its cycle.
    pub index: usize,
    pub files: Vec<MediaFile>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Split `files` into consecutive batches of at most `batch_size` entries.
///
/// Batch `i` holds `files[i * batch_size .. min((i + 1) * batch_size, len)]`.
/// No files means no batches. A `batch_size` of zero is treated as one so the
/// partition is always defined; configuration validation rejects zero anyway.
pub fn plan_batches(files: &[MediaFile], batch_size: usize) -> Vec<Batch> {
    files
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            files: chunk.to_vec(),
        })
        .collect()
}
