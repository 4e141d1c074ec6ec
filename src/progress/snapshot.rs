//! Immutable progress snapshots handed to observers.

use serde::Serialize;

use crate::model::DownloadStatus;

/// Progress of one running download at a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    /// Download id.
    pub id: i64,
    /// Display name.
    pub display_name: String,
    /// Probing, Active or Merging.
    pub status: DownloadStatus,
    /// Bytes on disk across all segments.
    pub bytes_written: u64,
    /// Entity size, once probed.
    pub total_size_bytes: Option<u64>,
    /// Segments in Done state.
    pub segments_done: usize,
    /// Segments in the plan.
    pub segments_total: usize,
    /// Throughput since the previous tick.
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    /// Completion in percent, when the size is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total_size_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_written as f64 * 100.0 / total as f64),
            None => None,
        }
    }
}

/// Everything observers learn at one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Monotonic tick counter.
    pub sequence: u64,
    /// Running downloads, ordered by id.
    pub downloads: Vec<DownloadProgress>,
    /// Sum of `bytes_written` over `downloads`.
    pub total_bytes_written: u64,
    /// Aggregate throughput since the previous tick.
    pub bytes_per_second: u64,
}
