//! Persistent download entity and its segments.
//!
//! A [`DownloadModel`] is created on submission (status [`DownloadStatus::Queued`]),
//! gets its size and segment plan from the planner, has its segment progress
//! mutated by workers, its status mutated by the coordinator, and is only
//! destroyed by an explicit delete.

mod segment;
mod status;

use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::download::FailureKind;

pub use segment::Segment;
pub use status::{DownloadStatus, SegmentState};

/// Suffix of the in-progress merge output next to the destination path.
pub const PART_SUFFIX: &str = ".part";

/// One download and its segment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadModel {
    /// Stable primary key; survives restarts.
    pub id: i64,
    /// Resolved source URL.
    pub source_url: String,
    /// Final file location; only the merge rename ever creates it.
    pub destination_path: PathBuf,
    /// Human-readable name for observers.
    pub display_name: String,
    /// Total entity size, `None` until probed (or until EOF for open-ended fetches).
    pub total_size_bytes: Option<u64>,
    /// Whether the server honors byte-range requests.
    pub supports_range_requests: bool,
    /// Segment plan ordered by index.
    pub segments: Vec<Segment>,
    /// Lifecycle status.
    pub status: DownloadStatus,
    /// Failed fetch/probe attempts recorded for this model.
    pub attempt_count: u32,
    /// Last error message, kept while Failed.
    pub last_error: Option<String>,
    /// Classification of `last_error`.
    pub last_error_kind: Option<FailureKind>,
    /// Higher priority is admitted first; FIFO within a priority.
    pub priority: i64,
    /// Size announced by the resolver, cross-checked against the probe.
    pub expected_size: Option<u64>,
    /// Optional lowercase hex SHA-256 of the full entity.
    pub expected_sha256: Option<String>,
    /// When the model was created (`SQLite` `datetime('now')`).
    pub created_at: String,
    /// When the model was last saved.
    pub updated_at: String,
}

impl DownloadModel {
    /// Sum of `bytes_written` over all segments.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    /// True when the plan exists and every segment is Done.
    #[must_use]
    pub fn all_segments_done(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(Segment::is_done)
    }

    /// True once a segment plan has been computed.
    #[must_use]
    pub fn is_planned(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Path of the merge output before the atomic rename.
    #[must_use]
    pub fn part_path(&self) -> PathBuf {
        let mut raw: OsString = self.destination_path.clone().into_os_string();
        raw.push(PART_SUFFIX);
        PathBuf::from(raw)
    }

    /// Checks that segments are ordered, contiguous, non-overlapping and cover
    /// exactly `[0, total_size_bytes)`.
    ///
    /// Open-ended plans (unknown size) are valid when they consist of a single
    /// segment starting at zero.
    #[must_use]
    pub fn has_valid_coverage(&self) -> bool {
        if self.segments.is_empty() {
            return false;
        }

        let Some(total) = self.total_size_bytes else {
            return self.segments.len() == 1
                && self.segments[0].range_start == 0
                && self.segments[0].range_end.is_none();
        };

        let mut cursor = 0u64;
        for (position, segment) in self.segments.iter().enumerate() {
            let Some(end) = segment.range_end else {
                return false;
            };
            if usize::try_from(segment.index).ok() != Some(position)
                || segment.range_start != cursor
                || end < segment.range_start
            {
                return false;
            }
            cursor = end;
        }
        cursor == total
    }

    /// Records an error as the model's last error.
    pub fn record_error(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.last_error_kind = Some(kind);
    }

    /// Clears the last error (manual retry).
    pub fn clear_error(&mut self) {
        self.last_error = None;
        self.last_error_kind = None;
    }

    /// Drops the segment plan so the next admission probes again.
    pub fn discard_plan(&mut self) {
        self.segments.clear();
        self.total_size_bytes = None;
        self.supports_range_requests = false;
    }
}

/// Fields supplied when a new download is created.
#[derive(Debug, Clone)]
pub struct NewDownload {
    /// Resolved source URL.
    pub source_url: String,
    /// Unique destination path.
    pub destination_path: PathBuf,
    /// Display name for observers.
    pub display_name: String,
    /// Admission priority.
    pub priority: i64,
    /// Size announced by the resolver.
    pub expected_size: Option<u64>,
    /// Optional lowercase hex SHA-256.
    pub expected_sha256: Option<String>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a model with an explicit segment plan over `[0, total)`.
    pub(crate) fn model_with_bounds(
        total: Option<u64>,
        bounds: &[(u64, Option<u64>)],
    ) -> DownloadModel {
        DownloadModel {
            id: 1,
            source_url: "https://example.com/file.bin".to_string(),
            destination_path: PathBuf::from("/tmp/out/file.bin"),
            display_name: "file.bin".to_string(),
            total_size_bytes: total,
            supports_range_requests: true,
            segments: bounds
                .iter()
                .enumerate()
                .map(|(i, (start, end))| {
                    Segment::new(
                        u32::try_from(i).unwrap_or(u32::MAX),
                        *start,
                        *end,
                        PathBuf::from(format!("/tmp/seg-{i}")),
                    )
                })
                .collect(),
            status: DownloadStatus::Queued,
            attempt_count: 0,
            last_error: None,
            last_error_kind: None,
            priority: 0,
            expected_size: None,
            expected_sha256: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::model_with_bounds;
    use super::*;

    #[test]
    fn test_contiguous_plan_has_valid_coverage() {
        let model = model_with_bounds(
            Some(300),
            &[(0, Some(100)), (100, Some(200)), (200, Some(300))],
        );
        assert!(model.has_valid_coverage());
    }

    #[test]
    fn test_gap_between_segments_is_invalid() {
        let model = model_with_bounds(Some(300), &[(0, Some(100)), (150, Some(300))]);
        assert!(!model.has_valid_coverage());
    }

    #[test]
    fn test_overlap_between_segments_is_invalid() {
        let model = model_with_bounds(Some(300), &[(0, Some(160)), (150, Some(300))]);
        assert!(!model.has_valid_coverage());
    }

    #[test]
    fn test_short_plan_is_invalid() {
        let model = model_with_bounds(Some(300), &[(0, Some(100)), (100, Some(299))]);
        assert!(!model.has_valid_coverage());
    }

    #[test]
    fn test_open_ended_single_segment_is_valid_without_total() {
        let model = model_with_bounds(None, &[(0, None)]);
        assert!(model.has_valid_coverage());
    }

    #[test]
    fn test_empty_plan_is_invalid() {
        let model = model_with_bounds(Some(0), &[]);
        assert!(!model.has_valid_coverage());
        assert!(!model.all_segments_done());
    }

    #[test]
    fn test_part_path_appends_suffix() {
        let model = model_with_bounds(Some(1), &[(0, Some(1))]);
        assert_eq!(model.part_path(), PathBuf::from("/tmp/out/file.bin.part"));
    }

    #[test]
    fn test_bytes_written_sums_segments() {
        let mut model = model_with_bounds(Some(300), &[(0, Some(100)), (100, Some(300))]);
        model.segments[0].bytes_written = 100;
        model.segments[1].bytes_written = 42;
        assert_eq!(model.bytes_written(), 142);
    }

    #[test]
    fn test_discard_plan_resets_probe_results() {
        let mut model = model_with_bounds(Some(300), &[(0, Some(300))]);
        model.discard_plan();
        assert!(!model.is_planned());
        assert_eq!(model.total_size_bytes, None);
        assert!(!model.supports_range_requests);
    }
}
