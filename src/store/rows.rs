//! Database rows and their conversion to and from the domain model.

use std::path::PathBuf;

use sqlx::FromRow;

use super::{Result, StoreError};
use crate::download::FailureKind;
use crate::model::{DownloadModel, DownloadStatus, Segment, SegmentState};

/// One row of `downloads`.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct DownloadRow {
    pub id: i64,
    pub source_url: String,
    pub destination_path: String,
    pub display_name: String,
    pub total_size_bytes: Option<i64>,
    pub supports_range_requests: bool,
    /// Stored as text, parsed in [`DownloadRow::into_model`].
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    pub priority: i64,
    pub expected_size: Option<i64>,
    pub expected_sha256: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of `segments`.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct SegmentRow {
    pub download_id: i64,
    pub idx: i64,
    pub range_start: i64,
    pub range_end: Option<i64>,
    pub bytes_written: i64,
    pub temp_file_path: String,
    #[sqlx(rename = "state")]
    pub state_str: String,
}

impl DownloadRow {
    /// Builds the model from this row and its segment rows (already ordered by index).
    pub(crate) fn into_model(self, segments: Vec<SegmentRow>) -> Result<DownloadModel> {
        let id = self.id;
        let status: DownloadStatus = self
            .status_str
            .parse()
            .map_err(|e: String| StoreError::corrupt(id, e))?;
        // Unknown kinds from newer versions are dropped rather than failing the load.
        let last_error_kind = self
            .last_error_kind
            .as_deref()
            .and_then(|kind| kind.parse::<FailureKind>().ok());

        let segments = segments
            .into_iter()
            .map(|row| row.into_segment(id))
            .collect::<Result<Vec<_>>>()?;

        Ok(DownloadModel {
            id,
            source_url: self.source_url,
            destination_path: PathBuf::from(self.destination_path),
            display_name: self.display_name,
            total_size_bytes: opt_from_db(id, self.total_size_bytes)?,
            supports_range_requests: self.supports_range_requests,
            segments,
            status,
            attempt_count: u32::try_from(self.attempt_count)
                .map_err(|_| StoreError::corrupt(id, "negative attempt count"))?,
            last_error: self.last_error,
            last_error_kind,
            priority: self.priority,
            expected_size: opt_from_db(id, self.expected_size)?,
            expected_sha256: self.expected_sha256,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl SegmentRow {
    fn into_segment(self, id: i64) -> Result<Segment> {
        let state: SegmentState = self
            .state_str
            .parse()
            .map_err(|e: String| StoreError::corrupt(id, e))?;
        Ok(Segment {
            index: u32::try_from(self.idx)
                .map_err(|_| StoreError::corrupt(id, "segment index out of range"))?,
            range_start: from_db(id, self.range_start)?,
            range_end: opt_from_db(id, self.range_end)?,
            bytes_written: from_db(id, self.bytes_written)?,
            temp_file_path: PathBuf::from(self.temp_file_path),
            state,
        })
    }
}

pub(crate) fn from_db(id: i64, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::corrupt(id, format!("negative byte value {value}")))
}

pub(crate) fn opt_from_db(id: i64, value: Option<i64>) -> Result<Option<u64>> {
    value.map(|v| from_db(id, v)).transpose()
}

pub(crate) fn to_db(id: i64, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::corrupt(id, format!("byte value {value} too large")))
}

pub(crate) fn opt_to_db(id: i64, value: Option<u64>) -> Result<Option<i64>> {
    value.map(|v| to_db(id, v)).transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(status: &str) -> DownloadRow {
        DownloadRow {
            id: 5,
            source_url: "https://example.com/a".into(),
            destination_path: "/tmp/a".into(),
            display_name: "a".into(),
            total_size_bytes: Some(10),
            supports_range_requests: true,
            status_str: status.into(),
            attempt_count: 2,
            last_error: None,
            last_error_kind: Some("throttled".into()),
            priority: 0,
            expected_size: None,
            expected_sha256: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_row_into_model_parses_enums() {
        let model = row("paused").into_model(Vec::new()).unwrap();
        assert_eq!(model.status, DownloadStatus::Paused);
        assert_eq!(model.last_error_kind, Some(FailureKind::Throttled));
        assert_eq!(model.attempt_count, 2);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = row("exploded").into_model(Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { id: 5, .. }));
    }

    #[test]
    fn test_negative_bytes_are_corrupt() {
        let segment = SegmentRow {
            download_id: 5,
            idx: 0,
            range_start: 0,
            range_end: Some(10),
            bytes_written: -1,
            temp_file_path: "/tmp/seg".into(),
            state_str: "pending".into(),
        };
        assert!(row("queued").into_model(vec![segment]).is_err());
    }
}
