//! Reassembly of completed segment files into the destination file.
//!
//! Output goes to `<destination>.part`; the rename onto the destination path
//! is the only step that makes the file visible there. On an integrity
//! failure the segment temp files are kept for diagnostics.
//!
//! Segment files outlive a successful merge until the caller has persisted
//! the Completed status. A crash in between leaves Done segments without
//! files next to a finished destination, which [`adopt_merged_output`]
//! recognizes on the next run.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::constants::MERGE_COPY_BUFFER;
use super::error::FailureKind;
use crate::model::{DownloadModel, DownloadStatus, SegmentState};

/// Why a merge did not produce the destination file.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Merge was requested before every segment was Done.
    #[error("{done} of {total} segments complete")]
    SegmentsIncomplete {
        /// Segments in Done state.
        done: usize,
        /// Segments in the plan.
        total: usize,
    },

    /// Recorded or merged byte count differs from the entity size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Entity size from the probe.
        expected: u64,
        /// Bytes found.
        actual: u64,
    },

    /// SHA-256 of the merged output differs from the announced digest.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Announced digest.
        expected: String,
        /// Digest of the merged output.
        actual: String,
    },

    /// File system error while reading segments or writing the output.
    #[error("IO error during merge at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl MergeError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Failure kind recorded on the model.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SegmentsIncomplete { .. }
            | Self::SizeMismatch { .. }
            | Self::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            Self::Io { source, .. } => FailureKind::from_io(source),
        }
    }
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Final file location.
    pub destination: PathBuf,
    /// Bytes written.
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the output.
    pub sha256: String,
}

/// Concatenates the model's segment files in index order and moves the result
/// onto the destination path.
///
/// On success the model becomes `Completed`; the caller removes the temp
/// files with [`remove_segment_files`] once that status is checkpointed. On
/// any failure the model becomes `Failed` with the classified error, the
/// `.part` file is removed and temp files are left in place.
///
/// # Errors
///
/// Returns [`MergeError`] when a precondition, the size check, the optional
/// checksum or file IO fails.
#[instrument(skip(model), fields(download_id = model.id))]
pub async fn merge(model: &mut DownloadModel) -> Result<MergeReport, MergeError> {
    match merge_inner(model).await {
        Ok(report) => {
            model.status = DownloadStatus::Completed;
            model.clear_error();
            info!(
                destination = %report.destination.display(),
                bytes = report.bytes,
                "merge complete"
            );
            Ok(report)
        }
        Err(e) => {
            let part = model.part_path();
            if let Err(remove_err) = tokio::fs::remove_file(&part).await
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    path = %part.display(),
                    error = %remove_err,
                    "failed to remove partial merge output"
                );
            }
            warn!(error = %e, "merge failed, keeping segment files");
            model.status = DownloadStatus::Failed;
            model.record_error(e.kind(), e.to_string());
            Err(e)
        }
    }
}

async fn merge_inner(model: &DownloadModel) -> Result<MergeReport, MergeError> {
    let done = model.segments.iter().filter(|s| s.is_done()).count();
    if !model.all_segments_done() {
        return Err(MergeError::SegmentsIncomplete {
            done,
            total: model.segments.len(),
        });
    }

    let recorded = model.bytes_written();
    let expected = model.total_size_bytes.unwrap_or(recorded);
    if recorded != expected || !model.has_valid_coverage() {
        return Err(MergeError::SizeMismatch {
            expected,
            actual: recorded,
        });
    }

    let part = model.part_path();
    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MergeError::io(parent, e))?;
    }

    let output = File::create(&part)
        .await
        .map_err(|e| MergeError::io(&part, e))?;
    let mut writer = BufWriter::with_capacity(MERGE_COPY_BUFFER, output);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; MERGE_COPY_BUFFER];
    let mut total = 0u64;

    let mut ordered: Vec<_> = model.segments.iter().collect();
    ordered.sort_by_key(|s| s.index);

    for segment in ordered {
        let path = &segment.temp_file_path;
        let copied = append_file(path, &mut writer, &mut hasher, &mut buffer).await?;
        if copied != segment.bytes_written {
            return Err(MergeError::SizeMismatch {
                expected: segment.bytes_written,
                actual: copied,
            });
        }
        debug!(segment = segment.index, bytes = copied, "appended segment");
        total += copied;
    }

    writer.flush().await.map_err(|e| MergeError::io(&part, e))?;
    let output = writer.into_inner();
    output.sync_all().await.map_err(|e| MergeError::io(&part, e))?;
    let on_disk = output
        .metadata()
        .await
        .map_err(|e| MergeError::io(&part, e))?
        .len();
    drop(output);

    if total != expected || on_disk != expected {
        return Err(MergeError::SizeMismatch {
            expected,
            actual: on_disk.max(total),
        });
    }

    let digest = format!("{:x}", hasher.finalize());
    if let Some(announced) = model.expected_sha256.as_deref()
        && !announced.eq_ignore_ascii_case(&digest)
    {
        return Err(MergeError::ChecksumMismatch {
            expected: announced.to_lowercase(),
            actual: digest,
        });
    }

    let destination = model.destination_path.clone();
    if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
        warn!(
            path = %destination.display(),
            "destination appeared during download, replacing it"
        );
    }
    tokio::fs::rename(&part, &destination)
        .await
        .map_err(|e| MergeError::io(&destination, e))?;

    Ok(MergeReport {
        destination,
        bytes: total,
        sha256: digest,
    })
}

async fn append_file(
    path: &Path,
    writer: &mut BufWriter<File>,
    hasher: &mut Sha256,
    buffer: &mut [u8],
) -> Result<u64, MergeError> {
    let mut input = File::open(path).await.map_err(|e| MergeError::io(path, e))?;
    let mut copied = 0u64;
    loop {
        let n = input
            .read(buffer)
            .await
            .map_err(|e| MergeError::io(path, e))?;
        if n == 0 {
            return Ok(copied);
        }
        hasher.update(&buffer[..n]);
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|e| MergeError::io(path, e))?;
        copied += n as u64;
    }
}

/// Marks the model Completed when a previous run already renamed the merged
/// output into place but stopped before recording it.
///
/// Applies only when every segment is Done, at least one segment file is
/// gone, the destination holds exactly `total_size_bytes` bytes and, if a
/// digest was announced, the destination matches it. Returns `None` when the
/// merge still has to run.
///
/// # Errors
///
/// Returns [`MergeError::Io`] if the destination cannot be read.
#[instrument(skip(model), fields(download_id = model.id))]
pub async fn adopt_merged_output(
    model: &mut DownloadModel,
) -> Result<Option<MergeReport>, MergeError> {
    let Some(expected) = model.total_size_bytes else {
        return Ok(None);
    };
    if !model.is_planned() || !model.all_segments_done() {
        return Ok(None);
    }

    let mut missing = false;
    for segment in &model.segments {
        if !tokio::fs::try_exists(&segment.temp_file_path)
            .await
            .unwrap_or(false)
        {
            missing = true;
            break;
        }
    }
    if !missing {
        return Ok(None);
    }

    let destination = model.destination_path.clone();
    let on_disk = match tokio::fs::metadata(&destination).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MergeError::io(&destination, e)),
    };
    if on_disk != expected {
        return Ok(None);
    }

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; MERGE_COPY_BUFFER];
    let mut input = File::open(&destination)
        .await
        .map_err(|e| MergeError::io(&destination, e))?;
    loop {
        let n = input
            .read(&mut buffer)
            .await
            .map_err(|e| MergeError::io(&destination, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let digest = format!("{:x}", hasher.finalize());
    if let Some(announced) = model.expected_sha256.as_deref()
        && !announced.eq_ignore_ascii_case(&digest)
    {
        return Ok(None);
    }

    model.status = DownloadStatus::Completed;
    model.clear_error();
    info!(
        destination = %destination.display(),
        bytes = on_disk,
        "merged output already in place"
    );
    Ok(Some(MergeReport {
        destination,
        bytes: on_disk,
        sha256: digest,
    }))
}

/// Resets Done segments whose temp file is missing or has the wrong length
/// so they are fetched again. Returns how many segments were reset.
pub async fn reconcile_segment_files(model: &mut DownloadModel) -> usize {
    let mut reset = 0;
    for segment in model.segments.iter_mut().filter(|s| s.is_done()) {
        let on_disk = tokio::fs::metadata(&segment.temp_file_path)
            .await
            .ok()
            .map(|meta| meta.len());
        if on_disk == Some(segment.bytes_written) {
            continue;
        }
        warn!(
            segment = segment.index,
            recorded = segment.bytes_written,
            on_disk = ?on_disk,
            "segment file does not match its record, fetching it again"
        );
        segment.bytes_written = on_disk.unwrap_or(0).min(segment.bytes_written);
        segment.state = SegmentState::Pending;
        reset += 1;
    }
    reset
}

/// Deletes every segment temp file and the per-download temp directory.
///
/// Missing files are ignored; other failures are logged.
pub async fn remove_segment_files(model: &DownloadModel) {
    for segment in &model.segments {
        if let Err(e) = tokio::fs::remove_file(&segment.temp_file_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                path = %segment.temp_file_path.display(),
                error = %e,
                "failed to remove segment file"
            );
        }
    }

    let dirs: std::collections::BTreeSet<&Path> = model
        .segments
        .iter()
        .filter_map(|s| s.temp_file_path.parent())
        .collect();
    for dir in dirs {
        // Only succeeds once the directory is empty.
        if let Err(e) = tokio::fs::remove_dir(dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %dir.display(), error = %e, "temp directory not removed");
        }
    }
}
