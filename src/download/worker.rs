//! Segment worker: one ranged GET streamed into one private temp file.
//!
//! The temp file is the authority for resume: on start the worker reopens it,
//! takes its length `L` and requests `[range_start + L, range_end)`, so bytes
//! already on disk are never fetched twice. Errors are surfaced unchanged;
//! retrying is the coordinator's job.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::CONTENT_RANGE;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::client::{HttpClient, parse_content_range, transport_error};
use super::constants::SEGMENT_WRITE_BUFFER;
use super::error::DownloadError;
use crate::model::Segment;

/// How a worker run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Every byte of the range is in the temp file.
    Completed {
        /// Final temp file length.
        bytes_written: u64,
    },
    /// Stopped between chunks because the token was cancelled.
    Cancelled {
        /// Temp file length at the checkpoint.
        bytes_written: u64,
    },
}

/// Fetches segments of one source.
#[derive(Debug, Clone)]
pub struct SegmentWorker {
    client: HttpClient,
    url: String,
    supports_ranges: bool,
    total_size: Option<u64>,
}

impl SegmentWorker {
    /// Creates a worker for `url` using probe results stored on the model.
    #[must_use]
    pub fn new(
        client: HttpClient,
        url: impl Into<String>,
        supports_ranges: bool,
        total_size: Option<u64>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            supports_ranges,
            total_size,
        }
    }

    /// Downloads the missing part of `segment` into its temp file.
    ///
    /// `progress` holds the temp file length and is updated after every chunk.
    /// Cancellation is checked between chunks.
    ///
    /// # Errors
    ///
    /// Returns the raw [`DownloadError`]; `progress` still reflects the bytes
    /// written before the failure.
    #[instrument(skip(self, segment, progress, cancel), fields(segment = segment.index))]
    pub async fn run(
        &self,
        segment: &Segment,
        progress: &AtomicU64,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutcome, DownloadError> {
        let path = segment.temp_file_path.as_path();
        let (file, mut written) = self.open_temp_file(segment).await?;
        progress.store(written, Ordering::Relaxed);

        let expected = segment.len();
        if expected == Some(written) {
            debug!(bytes = written, "segment already complete on disk");
            return Ok(SegmentOutcome::Completed {
                bytes_written: written,
            });
        }
        if cancel.is_cancelled() {
            return Ok(SegmentOutcome::Cancelled {
                bytes_written: written,
            });
        }

        let offset = segment.range_start + written;
        let range_header = self.range_header(segment, offset);
        debug!(offset, range = ?range_header, "requesting segment");

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(SegmentOutcome::Cancelled { bytes_written: written });
            }
            response = self.client.get(&self.url, range_header.as_deref()) => response?,
        };
        self.check_response(&response, segment, offset, range_header.is_some())?;

        let mut writer = BufWriter::with_capacity(SEGMENT_WRITE_BUFFER, file);
        let mut stream = response.bytes_stream();
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    flush_quietly(&mut writer, path).await;
                    return Err(transport_error(&self.url, e));
                }
            };

            let take = expected.map_or(chunk.len(), |len| {
                usize::try_from(len - written)
                    .unwrap_or(usize::MAX)
                    .min(chunk.len())
            });
            if let Err(e) = writer.write_all(&chunk[..take]).await {
                flush_quietly(&mut writer, path).await;
                return Err(DownloadError::io(path, e));
            }
            written += take as u64;
            progress.store(written, Ordering::Relaxed);

            if expected == Some(written) {
                if take < chunk.len() {
                    warn!(
                        extra = chunk.len() - take,
                        "server sent more than requested, discarding"
                    );
                }
                break;
            }
        }

        finish(writer, path).await?;

        if cancelled {
            debug!(bytes = written, "segment paused at checkpoint");
            return Ok(SegmentOutcome::Cancelled {
                bytes_written: written,
            });
        }

        if let Some(len) = expected
            && written < len
        {
            let resumed_at = offset - segment.range_start;
            return Err(DownloadError::incomplete_body(
                &self.url,
                len - resumed_at,
                written - resumed_at,
            ));
        }

        debug!(bytes = written, "segment complete");
        Ok(SegmentOutcome::Completed {
            bytes_written: written,
        })
    }

    /// Opens the temp file for appending and returns its usable length.
    ///
    /// Files longer than the segment, and partial files of a source without
    /// range support, are truncated.
    async fn open_temp_file(&self, segment: &Segment) -> Result<(File, u64), DownloadError> {
        let path = segment.temp_file_path.as_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        let on_disk = file
            .metadata()
            .await
            .map_err(|e| DownloadError::io(path, e))?
            .len();

        let too_long = segment.len().is_some_and(|len| on_disk > len);
        let cannot_resume = !self.supports_ranges && on_disk > 0 && segment.len() != Some(on_disk);
        if too_long || cannot_resume {
            warn!(
                on_disk,
                expected = ?segment.len(),
                ranges = self.supports_ranges,
                "discarding unusable partial temp file"
            );
            file.set_len(0)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            return Ok((file, 0));
        }

        if on_disk != segment.bytes_written {
            debug!(
                on_disk,
                recorded = segment.bytes_written,
                "temp file length differs from checkpoint, trusting file"
            );
        }
        Ok((file, on_disk))
    }

    fn range_header(&self, segment: &Segment, offset: u64) -> Option<String> {
        if !self.supports_ranges {
            return None;
        }
        match segment.range_end {
            Some(end) => Some(format!("bytes={offset}-{}", end - 1)),
            None => Some(format!("bytes={offset}-")),
        }
    }

    /// Accepts `206` starting at `offset`, or `200` when the whole entity was wanted.
    fn check_response(
        &self,
        response: &reqwest::Response,
        segment: &Segment,
        offset: u64,
        ranged: bool,
    ) -> Result<(), DownloadError> {
        let whole_entity = offset == 0 && segment.range_end == self.total_size;
        match response.status() {
            StatusCode::PARTIAL_CONTENT if ranged => {
                let start = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .and_then(|cr| cr.range)
                    .map(|(first, _)| first);
                if start == Some(offset) {
                    Ok(())
                } else {
                    warn!(offset, ?start, "partial response for the wrong range");
                    Err(DownloadError::range_not_honored(&self.url, offset))
                }
            }
            StatusCode::OK if !ranged || whole_entity => Ok(()),
            _ => Err(DownloadError::range_not_honored(&self.url, offset)),
        }
    }
}

async fn finish(mut writer: BufWriter<File>, path: &Path) -> Result<(), DownloadError> {
    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    writer
        .into_inner()
        .sync_data()
        .await
        .map_err(|e| DownloadError::io(path, e))
}

/// Keeps already-received bytes on disk before an error is surfaced.
async fn flush_quietly(writer: &mut BufWriter<File>, path: &Path) {
    if let Err(e) = writer.flush().await {
        warn!(path = %path.display(), error = %e, "failed to flush partial segment");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn segment(dir: &TempDir, start: u64, end: u64) -> Segment {
        Segment::new(0, start, Some(end), dir.path().join("seg-0000"))
    }

    #[tokio::test]
    async fn test_resume_requests_only_missing_bytes() {
        let server = MockServer::start().await;
        let data = body(1000);
        Mock::given(method("GET"))
            .and(header("range", "bytes=400-999"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 400-999/1000")
                    .set_body_bytes(data[400..].to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, 0, 1000);
        std::fs::write(&seg.temp_file_path, &data[..400]).unwrap();

        let worker = SegmentWorker::new(HttpClient::new().unwrap(), server.uri(), true, Some(1000));
        let progress = AtomicU64::new(0);
        let outcome = worker
            .run(&seg, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, SegmentOutcome::Completed { bytes_written: 1000 });
        assert_eq!(progress.load(Ordering::Relaxed), 1000);
        assert_eq!(std::fs::read(&seg.temp_file_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_complete_file_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, 100, 200);
        std::fs::write(&seg.temp_file_path, vec![1u8; 100]).unwrap();

        let worker = SegmentWorker::new(HttpClient::new().unwrap(), server.uri(), true, Some(200));
        let outcome = worker
            .run(&seg, &AtomicU64::new(0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SegmentOutcome::Completed { bytes_written: 100 });
    }

    #[tokio::test]
    async fn test_ignored_range_is_range_not_honored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(1000)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, 500, 1000);
        let worker = SegmentWorker::new(HttpClient::new().unwrap(), server.uri(), true, Some(1000));
        let err = worker
            .run(&seg, &AtomicU64::new(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::RangeNotHonored { offset: 500, .. }));
    }

    #[tokio::test]
    async fn test_short_body_is_incomplete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-99/100")
                    .set_body_bytes(body(60)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, 0, 100);
        let progress = AtomicU64::new(0);
        let worker = SegmentWorker::new(HttpClient::new().unwrap(), server.uri(), true, Some(100));
        let err = worker
            .run(&seg, &progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::IncompleteBody { received: 60, .. }));
        assert_eq!(progress.load(Ordering::Relaxed), 60);
        assert_eq!(std::fs::metadata(&seg.temp_file_path).unwrap().len(), 60);
    }

    #[tokio::test]
    async fn test_serial_fallback_restarts_partial_file() {
        let server = MockServer::start().await;
        let data = body(300);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, 0, 300);
        std::fs::write(&seg.temp_file_path, vec![9u8; 120]).unwrap();

        let worker = SegmentWorker::new(HttpClient::new().unwrap(), server.uri(), false, Some(300));
        let outcome = worker
            .run(&seg, &AtomicU64::new(0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SegmentOutcome::Completed { bytes_written: 300 });
        assert_eq!(std::fs::read(&seg.temp_file_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_open_ended_reads_to_eof() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(777)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let seg = Segment::new(0, 0, None, dir.path().join("nested").join("seg-0000"));
        let worker = SegmentWorker::new(HttpClient::new().unwrap(), server.uri(), false, None);
        let outcome = worker
            .run(&seg, &AtomicU64::new(0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SegmentOutcome::Completed { bytes_written: 777 });
    }

    #[tokio::test]
    async fn test_cancelled_before_start_keeps_file() {
        let dir = TempDir::new().unwrap();
        let seg = segment(&dir, 0, 100);
        std::fs::write(&seg.temp_file_path, vec![1u8; 10]).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let worker = SegmentWorker::new(
            HttpClient::new().unwrap(),
            "http://127.0.0.1:9/never",
            true,
            Some(100),
        );
        let outcome = worker.run(&seg, &AtomicU64::new(0), &token).await.unwrap();
        assert_eq!(outcome, SegmentOutcome::Cancelled { bytes_written: 10 });
        assert!(PathBuf::from(&seg.temp_file_path).exists());
    }
}
