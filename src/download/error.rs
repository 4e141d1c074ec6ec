//! Error types for the download module.
//!
//! Workers surface these raw errors; the coordinator classifies them through
//! the retry policy and only ever exposes a terminal `Failed` state externally.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Linux `ENOSPC`.
const ENOSPC: i32 = 28;

/// Errors that can occur while probing or fetching a segment.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (429/503 responses).
        retry_after: Option<String>,
    },

    /// File system error while writing a temp file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or not http(s).
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A ranged request was answered with something other than the requested range.
    #[error("server ignored range request for {url} at offset {offset}")]
    RangeNotHonored {
        /// The URL that ignored the range.
        url: String,
        /// Requested start offset.
        offset: u64,
    },

    /// The body ended before the requested range was complete.
    #[error("connection closed early downloading {url}: expected {expected} bytes, got {received}")]
    IncompleteBody {
        /// The URL being fetched.
        url: String,
        /// Bytes the range still required.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a range-not-honored error.
    pub fn range_not_honored(url: impl Into<String>, offset: u64) -> Self {
        Self::RangeNotHonored {
            url: url.into(),
            offset,
        }
    }

    /// Creates an incomplete-body error.
    pub fn incomplete_body(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::IncompleteBody {
            url: url.into(),
            expected,
            received,
        }
    }

    /// Returns the persisted classification of this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. } | Self::IncompleteBody { .. } => FailureKind::Network,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::HttpStatus { status, .. } => FailureKind::from_http_status(*status),
            Self::Io { source, .. } => FailureKind::from_io(source),
            Self::InvalidUrl { .. } => FailureKind::MalformedUrl,
            Self::RangeNotHonored { .. } => FailureKind::RangeNotHonored,
        }
    }

    /// Retry-After header carried by the error, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

/// Classified failure cause, persisted alongside `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connect/read timeout, HTTP 408/504.
    Timeout,
    /// Connection reset, DNS failure, premature EOF.
    Network,
    /// HTTP 404/410.
    NotFound,
    /// HTTP 401/403/407.
    Forbidden,
    /// HTTP 429 or 503.
    Throttled,
    /// Any other 5xx.
    ServerError,
    /// Any other 4xx.
    ClientError,
    /// Malformed or unsupported URL.
    MalformedUrl,
    /// No space left on the device.
    DiskFull,
    /// Permission denied on a local path.
    PermissionDenied,
    /// Other local file system failure.
    Storage,
    /// Server stopped honoring byte ranges.
    RangeNotHonored,
    /// Merged size or digest did not match.
    ChecksumMismatch,
    /// Worker task panicked or could not be joined.
    Internal,
}

impl FailureKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Throttled => "throttled",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::MalformedUrl => "malformed_url",
            Self::DiskFull => "disk_full",
            Self::PermissionDenied => "permission_denied",
            Self::Storage => "storage",
            Self::RangeNotHonored => "range_not_honored",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Internal => "internal",
        }
    }

    /// Maps an HTTP status code to a failure kind.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 | 407 => Self::Forbidden,
            404 | 410 => Self::NotFound,
            408 => Self::Timeout,
            429 => Self::Throttled,
            503 => Self::Throttled,
            504 => Self::Timeout,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }

    /// Maps a local IO error to a failure kind.
    #[must_use]
    pub fn from_io(error: &std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::StorageFull || error.raw_os_error() == Some(ENOSPC) {
            Self::DiskFull
        } else if error.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied
        } else {
            Self::Storage
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "network" => Ok(Self::Network),
            "not_found" => Ok(Self::NotFound),
            "forbidden" => Ok(Self::Forbidden),
            "throttled" => Ok(Self::Throttled),
            "server_error" => Ok(Self::ServerError),
            "client_error" => Ok(Self::ClientError),
            "malformed_url" => Ok(Self::MalformedUrl),
            "disk_full" => Ok(Self::DiskFull),
            "permission_denied" => Ok(Self::PermissionDenied),
            "storage" => Ok(Self::Storage),
            "range_not_honored" => Ok(Self::RangeNotHonored),
            "checksum_mismatch" => Ok(Self::ChecksumMismatch),
            "internal" => Ok(Self::Internal),
            _ => Err(format!("invalid failure kind: {s}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/file.iso");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.iso"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.iso", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://example.com/file.iso"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_download_error_incomplete_body_display() {
        let error = DownloadError::incomplete_body("https://example.com/a", 100, 40);
        let msg = error.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn test_http_status_kinds() {
        assert_eq!(FailureKind::from_http_status(404), FailureKind::NotFound);
        assert_eq!(FailureKind::from_http_status(410), FailureKind::NotFound);
        assert_eq!(FailureKind::from_http_status(403), FailureKind::Forbidden);
        assert_eq!(FailureKind::from_http_status(401), FailureKind::Forbidden);
        assert_eq!(FailureKind::from_http_status(429), FailureKind::Throttled);
        assert_eq!(FailureKind::from_http_status(503), FailureKind::Throttled);
        assert_eq!(FailureKind::from_http_status(500), FailureKind::ServerError);
        assert_eq!(FailureKind::from_http_status(502), FailureKind::ServerError);
        assert_eq!(FailureKind::from_http_status(504), FailureKind::Timeout);
        assert_eq!(FailureKind::from_http_status(408), FailureKind::Timeout);
        assert_eq!(FailureKind::from_http_status(400), FailureKind::ClientError);
    }

    #[test]
    fn test_io_storage_full_is_disk_full() {
        let error = std::io::Error::from_raw_os_error(ENOSPC);
        assert_eq!(FailureKind::from_io(&error), FailureKind::DiskFull);

        let error = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert_eq!(FailureKind::from_io(&error), FailureKind::DiskFull);
    }

    #[test]
    fn test_io_permission_denied_kind() {
        let error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(FailureKind::from_io(&error), FailureKind::PermissionDenied);
        let wrapped = DownloadError::io("/root/x", error);
        assert_eq!(wrapped.kind(), FailureKind::PermissionDenied);
    }

    #[test]
    fn test_invalid_url_kind() {
        assert_eq!(
            DownloadError::invalid_url("not a url").kind(),
            FailureKind::MalformedUrl
        );
    }

    #[test]
    fn test_failure_kind_round_trips_through_str() {
        for kind in [
            FailureKind::Timeout,
            FailureKind::Network,
            FailureKind::NotFound,
            FailureKind::Forbidden,
            FailureKind::Throttled,
            FailureKind::ServerError,
            FailureKind::ClientError,
            FailureKind::MalformedUrl,
            FailureKind::DiskFull,
            FailureKind::PermissionDenied,
            FailureKind::Storage,
            FailureKind::RangeNotHonored,
            FailureKind::ChecksumMismatch,
            FailureKind::Internal,
        ] {
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_retry_after_only_on_http_status() {
        let error = DownloadError::http_status_with_retry_after(
            "https://example.com",
            429,
            Some("7".to_string()),
        );
        assert_eq!(error.retry_after(), Some("7"));
        assert_eq!(DownloadError::timeout("https://example.com").retry_after(), None);
    }
}
