//! HTTP client wrapper: capability probe and ranged GET requests.
//!
//! The client is created once and cloned into every worker so that all
//! segments share one connection pool.

use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, USER_AGENT};
use super::error::DownloadError;

/// HTTP client shared by the planner and all segment workers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

/// What the capability probe learned about a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Entity size, when the server reported one.
    pub total_size: Option<u64>,
    /// Whether the server answered the probe with a partial response.
    pub supports_ranges: bool,
}

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentRange {
    /// Inclusive `(first, last)` byte positions; `None` for `bytes */N`.
    pub range: Option<(u64, u64)>,
    /// Complete length; `None` for `/*`.
    pub total: Option<u64>,
}

impl HttpClient {
    /// Creates a client with the default timeouts (30 s connect, 5 min read idle).
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit connect and read-idle timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn with_timeouts(connect: Duration, read_idle: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect)
            .read_timeout(read_idle)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Probes `url` with a one-byte range request.
    ///
    /// - `206` with `Content-Range: bytes 0-0/N`: ranges supported, size `N`
    /// - `200`: no range support, size from `Content-Length` if present
    /// - `416` with `Content-Range: bytes */0`: empty entity
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures and error statuses.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let result = match status {
            StatusCode::PARTIAL_CONTENT => match content_range {
                Some(ContentRange {
                    range: Some((0, _)),
                    total: Some(total),
                }) => ProbeResult {
                    total_size: Some(total),
                    supports_ranges: true,
                },
                other => {
                    debug!(?other, "partial probe response without usable Content-Range");
                    ProbeResult {
                        total_size: None,
                        supports_ranges: false,
                    }
                }
            },
            StatusCode::RANGE_NOT_SATISFIABLE
                if content_range.is_some_and(|cr| cr.total == Some(0)) =>
            {
                ProbeResult {
                    total_size: Some(0),
                    supports_ranges: true,
                }
            }
            status if status.is_success() => ProbeResult {
                total_size: response.content_length(),
                supports_ranges: false,
            },
            _ => return Err(status_error(url, &response)),
        };

        debug!(
            total_size = ?result.total_size,
            supports_ranges = result.supports_ranges,
            status = status.as_u16(),
            "probe complete"
        );
        Ok(result)
    }

    /// Sends a GET, optionally with a `Range` header, and rejects error statuses.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures and non-2xx statuses.
    pub async fn get(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request.send().await.map_err(|e| transport_error(url, e))?;
        if !response.status().is_success() {
            return Err(status_error(url, &response));
        }
        Ok(response)
    }
}

/// Maps a reqwest send/body error, promoting timeouts.
pub(crate) fn transport_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

fn status_error(url: &str, response: &reqwest::Response) -> DownloadError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    DownloadError::http_status_with_retry_after(url, response.status().as_u16(), retry_after)
}

/// Parses `bytes a-b/N`, `bytes a-b/*` and `bytes */N`.
pub(crate) fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;

    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse::<u64>().ok()?),
    };
    let range = match range.trim() {
        "*" => None,
        r => {
            let (first, last) = r.split_once('-')?;
            let first = first.trim().parse::<u64>().ok()?;
            let last = last.trim().parse::<u64>().ok()?;
            if last < first {
                return None;
            }
            Some((first, last))
        }
    };

    Some(ContentRange { range, total })
}
