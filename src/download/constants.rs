//! Constants for the download module (timeouts, buffer sizes).

/// HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP read-idle timeout (5 minutes); a stalled body is treated as a timeout.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Write buffer in front of each segment temp file.
pub const SEGMENT_WRITE_BUFFER: usize = 64 * 1024;

/// Copy buffer used while merging segment files.
pub const MERGE_COPY_BUFFER: usize = 256 * 1024;

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("segfetch/", env!("CARGO_PKG_VERSION"));
