//! Probe, segmented fetch and reassembly.
//!
//! - [`SegmentPlanner`] probes a source and computes a deterministic segment plan
//! - [`SegmentWorker`] fetches one byte range into a private temp file
//! - [`merge`] concatenates finished segments and renames the result into place
//! - [`RetryPolicy`] classifies errors and computes backoff delays
//!
//! # Example
//!
//! ```no_run
//! use segfetch_core::download::{HttpClient, plan_ranges};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let probe = client.probe("https://example.com/video.mp4").await?;
//! if let Some(total) = probe.total_size {
//!     println!("{:?}", plan_ranges(total, 4, 1024 * 1024));
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
pub mod filename;
mod merger;
mod planner;
mod retry;
mod worker;

pub use client::{HttpClient, ProbeResult};
pub use error::{DownloadError, FailureKind};
pub use merger::{
    MergeError, MergeReport, adopt_merged_output, merge, reconcile_segment_files,
    remove_segment_files,
};
pub use planner::{PlanConfig, SegmentPlanner, download_temp_dir, plan_ranges};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, RetryClass, RetryDecision, RetryPolicy, parse_retry_after,
};
pub use worker::{SegmentOutcome, SegmentWorker};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
