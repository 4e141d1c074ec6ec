//! segfetch core library
//!
//! A segmented, resumable HTTP download engine. Large remote files are fetched
//! in parallel byte-range segments into private temp files, checkpointed to
//! `SQLite`, and reassembled into the destination with a single atomic rename.
//!
//! # Architecture
//!
//! - [`model`] - Download and segment entities with their lifecycle states
//! - [`download`] - Probe, segment planning, segment workers, merge, retry policy
//! - [`store`] - Transactional persistence of models and segments
//! - [`coordinator`] - Admission control, lifecycle commands, retry orchestration
//! - [`progress`] - Periodic progress snapshots fanned out to observers
//! - [`config`] - Live-reloadable engine settings and network policy
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod coordinator;
pub mod db;
pub mod download;
pub mod model;
pub mod progress;
pub mod store;

// Re-export commonly used types
pub use config::{EngineSettings, SettingsError, SettingsHandle};
pub use coordinator::{Coordinator, CoordinatorError, DownloadRequest, RunSummary};
pub use db::{Database, DbError};
pub use download::{DownloadError, FailureKind, HttpClient, RetryPolicy};
pub use model::{DownloadModel, DownloadStatus, Segment, SegmentState};
pub use progress::{ProgressBroadcaster, ProgressSnapshot};
pub use store::{DownloadRepository, Store, StoreError};
