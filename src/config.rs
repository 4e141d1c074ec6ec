//! Engine settings, live reload, and network policy.
//!
//! Settings are read fresh at every admission decision through a
//! [`SettingsHandle`]; nothing caches them for the process lifetime.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Upper bound for both concurrency knobs.
pub const MAX_CONCURRENCY_LIMIT: u32 = 32;

/// Default cap on simultaneously admitted downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: u32 = 3;

/// Default cap on segments per download.
pub const DEFAULT_MAX_SEGMENTS_PER_DOWNLOAD: u32 = 4;

/// Default minimum segment size (1 MiB).
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Name of the temp directory created under the destination root.
pub const PARTIAL_DIR_NAME: &str = ".segfetch-partial";

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// Numeric value outside its allowed range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Rejected value.
        value: u64,
        /// Inclusive minimum.
        min: u64,
        /// Inclusive maximum.
        max: u64,
    },

    /// A duration that must be positive was zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Setting name.
        field: &'static str,
    },

    /// A required path was empty.
    #[error("{field} must not be empty")]
    EmptyPath {
        /// Setting name.
        field: &'static str,
    },
}

/// Tunables of the download engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Downloads admitted at the same time (1..=32).
    pub max_concurrent_downloads: u32,
    /// Segments per download (1..=32).
    pub max_segments_per_download: u32,
    /// Defer admission while the link is metered.
    pub wifi_only: bool,
    /// Directory that receives finished files.
    pub destination_root: PathBuf,
    /// Directory for segment temp files; defaults to `<destination_root>/.segfetch-partial`.
    pub temp_root: Option<PathBuf>,
    /// Planner floor on segment size.
    pub min_segment_size: u64,
    /// Attempts per segment per run before the download fails.
    pub max_attempts: u32,
    /// Progress tick period.
    #[serde(with = "millis")]
    pub progress_interval: Duration,
    /// How long one observer may take to accept a snapshot.
    #[serde(with = "millis")]
    pub observer_timeout: Duration,
    /// How long pause/cancel wait for workers to acknowledge.
    #[serde(with = "millis")]
    pub cancel_ack_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_segments_per_download: DEFAULT_MAX_SEGMENTS_PER_DOWNLOAD,
            wifi_only: false,
            destination_root: PathBuf::from("downloads"),
            temp_root: None,
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            max_attempts: crate::download::DEFAULT_MAX_ATTEMPTS,
            progress_interval: Duration::from_millis(500),
            observer_timeout: Duration::from_millis(250),
            cancel_ack_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineSettings {
    /// Settings rooted at `destination_root`, defaults elsewhere.
    #[must_use]
    pub fn with_destination_root(destination_root: impl Into<PathBuf>) -> Self {
        Self {
            destination_root: destination_root.into(),
            ..Self::default()
        }
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`SettingsError`] found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_range(
            "max_concurrent_downloads",
            u64::from(self.max_concurrent_downloads),
            1,
            u64::from(MAX_CONCURRENCY_LIMIT),
        )?;
        check_range(
            "max_segments_per_download",
            u64::from(self.max_segments_per_download),
            1,
            u64::from(MAX_CONCURRENCY_LIMIT),
        )?;
        check_range("min_segment_size", self.min_segment_size, 1, u64::MAX)?;
        check_range("max_attempts", u64::from(self.max_attempts), 1, 100)?;

        if self.destination_root.as_os_str().is_empty() {
            return Err(SettingsError::EmptyPath {
                field: "destination_root",
            });
        }
        if self
            .temp_root
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(SettingsError::EmptyPath { field: "temp_root" });
        }

        for (field, value) in [
            ("progress_interval", self.progress_interval),
            ("observer_timeout", self.observer_timeout),
            ("cancel_ack_timeout", self.cancel_ack_timeout),
        ] {
            if value.is_zero() {
                return Err(SettingsError::ZeroDuration { field });
            }
        }
        Ok(())
    }

    /// Effective temp directory.
    #[must_use]
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| self.destination_root.join(PARTIAL_DIR_NAME))
    }

    /// Size of the shared segment worker pool.
    #[must_use]
    pub fn worker_pool_size(&self) -> usize {
        let size = self.max_concurrent_downloads.saturating_mul(self.max_segments_per_download);
        usize::try_from(size).unwrap_or(usize::MAX)
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), SettingsError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Shared, live-reloadable settings.
///
/// Cloning is cheap; every clone sees updates.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<EngineSettings>>,
}

impl SettingsHandle {
    /// Validates and wraps the initial settings.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if the settings are invalid.
    pub fn new(settings: EngineSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let (tx, _rx) = watch::channel(settings);
        Ok(Self { tx: Arc::new(tx) })
    }

    /// A copy of the current settings.
    #[must_use]
    pub fn current(&self) -> EngineSettings {
        self.tx.borrow().clone()
    }

    /// Replaces the settings and notifies subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] and keeps the old settings if `settings` is invalid.
    pub fn update(&self, settings: EngineSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        info!(
            max_concurrent_downloads = settings.max_concurrent_downloads,
            max_segments_per_download = settings.max_segments_per_download,
            wifi_only = settings.wifi_only,
            "engine settings updated"
        );
        self.tx.send_replace(settings);
        Ok(())
    }

    /// Receiver that wakes on every update.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineSettings> {
        self.tx.subscribe()
    }
}

/// Reports whether the current network link is unmetered.
pub trait NetworkPolicy: Send + Sync {
    /// True when downloads may run under `wifi_only`.
    fn is_unmetered(&self) -> bool;
}

/// Policy for hosts without link-type information: always unmetered.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysUnmetered;

impl NetworkPolicy for AlwaysUnmetered {
    fn is_unmetered(&self) -> bool {
        true
    }
}

/// Policy whose answer is set by the embedding application.
#[derive(Debug)]
pub struct ManualNetworkPolicy {
    unmetered: AtomicBool,
}

impl ManualNetworkPolicy {
    /// Creates the policy with an initial link state.
    #[must_use]
    pub fn new(unmetered: bool) -> Self {
        Self {
            unmetered: AtomicBool::new(unmetered),
        }
    }

    /// Records a link change.
    pub fn set_unmetered(&self, unmetered: bool) {
        self.unmetered.store(unmetered, Ordering::SeqCst);
    }
}

impl NetworkPolicy for ManualNetworkPolicy {
    fn is_unmetered(&self) -> bool {
        self.unmetered.load(Ordering::SeqCst)
    }
}
