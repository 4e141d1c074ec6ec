//! Errors returned by coordinator commands.

use thiserror::Error;

use crate::config::SettingsError;
use crate::model::DownloadStatus;
use crate::store::StoreError;

/// Why a coordinator command was rejected.
///
/// Download failures never surface here; they end as a `Failed` model with
/// `last_error` set.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The submitted URL is not an absolute http(s) URL.
    #[error("invalid source url '{url}': {reason}")]
    InvalidUrl {
        /// Rejected URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The submitted checksum is not 64 hex digits.
    #[error("invalid sha-256 digest '{value}'")]
    InvalidChecksum {
        /// Rejected value.
        value: String,
    },

    /// No download with this id exists.
    #[error("download {0} not found")]
    NotFound(i64),

    /// The command does not apply to the download's current status.
    #[error("download {id} cannot move from {from} to {to}")]
    InvalidState {
        /// Download id.
        id: i64,
        /// Current status.
        from: DownloadStatus,
        /// Requested status.
        to: DownloadStatus,
    },

    /// Reading or writing the store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Settings were rejected.
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// The coordinator has been shut down.
    #[error("coordinator is shut down")]
    ShutDown,
}

impl CoordinatorError {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(id: i64, from: DownloadStatus, to: DownloadStatus) -> Self {
        Self::InvalidState { id, from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_display() {
        let err =
            CoordinatorError::invalid_state(7, DownloadStatus::Completed, DownloadStatus::Paused);
        assert_eq!(err.to_string(), "download 7 cannot move from completed to paused");
    }

    #[test]
    fn test_store_error_converts() {
        let err: CoordinatorError = StoreError::NotFound(3).into();
        assert!(matches!(err, CoordinatorError::Store(StoreError::NotFound(3))));
    }
}
