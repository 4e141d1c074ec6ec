//! Download and segment lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a download.
///
/// ```text
/// Queued -> Probing -> Active <-> Paused
///                        |
///                     Merging -> Completed
/// any non-terminal -> Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for admission.
    Queued,
    /// Capability probe in flight.
    Probing,
    /// Segment workers are running.
    Active,
    /// Stopped by the user; resumable.
    Paused,
    /// Segment files are being concatenated.
    Merging,
    /// Merged and verified at the destination path.
    Completed,
    /// Unretryable error or attempts exhausted; see `last_error`.
    Failed,
    /// Cancelled by the user; temp files removed.
    Cancelled,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Probing => "probing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and Cancelled never change again (Failed can be retried manually).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// States in which the model holds (or is about to hold) an admission slot.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Probing | Self::Active | Self::Merging)
    }

    /// Returns whether moving from `self` to `next` is a legal lifecycle step.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use DownloadStatus::{
            Active, Cancelled, Completed, Failed, Merging, Paused, Probing, Queued,
        };

        if *self == next {
            return true;
        }

        match (self, next) {
            (Completed | Cancelled, _) => false,
            (_, Cancelled) => true,
            (Failed, Queued) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Queued, Probing | Active | Paused) => true,
            (Probing, Active | Paused | Queued) => true,
            (Active, Paused | Merging | Queued) => true,
            (Paused, Queued | Active) => true,
            (Merging, Completed | Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "probing" => Ok(Self::Probing),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "merging" => Ok(Self::Merging),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// State of a single byte-range segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Not started, or interrupted and waiting to resume.
    Pending,
    /// A worker currently owns the segment.
    InProgress,
    /// Every byte of the range is in the temp file.
    Done,
    /// The last worker run ended in an error.
    Failed,
}

impl SegmentState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SegmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid segment state: {s}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_status_round_trips_through_str() {
        for status in [
            DownloadStatus::Queued,
            DownloadStatus::Probing,
            DownloadStatus::Active,
            DownloadStatus::Paused,
            DownloadStatus::Merging,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_download_status_rejects_unknown_value() {
        let err = "downloading".parse::<DownloadStatus>().unwrap_err();
        assert!(err.contains("downloading"));
    }

    #[test]
    fn test_happy_path_transitions_are_legal() {
        use DownloadStatus::*;
        assert!(Queued.can_transition_to(Probing));
        assert!(Probing.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Merging));
        assert!(Merging.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states_do_not_move() {
        use DownloadStatus::*;
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Active));
    }

    #[test]
    fn test_any_non_terminal_state_can_fail_or_cancel() {
        use DownloadStatus::*;
        for status in [Queued, Probing, Active, Paused, Merging] {
            assert!(status.can_transition_to(Failed), "{status} -> failed");
            assert!(status.can_transition_to(Cancelled), "{status} -> cancelled");
        }
    }

    #[test]
    fn test_failed_only_moves_back_to_queued_or_cancelled() {
        use DownloadStatus::*;
        assert!(Failed.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_completed_requires_merging() {
        use DownloadStatus::*;
        assert!(!Active.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn test_segment_state_round_trips_through_str() {
        for state in [
            SegmentState::Pending,
            SegmentState::InProgress,
            SegmentState::Done,
            SegmentState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<SegmentState>().unwrap(), state);
        }
    }
}
