//! Error classification and exponential backoff for segment and probe failures.
//!
//! Workers never retry on their own: they surface the raw [`DownloadError`] and
//! the coordinator asks the [`RetryPolicy`] what to do next.
//!
//! # Example
//!
//! ```
//! use segfetch_core::download::{DownloadError, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/file.iso", 503);
//!
//! match policy.should_retry(&error, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::{DownloadError, FailureKind};

/// Default maximum attempts per segment per run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Throttled responses (429/503) wait this many times longer.
const THROTTLED_FACTOR: u32 = 4;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Cap on server-provided Retry-After values (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient network failures and throttling (408/504, 429/503).
    Retryable,
    /// Disk full, 403/404, malformed URL and every other class that retrying cannot fix.
    Fatal,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Give up and surface the error.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry configuration with exponential backoff.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// Throttled failures multiply the capped delay by 4 unless the server sent a
/// usable `Retry-After`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: true,
        }
    }

    /// Returns a copy with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self.clone()
        }
    }

    /// Returns a copy without random jitter (deterministic delays).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classifies an error as retryable or fatal.
    #[must_use]
    pub fn classify(error: &DownloadError) -> RetryClass {
        match error {
            DownloadError::Network { source, .. } if is_tls_error(source) => RetryClass::Fatal,
            _ => Self::classify_kind(error.kind()),
        }
    }

    /// Classifies a persisted failure kind.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn classify_kind(kind: FailureKind) -> RetryClass {
        match kind {
            FailureKind::Timeout | FailureKind::Network | FailureKind::Throttled => {
                RetryClass::Retryable
            }
            FailureKind::ServerError => RetryClass::Fatal,
            FailureKind::NotFound
            | FailureKind::Forbidden
            | FailureKind::ClientError
            | FailureKind::MalformedUrl => RetryClass::Fatal,
            FailureKind::DiskFull | FailureKind::PermissionDenied | FailureKind::Storage => {
                RetryClass::Fatal
            }
            FailureKind::RangeNotHonored
            | FailureKind::ChecksumMismatch
            | FailureKind::Internal => RetryClass::Fatal,
        }
    }

    /// True once `attempt` failed attempts have used up the budget.
    #[must_use]
    pub fn should_abandon(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Backoff delay after failed attempt number `attempt` (1-indexed).
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.jitter()
    }

    /// Determines whether to retry after failed attempt number `attempt`.
    #[instrument(skip(self, error), fields(max_attempts = self.max_attempts, kind = %error.kind()))]
    pub fn should_retry(&self, error: &DownloadError, attempt: u32) -> RetryDecision {
        if Self::classify(error) == RetryClass::Fatal {
            return RetryDecision::DoNotRetry {
                reason: format!("{} failure - retry would not help", error.kind()),
            };
        }

        if self.should_abandon(attempt) {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = if error.kind() == FailureKind::Throttled {
            error
                .retry_after()
                .and_then(parse_retry_after)
                .unwrap_or_else(|| self.backoff(attempt) * THROTTLED_FACTOR + self.jitter())
        } else {
            self.next_delay(attempt)
        };

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn jitter(&self) -> Duration {
        if !self.jitter {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(MAX_JITTER.as_millis()).unwrap_or(0);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Values above one hour are capped; dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(cap_retry_after(Duration::from_secs(seconds)));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(when) => Some(
            when.duration_since(std::time::SystemTime::now())
                .map_or(Duration::ZERO, cap_retry_after),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

fn cap_retry_after(delay: Duration) -> Duration {
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        MAX_RETRY_AFTER
    } else {
        delay
    }
}

/// Certificate problems do not go away on retry.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("certificate") || text.contains("tls") || text.contains("handshake")
}
