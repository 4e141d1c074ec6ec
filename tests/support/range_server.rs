//! A wiremock responder that serves one body with real byte-range semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// The range probe the client sends before planning.
pub const PROBE_RANGE: &str = "bytes=0-0";

/// Deterministic test payload.
#[must_use]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}

/// Serves `body` with `206` for `Range` requests (when enabled) and `200` otherwise.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    ranges: bool,
    failures_left: Arc<AtomicUsize>,
    failure_status: u16,
    delay: Option<Duration>,
    log: RequestLog,
}

/// Range headers seen by a [`RangeResponder`], in arrival order.
#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<Option<String>>>>);

impl RequestLog {
    fn push(&self, range: Option<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(range);
    }

    /// Every request's `Range` header (`None` for plain GETs).
    #[must_use]
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ranged requests other than the probe.
    #[must_use]
    pub fn segment_ranges(&self) -> Vec<String> {
        self.ranges()
            .into_iter()
            .flatten()
            .filter(|r| r != PROBE_RANGE)
            .collect()
    }

    /// Total requests received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl RangeResponder {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            ranges: true,
            failures_left: Arc::new(AtomicUsize::new(0)),
            failure_status: 503,
            delay: None,
            log: RequestLog::default(),
        }
    }

    /// Ignores `Range` and always answers `200` with the full body.
    #[must_use]
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Answers the first `count` requests with `503`.
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Delays every response except the probe.
    #[must_use]
    pub fn with_body_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Handle to the request log; stays valid after mounting.
    #[must_use]
    pub fn log(&self) -> RequestLog {
        self.log.clone()
    }

    /// Mounts the responder for `GET route`.
    pub async fn mount(self, server: &MockServer, route: &str) -> RequestLog {
        let log = self.log();
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(self)
            .mount(server)
            .await;
        log
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn full(&self) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(self.body.as_slice())
    }

    fn partial(&self, header: &str) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let Some((start, end)) = parse_range(header, total) else {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{total}").as_str());
        };
        let slice = &self.body[start as usize..=end as usize];
        ResponseTemplate::new(206)
            .insert_header(
                "Content-Range",
                format!("bytes {start}-{end}/{total}").as_str(),
            )
            .set_body_bytes(slice)
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.log.push(range.clone());

        if self.take_failure() {
            return ResponseTemplate::new(self.failure_status);
        }

        let template = match range.as_deref() {
            Some(header) if self.ranges => self.partial(header),
            _ => self.full(),
        };
        match self.delay {
            Some(delay) if range.as_deref() != Some(PROBE_RANGE) => template.set_delay(delay),
            _ => template,
        }
    }
}

/// Inclusive `(first, last)` for `bytes=a-b` or `bytes=a-`, clamped to the body.
fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (first, last) = spec.split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    if first >= total {
        return None;
    }
    let last = match last.trim() {
        "" => total - 1,
        n => n.parse::<u64>().ok()?.min(total - 1),
    };
    (last >= first).then_some((first, last))
}
