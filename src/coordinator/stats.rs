//! Run counters shared by every download task.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Totals since the coordinator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Downloads that reached Completed.
    pub completed: usize,
    /// Downloads that reached Failed.
    pub failed: usize,
    /// Downloads cancelled by the user.
    pub cancelled: usize,
    /// Segment and probe attempts that were retried.
    pub retried: usize,
}

impl RunSummary {
    /// Completed plus failed.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Default)]
pub(crate) struct RunStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    retried: AtomicUsize,
}

impl RunStats {
    pub(crate) fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn summary(&self) -> RunSummary {
        RunSummary {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_are_thread_safe() {
        let stats = Arc::new(RunStats::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.increment_completed();
                        stats.increment_retried();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let summary = stats.summary();
        assert_eq!(summary.completed, 800);
        assert_eq!(summary.retried, 800);
        assert_eq!(summary.finished(), 800);
    }
}
