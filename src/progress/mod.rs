//! Periodic progress aggregation and observer fan-out.
//!
//! The broadcaster ticks on its own fixed interval, independent of any
//! download's lifecycle. Each tick reads the live counters of every running
//! download, computes throughput since the previous tick and pushes one shared
//! [`ProgressSnapshot`] to all observers in parallel. An observer that does not
//! accept the snapshot within the timeout is dropped and logged.

mod observer;
mod registry;
mod snapshot;

pub use observer::{ChannelObserver, Delivery, ObserverHandle, ProgressObserver};
pub use registry::{LiveDownload, ProgressRegistry};
pub use snapshot::{DownloadProgress, ProgressSnapshot};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Observers notified concurrently within one tick.
const MAX_PARALLEL_DELIVERIES: usize = 16;

struct TickState {
    at: Instant,
    bytes: HashMap<i64, u64>,
}

/// Aggregates live progress and fans it out to observers.
pub struct ProgressBroadcaster {
    registry: Arc<ProgressRegistry>,
    observers: DashMap<u64, Arc<dyn ProgressObserver>>,
    next_handle: AtomicU64,
    sequence: AtomicU64,
    previous: Mutex<Option<TickState>>,
    observer_timeout: Duration,
}

impl std::fmt::Debug for ProgressBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBroadcaster")
            .field("observers", &self.observers.len())
            .field("running", &self.registry.len())
            .field("observer_timeout", &self.observer_timeout)
            .finish_non_exhaustive()
    }
}

impl ProgressBroadcaster {
    /// Creates a broadcaster over the live registry.
    #[must_use]
    pub fn new(registry: Arc<ProgressRegistry>, observer_timeout: Duration) -> Self {
        Self {
            registry,
            observers: DashMap::new(),
            next_handle: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            previous: Mutex::new(None),
            observer_timeout,
        }
    }

    /// Registers an observer.
    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) -> ObserverHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        debug!(handle = id, "progress observer subscribed");
        ObserverHandle(id)
    }

    /// Registers a bounded channel and returns its receiver.
    ///
    /// Dropping the receiver unregisters the observer at the next tick.
    pub fn subscribe_channel(
        &self,
        capacity: usize,
    ) -> (ObserverHandle, mpsc::Receiver<Arc<ProgressSnapshot>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = self.subscribe(Arc::new(ChannelObserver::new(tx)));
        (handle, rx)
    }

    /// Unregisters an observer; returns whether it was still registered.
    ///
    /// Safe to call any number of times.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        self.observers.remove(&handle.0).is_some()
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Builds the snapshot for this instant, computing throughput against the
    /// previous call.
    #[must_use]
    pub fn collect(&self) -> ProgressSnapshot {
        let now = Instant::now();
        let mut downloads: Vec<DownloadProgress> = self
            .registry
            .entries()
            .iter()
            .map(|live| live.progress())
            .collect();

        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = previous
            .as_ref()
            .map(|p| now.duration_since(p.at))
            .filter(|d| !d.is_zero());

        let mut aggregate = 0u64;
        for progress in &mut downloads {
            let before = previous
                .as_ref()
                .and_then(|p| p.bytes.get(&progress.id).copied());
            if let (Some(before), Some(elapsed)) = (before, elapsed) {
                progress.bytes_per_second =
                    rate(progress.bytes_written.saturating_sub(before), elapsed);
                aggregate += progress.bytes_per_second;
            }
        }

        *previous = Some(TickState {
            at: now,
            bytes: downloads.iter().map(|d| (d.id, d.bytes_written)).collect(),
        });
        drop(previous);

        ProgressSnapshot {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            total_bytes_written: downloads.iter().map(|d| d.bytes_written).sum(),
            bytes_per_second: aggregate,
            downloads,
        }
    }

    /// Runs one tick: collect, then deliver to every observer concurrently.
    ///
    /// Observers that time out or report [`Delivery::Closed`] are removed.
    #[instrument(skip(self), fields(observers = self.observers.len()))]
    pub async fn tick(&self) -> Arc<ProgressSnapshot> {
        let snapshot = Arc::new(self.collect());
        let targets: Vec<(u64, Arc<dyn ProgressObserver>)> = self
            .observers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let timeout = self.observer_timeout;
        let snapshot_ref = &snapshot;
        stream::iter(targets)
            .for_each_concurrent(MAX_PARALLEL_DELIVERIES, |(id, observer)| async move {
                let delivery =
                    tokio::time::timeout(timeout, observer.on_progress(Arc::clone(snapshot_ref)))
                        .await;
                match delivery {
                    Ok(Delivery::Accepted) => {}
                    Ok(Delivery::Closed) => {
                        debug!(handle = id, "progress observer closed, unsubscribing");
                        self.observers.remove(&id);
                    }
                    Err(_) => {
                        warn!(
                            handle = id,
                            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            "progress observer too slow, dropping it"
                        );
                        self.observers.remove(&id);
                    }
                }
            })
            .await;

        snapshot
    }

    /// Spawns the fixed-interval tick loop; it stops when `shutdown` is cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        broadcaster.tick().await;
                    }
                }
            }
            debug!("progress loop stopped");
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn rate(bytes: u64, elapsed: Duration) -> u64 {
    (bytes as f64 / elapsed.as_secs_f64()) as u64
}
