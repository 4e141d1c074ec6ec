//! Observer seam and the channel-backed observer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ProgressSnapshot;

/// What happened to a delivered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The observer took the snapshot.
    Accepted,
    /// The observer is gone and should be unregistered.
    Closed,
}

/// Receives a snapshot at every progress tick.
///
/// Implementations must return promptly; the broadcaster drops observers that
/// exceed the configured timeout.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    /// Called once per tick with a shared, immutable snapshot.
    async fn on_progress(&self, snapshot: Arc<ProgressSnapshot>) -> Delivery;
}

/// Opaque registration handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(pub(crate) u64);

/// Forwards snapshots into a bounded channel.
///
/// A full channel blocks delivery until the broadcaster's timeout drops the
/// observer; a dropped receiver unregisters it on the next tick.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::Sender<Arc<ProgressSnapshot>>,
}

impl ChannelObserver {
    /// Wraps a sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Arc<ProgressSnapshot>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ProgressObserver for ChannelObserver {
    async fn on_progress(&self, snapshot: Arc<ProgressSnapshot>) -> Delivery {
        match self.tx.send(snapshot).await {
            Ok(()) => Delivery::Accepted,
            Err(_) => Delivery::Closed,
        }
    }
}
