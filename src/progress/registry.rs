//! Live, lock-light view of running downloads.
//!
//! Workers bump one atomic counter per segment; the progress tick reads them
//! without touching the coordinator's model locks or the database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

use super::DownloadProgress;
use crate::model::{DownloadModel, DownloadStatus};

#[derive(Debug, Clone)]
struct LiveMeta {
    display_name: String,
    status: DownloadStatus,
    total_size_bytes: Option<u64>,
    segments_done: usize,
}

/// Live counters of one running download.
#[derive(Debug)]
pub struct LiveDownload {
    id: i64,
    meta: RwLock<LiveMeta>,
    counters: RwLock<Vec<Arc<AtomicU64>>>,
}

impl LiveDownload {
    fn new(model: &DownloadModel) -> Self {
        let live = Self {
            id: model.id,
            meta: RwLock::new(LiveMeta {
                display_name: model.display_name.clone(),
                status: model.status,
                total_size_bytes: model.total_size_bytes,
                segments_done: 0,
            }),
            counters: RwLock::new(Vec::new()),
        };
        live.sync_plan(model);
        live
    }

    /// Download id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Rebuilds the per-segment counters from the model's plan.
    pub fn sync_plan(&self, model: &DownloadModel) {
        let counters = model
            .segments
            .iter()
            .map(|s| Arc::new(AtomicU64::new(s.bytes_written)))
            .collect();
        *self.counters.write().unwrap_or_else(PoisonError::into_inner) = counters;
        self.sync_meta(model);
    }

    /// Copies status, size and done count from the model.
    pub fn sync_meta(&self, model: &DownloadModel) {
        let mut meta = self.meta.write().unwrap_or_else(PoisonError::into_inner);
        meta.status = model.status;
        meta.total_size_bytes = model.total_size_bytes;
        meta.segments_done = model.segments.iter().filter(|s| s.is_done()).count();
    }

    /// Counter of segment `index`, if the plan has one.
    #[must_use]
    pub fn counter(&self, index: u32) -> Option<Arc<AtomicU64>> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        usize::try_from(index)
            .ok()
            .and_then(|i| counters.get(i))
            .cloned()
    }

    /// Sum of all segment counters.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Current progress; throughput is filled in by the broadcaster.
    #[must_use]
    pub fn progress(&self) -> DownloadProgress {
        let meta = self.meta.read().unwrap_or_else(PoisonError::into_inner).clone();
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        DownloadProgress {
            id: self.id,
            display_name: meta.display_name,
            status: meta.status,
            bytes_written: counters.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            total_size_bytes: meta.total_size_bytes,
            segments_done: meta.segments_done,
            segments_total: counters.len(),
            bytes_per_second: 0,
        }
    }
}

/// Registry of running downloads, keyed by id.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    downloads: DashMap<i64, Arc<LiveDownload>>,
}

impl ProgressRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the live entry of a download.
    pub fn register(&self, model: &DownloadModel) -> Arc<LiveDownload> {
        let live = Arc::new(LiveDownload::new(model));
        self.downloads.insert(model.id, Arc::clone(&live));
        live
    }

    /// Drops the live entry; no-op when absent.
    pub fn remove(&self, id: i64) {
        self.downloads.remove(&id);
    }

    /// Live entry of a download.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<Arc<LiveDownload>> {
        self.downloads.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// All live entries ordered by id.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<LiveDownload>> {
        let mut entries: Vec<_> = self
            .downloads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        entries.sort_by_key(|live| live.id);
        entries
    }

    /// Number of running downloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    /// True when nothing is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}
