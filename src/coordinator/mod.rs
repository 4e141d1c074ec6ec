//! Top-level scheduler: admission, lifecycle commands and retry orchestration.
//!
//! A single [`Coordinator`] is built at process start and handed to whatever
//! drives it (CLI, UI, tests). It admits queued downloads highest priority
//! first and FIFO within a priority, never running more than
//! `max_concurrent_downloads` at once. Segment tasks of all admitted downloads
//! share one worker pool of `max_concurrent_downloads * max_segments_per_download`
//! permits.
//!
//! # Concurrency Model
//!
//! - Every admitted download runs as one task holding a [`CancellationToken`];
//!   its segment tasks hold child tokens
//! - `pause`, `cancel`, `delete` and `shutdown` signal the token and wait for the
//!   task to acknowledge (bounded by `cancel_ack_timeout`, then aborted) before
//!   the admission slot is released
//! - Settings are read fresh at every admission decision; a settings change
//!   wakes the scheduler and resizes the worker pool
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use segfetch_core::config::{EngineSettings, SettingsHandle};
//! use segfetch_core::coordinator::{Coordinator, DownloadRequest};
//! use segfetch_core::download::HttpClient;
//! use segfetch_core::store::Store;
//!
//! let settings = SettingsHandle::new(EngineSettings::with_destination_root("downloads"))?;
//! let coordinator = Coordinator::builder(Arc::new(store), HttpClient::new()?, settings).build();
//! coordinator.recover().await?;
//! coordinator.spawn();
//! coordinator.submit(DownloadRequest::new("https://example.com/video.mp4")).await?;
//! coordinator.wait_idle().await;
//! coordinator.shutdown().await;
//! ```

mod admission;
mod error;
mod job;
mod stats;

pub use error::CoordinatorError;
pub use stats::RunSummary;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{AlwaysUnmetered, NetworkPolicy, SettingsHandle};
use crate::download::filename::{choose_filename, resolve_unique_path};
use crate::download::{
    FailureKind, HttpClient, PlanConfig, RetryPolicy, SegmentPlanner, remove_segment_files,
};
use crate::model::{DownloadModel, DownloadStatus, NewDownload, SegmentState};
use crate::progress::{
    ObserverHandle, ProgressBroadcaster, ProgressObserver, ProgressRegistry, ProgressSnapshot,
};
use crate::store::DownloadRepository;
use admission::AdmissionQueue;
use job::Job;
use stats::RunStats;

/// How often a deferred queue re-polls the network policy.
const NETWORK_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// What a resolver hands to [`Coordinator::submit`].
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    /// Absolute http(s) URL of the entity.
    pub source_url: String,
    /// File name proposed by the resolver; the URL path is used otherwise.
    pub suggested_file_name: Option<String>,
    /// Size announced by the resolver, cross-checked against the probe.
    pub expected_size: Option<u64>,
    /// Higher is admitted first.
    pub priority: i64,
    /// Hex SHA-256 the merged file must match.
    pub expected_sha256: Option<String>,
}

impl DownloadRequest {
    /// Request for `source_url` with default priority.
    #[must_use]
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    /// Sets the suggested file name.
    #[must_use]
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.suggested_file_name = Some(name.into());
        self
    }

    /// Sets the admission priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the announced size.
    #[must_use]
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Sets the expected SHA-256 digest.
    #[must_use]
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }
}

/// Assembles a [`Coordinator`].
pub struct CoordinatorBuilder {
    repo: Arc<dyn DownloadRepository>,
    client: HttpClient,
    settings: SettingsHandle,
    network: Arc<dyn NetworkPolicy>,
    retry: RetryPolicy,
}

impl CoordinatorBuilder {
    /// Replaces the default always-unmetered network policy.
    #[must_use]
    pub fn network_policy(mut self, network: Arc<dyn NetworkPolicy>) -> Self {
        self.network = network;
        self
    }

    /// Replaces the default retry policy; `max_attempts` still comes from settings.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the coordinator. Nothing is admitted until [`Coordinator::spawn`].
    #[must_use]
    pub fn build(self) -> Coordinator {
        let current = self.settings.current();
        let registry = Arc::new(ProgressRegistry::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new(
            Arc::clone(&registry),
            current.observer_timeout,
        ));
        let pool_size = current.worker_pool_size();

        Coordinator {
            inner: Arc::new(Inner {
                repo: self.repo,
                client: self.client,
                settings: self.settings,
                network: self.network,
                retry: self.retry,
                registry,
                broadcaster,
                schedule: Mutex::new(Schedule {
                    queue: AdmissionQueue::default(),
                    active: HashMap::new(),
                    pool_size,
                    started: false,
                }),
                pool: Arc::new(Semaphore::new(pool_size)),
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                commands: tokio::sync::Mutex::new(()),
                background: Mutex::new(Vec::new()),
                stats: Arc::new(RunStats::default()),
                next_run: AtomicU64::new(1),
            }),
        }
    }
}

/// The download scheduler. Cloning is cheap and shares the same instance.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schedule = self.inner.lock_schedule();
        f.debug_struct("Coordinator")
            .field("queued", &schedule.queue.len())
            .field("active", &schedule.active.len())
            .field("pool_size", &schedule.pool_size)
            .finish_non_exhaustive()
    }
}

struct Inner {
    repo: Arc<dyn DownloadRepository>,
    client: HttpClient,
    settings: SettingsHandle,
    network: Arc<dyn NetworkPolicy>,
    retry: RetryPolicy,
    registry: Arc<ProgressRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    schedule: Mutex<Schedule>,
    pool: Arc<Semaphore>,
    wake: Notify,
    idle: Notify,
    shutdown: CancellationToken,
    /// Serializes lifecycle commands so two commands never stop the same task.
    commands: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<RunStats>,
    next_run: AtomicU64,
}

struct Schedule {
    queue: AdmissionQueue,
    active: HashMap<i64, ActiveDownload>,
    pool_size: usize,
    started: bool,
}

struct ActiveDownload {
    run_id: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    /// Set by a command that will release the slot itself.
    stopping: bool,
}

impl Coordinator {
    /// Starts building a coordinator over a repository, client and settings.
    #[must_use]
    pub fn builder(
        repo: Arc<dyn DownloadRepository>,
        client: HttpClient,
        settings: SettingsHandle,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            repo,
            client,
            settings,
            network: Arc::new(AlwaysUnmetered),
            retry: RetryPolicy::default(),
        }
    }

    /// Live settings; updates take effect at the next admission decision.
    #[must_use]
    pub fn settings(&self) -> &SettingsHandle {
        &self.inner.settings
    }

    /// The progress broadcaster fed by this coordinator.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.inner.broadcaster
    }

    /// Registers a progress observer.
    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) -> ObserverHandle {
        self.inner.broadcaster.subscribe(observer)
    }

    /// Registers a bounded progress channel.
    pub fn subscribe_channel(
        &self,
        capacity: usize,
    ) -> (ObserverHandle, mpsc::Receiver<Arc<ProgressSnapshot>>) {
        self.inner.broadcaster.subscribe_channel(capacity)
    }

    /// Unregisters an observer; safe to call repeatedly.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        self.inner.broadcaster.unsubscribe(handle)
    }

    /// Counters since the coordinator was built.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        self.inner.stats.summary()
    }

    /// Starts the scheduler and the progress loop. Idempotent.
    pub fn spawn(&self) {
        {
            let mut schedule = self.inner.lock_schedule();
            if schedule.started || self.inner.shutdown.is_cancelled() {
                return;
            }
            schedule.started = true;
        }

        let settings = self.inner.settings.current();
        let scheduler = tokio::spawn(Arc::clone(&self.inner).schedule_loop());
        let ticker = self
            .inner
            .broadcaster
            .spawn(settings.progress_interval, self.inner.shutdown.child_token());

        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([scheduler, ticker]);
        info!(
            max_concurrent_downloads = settings.max_concurrent_downloads,
            pool_size = settings.worker_pool_size(),
            "coordinator started"
        );
    }

    /// Loads the store at startup and queues every Queued download.
    ///
    /// Interrupted downloads come back as Queued and go through admission again.
    /// Call once, before [`Coordinator::spawn`].
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Store`] if the store cannot be read.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<DownloadModel>, CoordinatorError> {
        let models = self.inner.repo.load_all().await?;
        let mut queued = 0usize;
        {
            let mut schedule = self.inner.lock_schedule();
            for model in models.iter().filter(|m| m.status == DownloadStatus::Queued) {
                if schedule.queue.push(model.id, model.priority) {
                    queued += 1;
                }
            }
        }
        self.inner.wake.notify_one();
        info!(total = models.len(), queued, "downloads recovered");
        Ok(models)
    }

    /// Creates a Queued download and enqueues it.
    ///
    /// The destination is `<destination_root>/<name>`, where the name comes from
    /// the suggestion or the URL and gets a numeric suffix if another download
    /// already owns it.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidUrl`] for non-http(s) URLs,
    /// [`CoordinatorError::InvalidChecksum`] for a malformed digest and
    /// [`CoordinatorError::Store`] if the record cannot be created.
    #[instrument(skip(self, request), fields(url = %request.source_url))]
    pub async fn submit(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadModel, CoordinatorError> {
        self.inner.ensure_running()?;

        let url = Url::parse(&request.source_url)
            .map_err(|e| CoordinatorError::invalid_url(&request.source_url, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoordinatorError::invalid_url(
                &request.source_url,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        let expected_sha256 = request
            .expected_sha256
            .as_deref()
            .map(normalize_sha256)
            .transpose()?;

        let _guard = self.inner.commands.lock().await;
        let settings = self.inner.settings.current();
        let file_name = choose_filename(request.suggested_file_name.as_deref(), &url);
        let reserved: HashSet<PathBuf> = self
            .inner
            .repo
            .list_all()
            .await?
            .into_iter()
            .filter(|m| m.status != DownloadStatus::Cancelled)
            .map(|m| m.destination_path)
            .collect();
        let destination_path =
            resolve_unique_path(&settings.destination_root, &file_name, |p| reserved.contains(p));
        let display_name = destination_path
            .file_name()
            .map_or(file_name, |n| n.to_string_lossy().into_owned());

        let model = self
            .inner
            .repo
            .create(&NewDownload {
                source_url: url.to_string(),
                destination_path,
                display_name,
                priority: request.priority,
                expected_size: request.expected_size,
                expected_sha256,
            })
            .await?;

        self.inner.enqueue(model.id, model.priority);
        info!(
            download_id = model.id,
            destination = %model.destination_path.display(),
            priority = model.priority,
            "download submitted"
        );
        Ok(model)
    }

    /// Queues a Paused download again (or makes sure a Queued one is queued).
    ///
    /// Running downloads are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidState`] for Completed, Cancelled and
    /// Failed downloads (use [`Coordinator::retry`] for the latter).
    #[instrument(skip(self))]
    pub async fn start(&self, id: i64) -> Result<(), CoordinatorError> {
        self.inner.ensure_running()?;
        let _guard = self.inner.commands.lock().await;
        let mut model = self.inner.load(id).await?;

        match model.status {
            DownloadStatus::Queued => {
                if !self.inner.is_scheduled(id) {
                    self.inner.enqueue(id, model.priority);
                }
            }
            DownloadStatus::Paused => {
                model.status = DownloadStatus::Queued;
                reset_interrupted(&mut model);
                self.inner.repo.save(&model).await?;
                self.inner.enqueue(id, model.priority);
                info!(download_id = id, bytes = model.bytes_written(), "download resumed");
            }
            DownloadStatus::Probing | DownloadStatus::Active | DownloadStatus::Merging => {
                debug!(download_id = id, status = %model.status, "download already running");
            }
            status => {
                return Err(CoordinatorError::invalid_state(id, status, DownloadStatus::Queued));
            }
        }
        Ok(())
    }

    /// Stops a queued or running download, keeping its progress.
    ///
    /// Running segment workers stop at their next chunk boundary; the admission
    /// slot is released once they have acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidState`] if the download is merging or
    /// already finished.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: i64) -> Result<(), CoordinatorError> {
        let _guard = self.inner.commands.lock().await;
        let current = self.inner.load(id).await?;
        if current.status == DownloadStatus::Paused {
            return Ok(());
        }
        if !current.status.can_transition_to(DownloadStatus::Paused) {
            return Err(CoordinatorError::invalid_state(
                id,
                current.status,
                DownloadStatus::Paused,
            ));
        }

        self.inner.dequeue(id);
        let was_active = self.inner.stop_active(id).await;
        let result = self.inner.settle_paused(id).await;
        if was_active {
            self.inner.release(id);
        }
        result
    }

    /// Stops a download and removes its temp files and partial output.
    ///
    /// All files are gone before the admission slot is freed. The record stays
    /// visible as Cancelled until deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidState`] if the download has completed.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> Result<(), CoordinatorError> {
        let _guard = self.inner.commands.lock().await;
        let current = self.inner.load(id).await?;
        match current.status {
            DownloadStatus::Cancelled => return Ok(()),
            DownloadStatus::Completed => {
                return Err(CoordinatorError::invalid_state(
                    id,
                    DownloadStatus::Completed,
                    DownloadStatus::Cancelled,
                ));
            }
            _ => {}
        }

        self.inner.dequeue(id);
        let was_active = self.inner.stop_active(id).await;
        let result = self.inner.settle_cancelled(id).await;
        if was_active {
            self.inner.release(id);
        }
        if result.is_ok() {
            self.inner.stats.increment_cancelled();
            info!(download_id = id, "download cancelled");
        }
        result
    }

    /// Queues a Failed download again.
    ///
    /// Finished segments are kept; an integrity failure discards the plan and
    /// its temp files so the next run probes and fetches from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidState`] unless the download is Failed.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: i64) -> Result<(), CoordinatorError> {
        self.inner.ensure_running()?;
        let _guard = self.inner.commands.lock().await;
        let mut model = self.inner.load(id).await?;
        if model.status != DownloadStatus::Failed {
            return Err(CoordinatorError::invalid_state(id, model.status, DownloadStatus::Queued));
        }

        if model.last_error_kind == Some(FailureKind::ChecksumMismatch) {
            info!(download_id = id, "integrity failure, discarding segment plan");
            remove_segment_files(&model).await;
            model.discard_plan();
        }
        for segment in &mut model.segments {
            if segment.state != SegmentState::Done {
                segment.state = SegmentState::Pending;
            }
        }
        model.clear_error();
        model.status = DownloadStatus::Queued;
        self.inner.repo.save(&model).await?;
        self.inner.enqueue(id, model.priority);
        info!(download_id = id, attempts = model.attempt_count, "download retried");
        Ok(())
    }

    /// Stops any work, removes temp files and deletes the record.
    ///
    /// The destination file of a completed download is kept.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotFound`] if there is no such download.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), CoordinatorError> {
        let _guard = self.inner.commands.lock().await;
        let model = self.inner.load(id).await?;

        self.inner.dequeue(id);
        let was_active = self.inner.stop_active(id).await;
        let model = match self.inner.repo.load(id).await {
            Ok(Some(latest)) => latest,
            Ok(None) | Err(_) => model,
        };
        discard_artifacts(&model).await;
        let result = self.inner.repo.delete(id).await;
        if was_active {
            self.inner.release(id);
        }
        result?;
        info!(download_id = id, "download deleted");
        Ok(())
    }

    /// Every download in admission order, with live byte counts for running ones.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Store`] if the store cannot be read.
    pub async fn snapshot(&self) -> Result<Vec<DownloadModel>, CoordinatorError> {
        let mut models = self.inner.repo.list_all().await?;
        for model in &mut models {
            let Some(live) = self.inner.registry.get(model.id) else {
                continue;
            };
            for segment in model.segments.iter_mut().filter(|s| !s.is_done()) {
                if let Some(counter) = live.counter(segment.index) {
                    segment.bytes_written = counter.load(Ordering::Relaxed);
                }
            }
        }
        Ok(models)
    }

    /// Wakes the scheduler after the network link changed.
    pub fn network_changed(&self) {
        self.inner.wake.notify_one();
    }

    /// Resolves once nothing is queued or running (or after shutdown).
    ///
    /// Downloads deferred by `wifi_only` on a metered link keep this pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the scheduler and every running download.
    ///
    /// Running downloads are checkpointed and left Queued so the next
    /// [`Coordinator::recover`] picks them up. The progress loop stops too.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let running: Vec<(i64, Option<JoinHandle<()>>)> = {
            let mut schedule = self.inner.lock_schedule();
            schedule
                .active
                .iter_mut()
                .map(|(id, active)| {
                    active.stopping = true;
                    (*id, active.handle.take())
                })
                .collect()
        };
        self.inner.shutdown.cancel();

        for (id, handle) in running {
            if let Some(handle) = handle {
                self.inner.await_ack(id, handle).await;
            }
            self.inner.requeue_interrupted(id).await;
            self.inner.registry.remove(id);
        }
        self.inner.lock_schedule().active.clear();

        let background: Vec<JoinHandle<()>> = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.inner.idle.notify_waiters();
        info!(summary = ?self.summary(), "coordinator shut down");
    }
}

impl Inner {
    fn lock_schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), CoordinatorError> {
        if self.shutdown.is_cancelled() {
            Err(CoordinatorError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn load(&self, id: i64) -> Result<DownloadModel, CoordinatorError> {
        self.repo
            .load(id)
            .await?
            .ok_or(CoordinatorError::NotFound(id))
    }

    fn enqueue(&self, id: i64, priority: i64) {
        self.lock_schedule().queue.push(id, priority);
        self.wake.notify_one();
    }

    fn dequeue(&self, id: i64) -> bool {
        let removed = self.lock_schedule().queue.remove(id);
        if removed {
            debug!(download_id = id, "removed from admission queue");
            self.notify_if_idle();
        }
        removed
    }

    fn is_scheduled(&self, id: i64) -> bool {
        let schedule = self.lock_schedule();
        schedule.queue.contains(id) || schedule.active.contains_key(&id)
    }

    fn is_idle(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        let schedule = self.lock_schedule();
        schedule.queue.is_empty() && schedule.active.is_empty()
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    async fn schedule_loop(self: Arc<Self>) {
        let mut settings_rx = self.settings.subscribe();
        loop {
            self.admit_ready();
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.wake.notified() => {}
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("settings changed, re-evaluating admission");
                }
                () = tokio::time::sleep(NETWORK_RECHECK_INTERVAL) => {}
            }
        }
        debug!("scheduler stopped");
    }

    /// Admits queued downloads until the concurrency cap is reached.
    fn admit_ready(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let settings = self.settings.current();
        let mut schedule = self.lock_schedule();
        self.resize_pool(&mut schedule, settings.worker_pool_size());

        if settings.wifi_only && !self.network.is_unmetered() {
            if !schedule.queue.is_empty() {
                debug!(queued = schedule.queue.len(), "link is metered, admission deferred");
            }
            return;
        }

        let limit = usize::try_from(settings.max_concurrent_downloads).unwrap_or(usize::MAX);
        while schedule.active.len() < limit {
            let Some(id) = schedule.queue.pop() else {
                break;
            };
            let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
            let cancel = self.shutdown.child_token();
            let task = Arc::clone(self).drive(id, run_id, cancel.clone());
            let handle = tokio::spawn(task);
            schedule.active.insert(
                id,
                ActiveDownload {
                    run_id,
                    cancel,
                    handle: Some(handle),
                    stopping: false,
                },
            );
            info!(download_id = id, active = schedule.active.len(), limit, "download admitted");
        }
    }

    /// Grows or shrinks the shared worker pool to `target` permits.
    fn resize_pool(&self, schedule: &mut Schedule, target: usize) {
        let current = schedule.pool_size;
        if target > current {
            self.pool.add_permits(target - current);
        } else if target < current {
            let Ok(shrink) = u32::try_from(current - target) else {
                return;
            };
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                if let Ok(permits) = pool.acquire_many_owned(shrink).await {
                    permits.forget();
                }
            });
        } else {
            return;
        }
        debug!(from = current, to = target, "worker pool resized");
        schedule.pool_size = target;
    }

    /// Body of one admitted download task.
    async fn drive(self: Arc<Self>, id: i64, run_id: u64, cancel: CancellationToken) {
        let outcome = match self.repo.load(id).await {
            Ok(Some(model)) if model.status == DownloadStatus::Queued => {
                let settings = self.settings.current();
                let live = self.registry.register(&model);
                let job = Job {
                    repo: Arc::clone(&self.repo),
                    client: self.client.clone(),
                    planner: SegmentPlanner::new(
                        self.client.clone(),
                        PlanConfig {
                            max_segments: settings.max_segments_per_download,
                            min_segment_size: settings.min_segment_size,
                            temp_root: settings.temp_root(),
                        },
                    ),
                    retry: self.retry.with_max_attempts(settings.max_attempts),
                    pool: Arc::clone(&self.pool),
                    max_segments: usize::try_from(settings.max_segments_per_download)
                        .unwrap_or(usize::MAX),
                    live,
                    cancel,
                    stats: Arc::clone(&self.stats),
                };
                Some(job.run(model).await)
            }
            Ok(Some(model)) => {
                debug!(
                    download_id = id,
                    status = %model.status,
                    "download no longer queued, skipping"
                );
                None
            }
            Ok(None) => {
                debug!(download_id = id, "download vanished before admission");
                None
            }
            Err(e) => {
                warn!(download_id = id, error = %e, "failed to load admitted download");
                None
            }
        };
        debug!(download_id = id, ?outcome, "download task finished");
        self.finish_run(id, run_id);
    }

    /// Frees the slot of a task that ended on its own.
    fn finish_run(&self, id: i64, run_id: u64) {
        let owned = {
            let mut schedule = self.lock_schedule();
            let owned = schedule
                .active
                .get(&id)
                .is_some_and(|a| a.run_id == run_id && !a.stopping);
            if owned {
                schedule.active.remove(&id);
            }
            owned
        };
        if owned {
            self.registry.remove(id);
            self.wake.notify_one();
            self.notify_if_idle();
        }
    }

    /// Frees the slot of a task stopped by a command.
    fn release(&self, id: i64) {
        self.lock_schedule().active.remove(&id);
        self.registry.remove(id);
        self.wake.notify_one();
        self.notify_if_idle();
    }

    /// Cancels the task of `id` and waits for it; returns whether one was running.
    ///
    /// The slot stays reserved until [`Inner::release`].
    async fn stop_active(&self, id: i64) -> bool {
        let (cancel, handle) = {
            let mut schedule = self.lock_schedule();
            let Some(active) = schedule.active.get_mut(&id) else {
                return false;
            };
            active.stopping = true;
            (active.cancel.clone(), active.handle.take())
        };
        cancel.cancel();
        if let Some(handle) = handle {
            self.await_ack(id, handle).await;
        }
        true
    }

    async fn await_ack(&self, id: i64, mut handle: JoinHandle<()>) {
        let timeout = self.settings.current().cancel_ack_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => debug!(download_id = id, "download task acknowledged stop"),
            Ok(Err(e)) => warn!(download_id = id, error = %e, "download task ended abnormally"),
            Err(_) => {
                warn!(
                    download_id = id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "download task did not stop in time, aborting"
                );
                handle.abort();
                if let Err(e) = handle.await
                    && !e.is_cancelled()
                {
                    warn!(download_id = id, error = %e, "aborted download task ended abnormally");
                }
            }
        }
    }

    async fn settle_paused(&self, id: i64) -> Result<(), CoordinatorError> {
        let mut model = self.load(id).await?;
        reset_interrupted(&mut model);
        if model.status.can_transition_to(DownloadStatus::Paused) {
            model.status = DownloadStatus::Paused;
            self.repo.save(&model).await?;
            info!(download_id = id, bytes = model.bytes_written(), "download paused");
            Ok(())
        } else if model.status.is_running() {
            warn!(
                download_id = id,
                status = %model.status,
                "download was merging, queued again instead of paused"
            );
            model.status = DownloadStatus::Queued;
            self.repo.save(&model).await?;
            self.lock_schedule().queue.push(id, model.priority);
            Ok(())
        } else {
            Err(CoordinatorError::invalid_state(id, model.status, DownloadStatus::Paused))
        }
    }

    async fn settle_cancelled(&self, id: i64) -> Result<(), CoordinatorError> {
        let mut model = self.load(id).await?;
        if model.status == DownloadStatus::Completed {
            return Err(CoordinatorError::invalid_state(
                id,
                DownloadStatus::Completed,
                DownloadStatus::Cancelled,
            ));
        }
        discard_artifacts(&model).await;
        reset_interrupted(&mut model);
        for segment in &mut model.segments {
            segment.bytes_written = 0;
            segment.state = SegmentState::Pending;
        }
        model.status = DownloadStatus::Cancelled;
        self.repo.save(&model).await?;
        Ok(())
    }

    /// Puts an interrupted download back to Queued after shutdown stopped it.
    async fn requeue_interrupted(&self, id: i64) {
        let mut model = match self.repo.load(id).await {
            Ok(Some(model)) => model,
            Ok(None) => return,
            Err(e) => {
                warn!(download_id = id, error = %e, "failed to load interrupted download");
                return;
            }
        };
        if !model.status.is_running() {
            return;
        }
        model.status = DownloadStatus::Queued;
        reset_interrupted(&mut model);
        if let Err(e) = self.repo.save(&model).await {
            warn!(download_id = id, error = %e, "failed to requeue interrupted download");
        } else {
            debug!(
                download_id = id,
                bytes = model.bytes_written(),
                "interrupted download requeued"
            );
        }
    }
}

/// Segments left InProgress by a stopped run become Pending.
fn reset_interrupted(model: &mut DownloadModel) {
    for segment in &mut model.segments {
        if segment.state == SegmentState::InProgress {
            segment.state = SegmentState::Pending;
        }
    }
}

/// Removes segment temp files and the partial merge output.
async fn discard_artifacts(model: &DownloadModel) {
    remove_segment_files(model).await;
    let part = model.part_path();
    if let Err(e) = tokio::fs::remove_file(&part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %part.display(), error = %e, "failed to remove partial merge output");
    }
}

fn normalize_sha256(value: &str) -> Result<String, CoordinatorError> {
    let digest = value.trim().to_ascii_lowercase();
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(digest)
    } else {
        Err(CoordinatorError::InvalidChecksum {
            value: value.to_string(),
        })
    }
}
