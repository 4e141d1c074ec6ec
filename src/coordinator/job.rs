//! One admitted download: probe, segment fan-out with retries, merge.
//!
//! The job owns the model for the duration of the run and is its only writer.
//! Segment tasks report back through their join results; the job folds them
//! into the model and checkpoints it after every state change.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::stats::RunStats;
use crate::download::{
    DownloadError, FailureKind, HttpClient, MergeReport, RetryDecision, RetryPolicy,
    SegmentOutcome, SegmentPlanner, SegmentWorker, adopt_merged_output, merge,
    reconcile_segment_files, remove_segment_files,
};
use crate::model::{DownloadModel, DownloadStatus, Segment, SegmentState};
use crate::progress::LiveDownload;
use crate::store::{DownloadRepository, StoreError};

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed,
    Failed,
    /// Cancelled by a command or shutdown; the caller decides the next status.
    Stopped,
}

enum Step {
    Continue,
    Stop(JobOutcome),
}

pub(crate) struct Job {
    pub(crate) repo: Arc<dyn DownloadRepository>,
    pub(crate) client: HttpClient,
    pub(crate) planner: SegmentPlanner,
    pub(crate) retry: RetryPolicy,
    pub(crate) pool: Arc<Semaphore>,
    pub(crate) max_segments: usize,
    pub(crate) live: Arc<LiveDownload>,
    pub(crate) cancel: CancellationToken,
    pub(crate) stats: Arc<RunStats>,
}

impl Job {
    #[instrument(skip_all, fields(download_id = model.id))]
    pub(crate) async fn run(self, mut model: DownloadModel) -> JobOutcome {
        match self.execute(&mut model).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "could not persist download state, failing run");
                model.status = DownloadStatus::Failed;
                model.record_error(FailureKind::Storage, e.to_string());
                self.live.sync_meta(&model);
                if let Err(e) = self.repo.save(&model).await {
                    warn!(error = %e, "failed download could not be recorded either");
                }
                self.stats.increment_failed();
                JobOutcome::Failed
            }
        }
    }

    async fn execute(&self, model: &mut DownloadModel) -> Result<JobOutcome, StoreError> {
        if self.cancel.is_cancelled() {
            return Ok(JobOutcome::Stopped);
        }

        if model.is_planned() && !model.has_valid_coverage() {
            warn!("persisted segment plan is inconsistent, probing again");
            remove_segment_files(model).await;
            model.discard_plan();
        }

        match adopt_merged_output(model).await {
            Ok(Some(report)) => return self.complete(model, &report).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not inspect existing destination"),
        }
        if model.is_planned() && reconcile_segment_files(model).await > 0 {
            self.repo.save(model).await?;
            self.live.sync_plan(model);
        }

        if !model.is_planned() {
            self.transition(model, DownloadStatus::Probing).await?;
            if let Step::Stop(outcome) = self.probe(model).await? {
                return Ok(outcome);
            }
            self.live.sync_plan(model);
        }

        self.transition(model, DownloadStatus::Active).await?;
        if let Step::Stop(outcome) = self.fetch_segments(model).await? {
            return Ok(outcome);
        }

        if self.cancel.is_cancelled() {
            return Ok(JobOutcome::Stopped);
        }
        self.transition(model, DownloadStatus::Merging).await?;
        match merge(model).await {
            Ok(report) => self.complete(model, &report).await,
            Err(e) => {
                self.repo.save(model).await?;
                self.live.sync_meta(model);
                self.stats.increment_failed();
                warn!(error = %e, "download failed during merge");
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Records Completed, then deletes the segment files it no longer needs.
    async fn complete(
        &self,
        model: &mut DownloadModel,
        report: &MergeReport,
    ) -> Result<JobOutcome, StoreError> {
        self.repo.save(model).await?;
        self.live.sync_meta(model);
        remove_segment_files(model).await;
        self.stats.increment_completed();
        info!(
            destination = %report.destination.display(),
            bytes = report.bytes,
            attempts = model.attempt_count,
            "download completed"
        );
        Ok(JobOutcome::Completed)
    }

    async fn transition(
        &self,
        model: &mut DownloadModel,
        status: DownloadStatus,
    ) -> Result<(), StoreError> {
        debug!(from = %model.status, to = %status, "status change");
        model.status = status;
        self.repo.save(model).await?;
        self.live.sync_meta(model);
        Ok(())
    }

    /// Probes the source, retrying transient failures.
    async fn probe(&self, model: &mut DownloadModel) -> Result<Step, StoreError> {
        let url = model.source_url.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let probed = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(Step::Stop(JobOutcome::Stopped)),
                probed = self.client.probe(&url) => probed,
            };

            let error = match probed {
                Ok(result) => {
                    self.planner.apply(model, result);
                    self.repo.save(model).await?;
                    return Ok(Step::Continue);
                }
                Err(error) => error,
            };

            model.attempt_count += 1;
            match self.retry.should_retry(&error, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    self.stats.increment_retried();
                    info!(
                        attempt = next_attempt,
                        max_attempts = self.retry.max_attempts(),
                        delay_ms = millis(delay),
                        error = %error,
                        "retrying probe"
                    );
                    self.repo.save(model).await?;
                    if !sleep_or_cancel(&self.cancel, delay).await {
                        return Ok(Step::Stop(JobOutcome::Stopped));
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, "not retrying probe");
                    let outcome = self.fail(model, error.kind(), error.to_string()).await?;
                    return Ok(Step::Stop(outcome));
                }
            }
        }
    }

    /// Runs every unfinished segment on the shared pool and folds the results
    /// into the model.
    async fn fetch_segments(&self, model: &mut DownloadModel) -> Result<Step, StoreError> {
        let pending: Vec<u32> = model
            .segments
            .iter()
            .filter(|s| !s.is_done())
            .map(|s| s.index)
            .collect();
        if pending.is_empty() {
            return Ok(Step::Continue);
        }

        for segment in &mut model.segments {
            if !segment.is_done() {
                segment.state = SegmentState::InProgress;
            }
        }
        self.repo.save(model).await?;

        let worker = SegmentWorker::new(
            self.client.clone(),
            model.source_url.clone(),
            model.supports_range_requests,
            model.total_size_bytes,
        );
        let per_download = Arc::new(Semaphore::new(self.max_segments.max(1)));
        let segments_cancel = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        for segment in model.segments.iter().filter(|s| !s.is_done()) {
            let task = SegmentTask {
                worker: worker.clone(),
                segment: segment.clone(),
                counter: self
                    .live
                    .counter(segment.index)
                    .unwrap_or_else(|| Arc::new(AtomicU64::new(segment.bytes_written))),
                cancel: segments_cancel.clone(),
                per_download: Arc::clone(&per_download),
                pool: Arc::clone(&self.pool),
                retry: self.retry.clone(),
                stats: Arc::clone(&self.stats),
            };
            tasks.spawn(task.run());
        }
        debug!(segments = pending.len(), "segment tasks started");

        let mut failure: Option<(FailureKind, String)> = None;
        while let Some(joined) = tasks.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "segment task ended abnormally");
                    if failure.is_none() {
                        segments_cancel.cancel();
                        failure =
                            Some((FailureKind::Internal, format!("segment task failed: {e}")));
                    }
                    continue;
                }
            };

            model.attempt_count += report.failures;
            let Some(segment) = model.segments.iter_mut().find(|s| s.index == report.index) else {
                continue;
            };
            match report.result {
                SegmentResult::Done(bytes) => {
                    segment.bytes_written = bytes;
                    segment.state = SegmentState::Done;
                    if segment.range_end.is_none() {
                        segment.range_end = Some(segment.range_start + bytes);
                        model.total_size_bytes = Some(segment.range_start + bytes);
                    }
                    self.repo.save(model).await?;
                    self.live.sync_meta(model);
                }
                SegmentResult::Stopped(bytes) => {
                    segment.bytes_written = bytes;
                    segment.state = SegmentState::Pending;
                }
                SegmentResult::Failed(error, bytes) => {
                    segment.bytes_written = bytes;
                    segment.state = SegmentState::Failed;
                    if failure.is_none() {
                        segments_cancel.cancel();
                        failure = Some((error.kind(), error.to_string()));
                    }
                }
            }
        }

        for segment in &mut model.segments {
            if segment.state == SegmentState::InProgress {
                segment.state = SegmentState::Pending;
                if let Some(counter) = self.live.counter(segment.index) {
                    segment.bytes_written = counter.load(Ordering::Relaxed);
                }
            }
        }

        if let Some((kind, message)) = failure {
            let outcome = self.fail(model, kind, message).await?;
            return Ok(Step::Stop(outcome));
        }
        if self.cancel.is_cancelled() || !model.all_segments_done() {
            self.repo.save(model).await?;
            debug!(bytes = model.bytes_written(), "segments checkpointed after stop");
            return Ok(Step::Stop(JobOutcome::Stopped));
        }
        Ok(Step::Continue)
    }

    async fn fail(
        &self,
        model: &mut DownloadModel,
        kind: FailureKind,
        message: String,
    ) -> Result<JobOutcome, StoreError> {
        warn!(kind = %kind, error = %message, attempts = model.attempt_count, "download failed");
        model.status = DownloadStatus::Failed;
        model.record_error(kind, message);
        self.repo.save(model).await?;
        self.live.sync_meta(model);
        self.stats.increment_failed();
        Ok(JobOutcome::Failed)
    }
}

enum SegmentResult {
    Done(u64),
    Stopped(u64),
    Failed(DownloadError, u64),
}

struct SegmentReport {
    index: u32,
    failures: u32,
    result: SegmentResult,
}

/// One segment's retry loop. Each attempt holds a per-download permit and a
/// shared pool permit; both are released while backing off.
struct SegmentTask {
    worker: SegmentWorker,
    segment: Segment,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
    per_download: Arc<Semaphore>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
    stats: Arc<RunStats>,
}

impl SegmentTask {
    async fn run(self) -> SegmentReport {
        let mut failures = 0u32;
        loop {
            let permits = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return self.report(failures, SegmentResult::Stopped(self.bytes()));
                }
                permits = acquire(&self.per_download, &self.pool) => permits,
            };
            let Ok(permits) = permits else {
                return self.report(failures, SegmentResult::Stopped(self.bytes()));
            };

            let outcome = self
                .worker
                .run(&self.segment, &self.counter, &self.cancel)
                .await;
            drop(permits);

            let error = match outcome {
                Ok(SegmentOutcome::Completed { bytes_written }) => {
                    return self.report(failures, SegmentResult::Done(bytes_written));
                }
                Ok(SegmentOutcome::Cancelled { bytes_written }) => {
                    return self.report(failures, SegmentResult::Stopped(bytes_written));
                }
                Err(error) => error,
            };

            failures += 1;
            match self.retry.should_retry(&error, failures) {
                RetryDecision::Retry { delay, attempt } => {
                    self.stats.increment_retried();
                    info!(
                        segment = self.segment.index,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        delay_ms = millis(delay),
                        error = %error,
                        "retrying segment"
                    );
                    if !sleep_or_cancel(&self.cancel, delay).await {
                        return self.report(failures, SegmentResult::Stopped(self.bytes()));
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(segment = self.segment.index, %reason, error = %error, "segment failed");
                    let bytes = self.bytes();
                    return self.report(failures, SegmentResult::Failed(error, bytes));
                }
            }
        }
    }

    fn bytes(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    fn report(&self, failures: u32, result: SegmentResult) -> SegmentReport {
        SegmentReport {
            index: self.segment.index,
            failures,
            result,
        }
    }
}

async fn acquire(
    per_download: &Arc<Semaphore>,
    pool: &Arc<Semaphore>,
) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), AcquireError> {
    let local = Arc::clone(per_download).acquire_owned().await?;
    let global = Arc::clone(pool).acquire_owned().await?;
    Ok((local, global))
}

/// Sleeps for `delay`; returns false if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
