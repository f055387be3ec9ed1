//! Job scheduler: polling loop, bounded worker pools, and per-job
//! orchestration.
//!
//! The scheduler polls for unfinished jobs, dispatches each to a worker under
//! a weighted semaphore, invokes the source backend to enumerate images,
//! matches each image against the device fleet, and hands eligible images to
//! the download pipeline under a second weighted semaphore.
//!
//! # Dynamic worker counts
//!
//! Both semaphores hold a fixed 720720 permits (the least common multiple of
//! 1..=16) and each worker acquires `720720 / worker_count`. Changing the
//! worker count at runtime only changes the per-acquire weight; the semaphore
//! itself is never resized and permits cannot leak across a reload, because
//! every holder releases exactly what it acquired.

mod tracker;

pub use tracker::JobTracker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHandle, ReloadBroadcaster};
use crate::database::models::{JobDbModel, JobStatus};
use crate::database::repositories::{DeviceRepository, JobRepository, SourceRepository};
use crate::database::time;
use crate::downloader::{DownloadTask, Downloader};
use crate::source::{Request, SourceRegistry};
use crate::Error;

/// Least common multiple of 1..=16; total weight of both worker semaphores.
const LEAST_COMMON_MULTIPLE: u32 = 720_720;

/// Capacity of the in-memory job queue. A full queue blocks the poller,
/// which is the only producer, so discovery throttles naturally.
const JOB_QUEUE_CAPACITY: usize = 1024;

/// Counts in-flight job tasks so shutdown can wait for them.
#[derive(Clone, Default)]
struct WaitGroup {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl WaitGroup {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct Scheduler {
    config: ConfigHandle,
    reload: ReloadBroadcaster,
    jobs: Arc<dyn JobRepository>,
    sources: Arc<dyn SourceRepository>,
    devices: Arc<dyn DeviceRepository>,
    registry: Arc<SourceRegistry>,
    downloader: Arc<Downloader>,
    tracker: Arc<JobTracker>,
    is_running: AtomicBool,
    job_semaphore: Arc<Semaphore>,
    download_semaphore: Arc<Semaphore>,
    inflight: WaitGroup,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigHandle,
        reload: ReloadBroadcaster,
        jobs: Arc<dyn JobRepository>,
        sources: Arc<dyn SourceRepository>,
        devices: Arc<dyn DeviceRepository>,
        registry: Arc<SourceRegistry>,
        downloader: Arc<Downloader>,
    ) -> Self {
        Self {
            config,
            reload,
            jobs,
            sources,
            devices,
            registry,
            downloader,
            tracker: Arc::new(JobTracker::new()),
            is_running: AtomicBool::new(false),
            job_semaphore: Arc::new(Semaphore::new(LEAST_COMMON_MULTIPLE as usize)),
            download_semaphore: Arc::new(Semaphore::new(LEAST_COMMON_MULTIPLE as usize)),
            inflight: WaitGroup::default(),
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Publish a reload signal so the poller and workers re-read the
    /// configuration. Non-blocking.
    pub fn reread_config(&self) {
        self.reload.publish();
    }

    /// Run the scheduler until `token` is cancelled, then wait up to the
    /// configured exit timeout for in-flight jobs.
    ///
    /// Idempotent: a second call while already running returns immediately.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (queue_tx, queue_rx) = mpsc::channel::<JobDbModel>(JOB_QUEUE_CAPACITY);
        let poller = tokio::spawn(Arc::clone(self).poll_loop(token.clone(), queue_tx));
        let consumer = tokio::spawn(Arc::clone(self).consume_loop(token.clone(), queue_rx));
        info!("scheduler started");

        token.cancelled().await;
        info!("shutting down scheduler, waiting for running jobs to complete");

        let exit_timeout = self.config.get().scheduler.exit_timeout();
        match tokio::time::timeout(exit_timeout, self.inflight.wait()).await {
            Ok(()) => info!("scheduler shutdown complete"),
            Err(_) => warn!("scheduler shutdown timed out, some jobs may be interrupted"),
        }

        let _ = poller.await;
        let _ = consumer.await;
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Poll immediately, then on every tick or reload signal.
    async fn poll_loop(self: Arc<Self>, token: CancellationToken, queue: mpsc::Sender<JobDbModel>) {
        self.poll_once(&queue).await;

        let mut reload_rx = self.reload.subscribe();
        let mut interval = tokio::time::interval(self.config.get().scheduler.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.reset();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("scheduler poller stopped");
                    return;
                }
                received = reload_rx.recv() => {
                    if matches!(received, Err(RecvError::Closed)) {
                        continue;
                    }
                    let poll_interval = self.config.get().scheduler.poll_interval();
                    info!(?poll_interval, "reloading scheduler poll interval");
                    interval = tokio::time::interval(poll_interval);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval.reset();
                }
                _ = interval.tick() => {
                    self.poll_once(&queue).await;
                }
            }
        }
    }

    /// Fetch unfinished jobs that are not already claimed and enqueue them.
    async fn poll_once(&self, queue: &mpsc::Sender<JobDbModel>) {
        let excluded = self.tracker.snapshot();
        let jobs = match self.jobs.list_pollable(&excluded).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to query jobs");
                return;
            }
        };

        for job in jobs {
            let job_id = job.id;
            self.tracker.add(job_id);
            info!(job_id, source_id = job.source_id, "enqueuing job");
            if queue.send(job).await.is_err() {
                // Consumer is gone; we are shutting down.
                self.tracker.remove(job_id);
                return;
            }
        }
    }

    /// Serve jobs from the queue under the job-worker semaphore.
    async fn consume_loop(
        self: Arc<Self>,
        token: CancellationToken,
        mut queue: mpsc::Receiver<JobDbModel>,
    ) {
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => {
                    debug!("scheduler queue consumer stopped");
                    return;
                }
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            };

            let weight = self.job_weight();
            let permit = tokio::select! {
                _ = token.cancelled() => {
                    self.tracker.remove(job.id);
                    debug!("scheduler queue consumer stopped");
                    return;
                }
                permit = Arc::clone(&self.job_semaphore).acquire_many_owned(weight) => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    }
                }
            };

            self.inflight.add();
            let scheduler = Arc::clone(&self);
            let job_token = token.clone();
            tokio::spawn(async move {
                let _permit = permit;
                scheduler.execute_job(&job_token, &job).await;
                scheduler.tracker.remove(job.id);
                scheduler.inflight.done();
            });
        }
    }

    /// Weight one job worker acquires, derived from the live config so a
    /// reload takes effect on the next acquire.
    fn job_weight(&self) -> u32 {
        LEAST_COMMON_MULTIPLE / self.config.get().scheduler.clamped_max_workers()
    }

    fn download_weight(&self) -> u32 {
        LEAST_COMMON_MULTIPLE / self.config.get().scheduler.clamped_download_workers()
    }

    async fn execute_job(&self, token: &CancellationToken, job: &JobDbModel) {
        let source = match self.sources.get_source(job.source_id).await {
            Ok(source) => source,
            Err(e) => {
                error!(job_id = job.id, error = %e, "failed to get source for job");
                self.update_job_status(job.id, JobStatus::Failed, Some(&e)).await;
                return;
            }
        };

        let Some(backend) = self.registry.get(&source.backend_name) else {
            let e = Error::UnknownBackend(source.backend_name.clone());
            error!(job_id = job.id, source_id = source.id, error = %e, "failed to get backend for job");
            self.update_job_status(job.id, JobStatus::Failed, Some(&e)).await;
            return;
        };

        self.update_job_status(job.id, JobStatus::Running, None).await;
        info!(
            job_id = job.id,
            source_id = source.id,
            backend = %source.backend_name,
            "starting job"
        );

        let request = Request {
            parameter: source.parameter.clone(),
            countback: source.countback,
            filename_max_length: self.config.get().download.filename_max_length as i64,
        };
        let response = tokio::select! {
            // Graceful shutdown: the job row stays RUNNING and the next run
            // picks it up.
            _ = token.cancelled() => return,
            response = backend.run(request) => match response {
                Ok(response) => response,
                Err(e) => {
                    error!(job_id = job.id, error = %e, "job failed");
                    self.update_job_status(job.id, JobStatus::Failed, Some(&e)).await;
                    return;
                }
            },
        };

        if response.images.is_empty() {
            info!(job_id = job.id, "job completed with no images");
            self.update_job_status(job.id, JobStatus::Completed, None).await;
            self.touch_source(source.id).await;
            return;
        }

        let total = response.images.len();
        let mut downloads: JoinSet<bool> = JoinSet::new();
        for image in response.images {
            if image.download_url.is_empty() {
                continue;
            }

            let devices = match self.devices.find_matching(&image).await {
                Ok(devices) => devices,
                Err(e) => {
                    error!(job_id = job.id, error = %e, "failed to find devices to assign");
                    self.update_job_status(job.id, JobStatus::Failed, Some(&e)).await;
                    return;
                }
            };
            if devices.is_empty() {
                debug!(
                    job_id = job.id,
                    url = %image.download_url,
                    "no devices accept this image, skipping"
                );
                continue;
            }

            let weight = self.download_weight();
            let permit = tokio::select! {
                _ = token.cancelled() => return,
                permit = Arc::clone(&self.download_semaphore).acquire_many_owned(weight) => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    }
                }
            };

            let downloader = Arc::clone(&self.downloader);
            let task = DownloadTask {
                image,
                devices,
                source_id: source.id,
                source_name: source.backend_name.clone(),
            };
            let download_token = token.clone();
            let job_id = job.id;
            downloads.spawn(async move {
                let _permit = permit;
                match downloader.process(&download_token, &task).await {
                    Ok(_) => true,
                    Err(e) if e.is_cancellation() => false,
                    Err(e) => {
                        error!(
                            job_id,
                            url = %task.image.download_url,
                            error = %e,
                            "failed to process image"
                        );
                        false
                    }
                }
            });
        }

        let mut processed = 0usize;
        while let Some(result) = downloads.join_next().await {
            if matches!(result, Ok(true)) {
                processed += 1;
            }
        }

        if token.is_cancelled() {
            return;
        }

        info!(
            job_id = job.id,
            images_found = total,
            images_processed = processed,
            "job completed"
        );
        self.update_job_status(job.id, JobStatus::Completed, None).await;
        self.touch_source(source.id).await;
    }

    /// Persist a job status transition, stamping `run_at` / `finished_at` as
    /// the status requires.
    ///
    /// Cancellation errors short-circuit before any write: a job interrupted
    /// by shutdown must keep its current state so the next run picks it up.
    /// Database errors are logged, never propagated.
    async fn update_job_status(&self, job_id: i64, status: JobStatus, error: Option<&Error>) {
        if let Some(e) = error {
            if e.is_cancellation() {
                return;
            }
        }

        let now = time::now_ms();
        let result = match status {
            JobStatus::Running => self.jobs.mark_running(job_id, now).await,
            JobStatus::Completed => self.jobs.mark_completed(job_id, now).await,
            JobStatus::Failed => {
                let message = error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.jobs.mark_failed(job_id, &message, now).await
            }
            JobStatus::Pending | JobStatus::Cancelled => Ok(()),
        };

        if let Err(e) = result {
            error!(job_id, status = %status, error = %e, "failed to update job status");
        }
    }

    async fn touch_source(&self, source_id: i64) {
        if let Err(e) = self.sources.touch_last_run(source_id).await {
            warn!(source_id, error = %e, "failed to update source last run time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_least_common_multiple_divides_evenly() {
        for workers in 1..=16u32 {
            assert_eq!(
                LEAST_COMMON_MULTIPLE % workers,
                0,
                "720720 must divide evenly by {workers}"
            );
        }
    }

    #[tokio::test]
    async fn test_wait_group_waits_for_done() {
        let group = WaitGroup::default();
        group.add();
        group.add();

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait().await })
        };

        group.done();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        group.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait() must complete after the last done()")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_group_with_no_tasks_returns_immediately() {
        let group = WaitGroup::default();
        tokio::time::timeout(Duration::from_millis(100), group.wait())
            .await
            .expect("empty wait group must not block");
    }
}
