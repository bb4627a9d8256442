//! Daemon that drains the job queue with per-host concurrency control.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;
use crate::queue::{Claimed, FailureOutcome, Job, JobQueue, WorkerId};
use crate::worker::{ProcessOutcome, Worker};

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Maximum number of jobs to claim in each iteration
    pub claim_batch_size: usize,

    /// Default concurrency limit per source host
    pub default_host_concurrency: usize,

    /// Per-host concurrency overrides
    pub host_concurrency_limits: HashMap<String, usize>,

    /// How long to sleep between claim iterations when there is nothing to do
    pub claim_interval_ms: u64,

    /// Interval for logging daemon status (jobs in flight) in milliseconds
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 50,
            default_host_concurrency: 8,
            host_concurrency_limits: HashMap::new(),
            claim_interval_ms: 1000,
            status_log_interval_ms: Some(5000),
        }
    }
}

/// Host a job's fetch goes to. Concurrency is limited per host so one slow
/// image server cannot occupy every slot.
fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Daemon that processes image jobs.
///
/// The daemon continuously claims queued jobs, enforces per-host concurrency
/// limits, runs each job through the [`Worker`] and feeds the outcome back
/// into the queue's retry accounting.
pub struct Daemon {
    worker_id: WorkerId,
    queue: Arc<dyn JobQueue>,
    worker: Arc<Worker>,
    config: DaemonConfig,
    semaphores: DashMap<String, Arc<Semaphore>>,
    jobs_in_flight: Arc<AtomicUsize>,
}

impl Daemon {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Arc<Worker>, config: DaemonConfig) -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4(),
            queue,
            worker,
            config,
            semaphores: DashMap::new(),
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    /// Get or create the semaphore for a host.
    fn get_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(host.to_string())
            .or_insert_with(|| {
                let limit = self
                    .config
                    .host_concurrency_limits
                    .get(host)
                    .copied()
                    .unwrap_or(self.config.default_host_concurrency);
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    /// Try to acquire a permit for a host (non-blocking).
    fn try_acquire_permit(&self, host: &str) -> Option<OwnedSemaphorePermit> {
        self.get_semaphore(host).try_acquire_owned().ok()
    }

    /// Run the daemon loop until `shutdown` is cancelled, then wait for
    /// in-flight jobs to finish.
    #[tracing::instrument(skip(self, shutdown), fields(worker_id = %self.worker_id))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Daemon starting main processing loop");

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let jobs_in_flight = self.jobs_in_flight.clone();
            let worker_id = self.worker_id;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            tracing::debug!(
                                worker_id = %worker_id,
                                jobs_in_flight = jobs_in_flight.load(Ordering::Relaxed),
                                "Daemon status"
                            );
                        }
                    }
                }
            });
        }

        let idle = Duration::from_millis(self.config.claim_interval_ms);
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        while !shutdown.is_cancelled() {
            reap(&mut join_set);

            let claimed = match self
                .queue
                .claim_jobs(self.config.claim_batch_size, self.worker_id)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim jobs");
                    sleep_or_cancel(idle, &shutdown).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                tracing::trace!("No queued jobs, sleeping");
                sleep_or_cancel(idle, &shutdown).await;
                continue;
            }

            tracing::debug!(claimed_count = claimed.len(), "Claimed jobs from queue");

            let mut dispatched = 0usize;
            for job in claimed {
                let host = host_of(&job.data.input_url);
                match self.try_acquire_permit(&host) {
                    Some(permit) => {
                        dispatched += 1;
                        self.dispatch(&mut join_set, job, permit);
                    }
                    None => {
                        tracing::debug!(
                            key = %job.data.key,
                            host = %host,
                            "No capacity available, unclaiming job"
                        );
                        let key = job.data.key;
                        if let Err(e) = job.unclaim(self.queue.as_ref()).await {
                            tracing::error!(key = %key, error = %e, "Failed to unclaim job");
                        }
                    }
                }
            }

            // Every host is saturated; give running jobs a chance to finish.
            if dispatched == 0 {
                sleep_or_cancel(idle, &shutdown).await;
            }
        }

        tracing::info!(
            jobs_in_flight = self.jobs_in_flight(),
            "Daemon stopping, waiting for in-flight jobs"
        );
        while let Some(result) = join_set.join_next().await {
            log_task_result(result);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        join_set: &mut JoinSet<Result<()>>,
        job: Job<Claimed>,
        permit: OwnedSemaphorePermit,
    ) {
        let queue = self.queue.clone();
        let worker = self.worker.clone();
        let jobs_in_flight = self.jobs_in_flight.clone();
        jobs_in_flight.fetch_add(1, Ordering::Relaxed);

        join_set.spawn(async move {
            // Permit is held for the duration of this task
            let _permit = permit;
            let _guard = scopeguard::guard((), |_| {
                jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
            });

            let key = job.data.key;
            let attempt = job.state.attempt;
            tracing::info!(key = %key, attempt, "Processing job");

            match worker.process(&job.data).await {
                Ok(outcome) => {
                    job.complete(queue.as_ref()).await?;
                    match outcome {
                        ProcessOutcome::Completed { output_url } => {
                            tracing::info!(key = %key, output_url = %output_url, "Job completed successfully");
                        }
                        ProcessOutcome::AlreadyCompleted => {
                            tracing::debug!(key = %key, "Job was a redelivery of a completed image");
                        }
                    }
                }
                Err(e) if !e.is_retryable() => {
                    let dead = job.dead_letter(e.to_string(), queue.as_ref()).await?;
                    tracing::error!(
                        key = %key,
                        attempts = dead.state.attempts,
                        error = %e,
                        "Job failed with a non-retryable error, dead-lettered"
                    );
                }
                Err(e) => match job.fail(e.to_string(), queue.as_ref()).await? {
                    FailureOutcome::Retrying(queued) => {
                        tracing::warn!(
                            key = %key,
                            attempt = queued.state.attempt,
                            error = %e,
                            "Job failed, queued for retry"
                        );
                    }
                    FailureOutcome::DeadLettered(dead) => {
                        tracing::warn!(
                            key = %key,
                            attempts = dead.state.attempts,
                            error = %e,
                            "Job failed permanently (no attempts remaining), dead-lettered"
                        );
                    }
                },
            }

            Ok(())
        });
    }
}

/// Collect finished tasks without blocking.
fn reap(join_set: &mut JoinSet<Result<()>>) {
    while let Some(result) = join_set.try_join_next() {
        log_task_result(result);
    }
}

fn log_task_result(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => tracing::trace!("Task completed successfully"),
        Ok(Err(e)) => tracing::error!(error = %e, "Task failed"),
        Err(join_error) => tracing::error!(error = %join_error, "Task panicked"),
    }
}

async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
