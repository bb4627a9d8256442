//! In-memory job queue for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{ImgBatchError, Result};
use crate::model::ImageKey;

use super::types::{AnyJob, Claimed, DeadLettered, Job, Queued, WorkerId};
use super::JobQueue;

/// Default time a claim may be held before the job is handed out again.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of `Done` jobs kept for inspection before the oldest are dropped.
pub const DEFAULT_KEEP_COMPLETED: usize = 100;

struct StoredJob {
    /// Enqueue order, used for oldest-first claiming.
    seq: u64,
    job: AnyJob,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<ImageKey, StoredJob>,
    /// `Done` jobs, oldest first.
    completed: VecDeque<ImageKey>,
}

/// Dead-lettered jobs are kept indefinitely. Only the newest `keep_completed`
/// `Done` jobs are kept; once pruned, a job's identity can be enqueued again.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<RwLock<Inner>>,
    claim_timeout: Duration,
    keep_completed: usize,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_claim_timeout(DEFAULT_CLAIM_TIMEOUT)
    }

    pub fn with_claim_timeout(claim_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            claim_timeout,
            keep_completed: DEFAULT_KEEP_COMPLETED,
        }
    }

    /// Keep at most `keep` finished jobs.
    pub fn keep_completed(mut self, keep: usize) -> Self {
        self.keep_completed = keep;
        self
    }

    /// Number of jobs in any state.
    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_stale_locked(&self, inner: &mut Inner) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let mut released = 0;
        for stored in inner.jobs.values_mut() {
            if let AnyJob::Claimed(job) = &stored.job {
                if job.state.claimed_at < cutoff {
                    stored.job = AnyJob::Queued(Job {
                        state: Queued {
                            attempt: job.state.attempt,
                            not_before: None,
                            last_error: None,
                        },
                        data: job.data.clone(),
                    });
                    released += 1;
                }
            }
        }
        released
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: Job<Queued>) -> Result<()> {
        let mut inner = self.inner.write();
        let key = job.data.key;
        if inner.jobs.contains_key(&key) {
            return Err(ImgBatchError::InvalidState(
                format!("job {key}"),
                "new".to_string(),
                "exists".to_string(),
            ));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            key,
            StoredJob {
                seq,
                job: job.into(),
            },
        );
        Ok(())
    }

    async fn claim_jobs(&self, limit: usize, worker_id: WorkerId) -> Result<Vec<Job<Claimed>>> {
        let mut inner = self.inner.write();

        let released = self.release_stale_locked(&mut inner);
        if released > 0 {
            tracing::warn!(released, "Released stale job claims");
        }

        let now = Utc::now();
        let mut claimable: Vec<(u64, ImageKey)> = inner
            .jobs
            .iter()
            .filter(|(_, stored)| stored.job.is_claimable(now))
            .map(|(key, stored)| (stored.seq, *key))
            .collect();
        claimable.sort_unstable();

        let mut claimed = Vec::new();
        for (_, key) in claimable.into_iter().take(limit) {
            if let Some(stored) = inner.jobs.get_mut(&key) {
                if let AnyJob::Queued(job) = &stored.job {
                    let job = Job {
                        state: Claimed {
                            worker_id,
                            claimed_at: now,
                            attempt: job.state.attempt,
                        },
                        data: job.data.clone(),
                    };
                    stored.job = job.clone().into();
                    claimed.push(job);
                }
            }
        }
        Ok(claimed)
    }

    async fn persist(&self, job: &AnyJob) -> Result<()> {
        let mut inner = self.inner.write();
        let key = job.key();
        let stored = inner
            .jobs
            .get_mut(&key)
            .ok_or(ImgBatchError::JobNotFound(key))?;
        stored.job = job.clone();

        if matches!(job, AnyJob::Done(_)) {
            inner.completed.push_back(key);
            while inner.completed.len() > self.keep_completed {
                if let Some(oldest) = inner.completed.pop_front() {
                    inner.jobs.remove(&oldest);
                }
            }
        }
        Ok(())
    }

    async fn get_job(&self, key: &ImageKey) -> Result<AnyJob> {
        self.inner
            .read()
            .jobs
            .get(key)
            .map(|stored| stored.job.clone())
            .ok_or(ImgBatchError::JobNotFound(*key))
    }

    async fn release_stale_claims(&self) -> Result<usize> {
        let mut inner = self.inner.write();
        Ok(self.release_stale_locked(&mut inner))
    }

    async fn view_queued(&self, limit: usize) -> Result<Vec<Job<Queued>>> {
        let inner = self.inner.read();
        let mut queued: Vec<(u64, Job<Queued>)> = inner
            .jobs
            .values()
            .filter_map(|stored| stored.job.as_queued().map(|j| (stored.seq, j.clone())))
            .collect();
        queued.sort_by_key(|(seq, _)| *seq);
        Ok(queued.into_iter().take(limit).map(|(_, j)| j).collect())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job<DeadLettered>>> {
        let inner = self.inner.read();
        let mut dead: Vec<Job<DeadLettered>> = inner
            .jobs
            .values()
            .filter_map(|stored| stored.job.as_dead_lettered().cloned())
            .collect();
        dead.sort_by(|a, b| b.state.failed_at.cmp(&a.state.failed_at));
        dead.truncate(limit);
        Ok(dead)
    }
}
