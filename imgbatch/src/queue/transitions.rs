use chrono::Utc;

use crate::error::Result;

use super::types::{Claimed, DeadLettered, Done, Job, JobData, Queued};
use super::JobQueue;

/// What happened to a job whose attempt failed.
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Back on the queue, held until its backoff elapses.
    Retrying(Job<Queued>),
    /// Attempt budget spent.
    DeadLettered(Job<DeadLettered>),
}

impl Job<Queued> {
    /// A first-attempt job, claimable immediately.
    pub fn new(data: JobData) -> Self {
        Job {
            state: Queued::first(),
            data,
        }
    }
}

impl Job<Claimed> {
    /// Give the job back without consuming an attempt (no capacity right now).
    pub async fn unclaim(self, queue: &dyn JobQueue) -> Result<Job<Queued>> {
        let job = Job {
            state: Queued {
                attempt: self.state.attempt,
                not_before: None,
                last_error: None,
            },
            data: self.data,
        };
        queue.persist(&job.clone().into()).await?;
        Ok(job)
    }

    pub async fn complete(self, queue: &dyn JobQueue) -> Result<Job<Done>> {
        let job = Job {
            state: Done {
                attempts: self.state.attempt + 1,
                finished_at: Utc::now(),
            },
            data: self.data,
        };
        queue.persist(&job.clone().into()).await?;
        Ok(job)
    }

    /// Record a failed attempt: re-queue with exponential backoff while the
    /// attempt budget allows, otherwise dead-letter.
    pub async fn fail(self, error: String, queue: &dyn JobQueue) -> Result<FailureOutcome> {
        let attempt = self.state.attempt;
        let retry = self.data.retry;

        if !retry.allows_retry_after(attempt) {
            return self
                .dead_letter(error, queue)
                .await
                .map(FailureOutcome::DeadLettered);
        }

        let backoff = retry.backoff_for(attempt);
        let not_before = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::debug!(
            key = %self.data.key,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "Re-queueing failed job with backoff"
        );

        let job = Job {
            state: Queued {
                attempt: attempt + 1,
                not_before: Some(not_before),
                last_error: Some(error),
            },
            data: self.data,
        };
        queue.persist(&job.clone().into()).await?;
        Ok(FailureOutcome::Retrying(job))
    }

    /// Abandon the job now, whatever budget is left.
    pub async fn dead_letter(self, error: String, queue: &dyn JobQueue) -> Result<Job<DeadLettered>> {
        let job = Job {
            state: DeadLettered {
                attempts: self.state.attempt + 1,
                error,
                failed_at: Utc::now(),
            },
            data: self.data,
        };
        queue.persist(&job.clone().into()).await?;
        Ok(job)
    }
}
