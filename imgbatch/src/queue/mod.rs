//! Durable Queue of image jobs.
//!
//! Delivery is at-least-once: a claimed job that is never finished (worker
//! crash) is handed out again once its claim is older than the claim
//! timeout. Job identity is the image coordinates, so an image can never
//! have two live jobs.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::ImageKey;

pub mod in_memory;
pub mod postgres;
pub mod transitions;
pub mod types;


pub use in_memory::InMemoryQueue;
pub use postgres::PostgresQueue;
pub use transitions::FailureOutcome;
pub use types::{
    AnyJob, Claimed, DeadLettered, Done, Job, JobData, JobState, Queued, RetryPolicy, WorkerId,
};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably accept a new job.
    ///
    /// # Errors
    /// - `InvalidState` if a job for the same image already exists
    async fn enqueue(&self, job: Job<Queued>) -> Result<()>;

    /// Accept many jobs. Stops at the first rejected one.
    async fn enqueue_many(&self, jobs: Vec<Job<Queued>>) -> Result<()> {
        for job in jobs {
            self.enqueue(job).await?;
        }
        Ok(())
    }

    /// Atomically claim up to `limit` queued jobs whose backoff has elapsed,
    /// oldest first. Stale claims are released before claiming.
    async fn claim_jobs(&self, limit: usize, worker_id: WorkerId) -> Result<Vec<Job<Claimed>>>;

    /// Write a job's new state. Transitions are enforced by the typestate, not here.
    ///
    /// # Errors
    /// - `JobNotFound` if no job exists for the key
    async fn persist(&self, job: &AnyJob) -> Result<()>;

    async fn get_job(&self, key: &ImageKey) -> Result<AnyJob>;

    /// Return jobs claimed longer than the claim timeout to the queue.
    async fn release_stale_claims(&self) -> Result<usize>;

    /// Queued jobs, oldest first (read-only).
    async fn view_queued(&self, limit: usize) -> Result<Vec<Job<Queued>>>;

    /// Abandoned jobs, most recent first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job<DeadLettered>>>;
}
