//! Job lifecycle as a typestate.
//!
//! A job is `Queued` until a worker daemon claims it, then either `Done`,
//! back to `Queued` for another attempt, or `DeadLettered` once the attempt
//! budget is spent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::ImageKey;

/// Marker trait for valid job states.
pub trait JobState: Send + Sync {}

/// An image-processing job. `T` is the current lifecycle state.
#[derive(Debug, Clone)]
pub struct Job<T: JobState> {
    pub state: T,
    pub data: JobData,
}

/// Everything a worker needs to find its Image again.
///
/// Jobs carry coordinates only, never a reference to the owning records:
/// the worker re-reads current state before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobData {
    pub key: ImageKey,
    pub product_name: String,
    pub input_url: String,
    pub retry: RetryPolicy,
}

/// Bounded exponential retry attached to each job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub backoff_ms: u64,
    /// Multiplier applied per further attempt
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-running a job whose attempt number `attempt` (0-based) failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Whether a failure of attempt `attempt` leaves budget for another try.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

/// Identifier of a worker daemon holding claims.
pub type WorkerId = Uuid;

// ============================================================================
// Job States
// ============================================================================

/// Waiting to be claimed. `not_before` holds back retries until their backoff elapses.
#[derive(Debug, Clone)]
pub struct Queued {
    pub attempt: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobState for Queued {}

impl Queued {
    pub fn first() -> Self {
        Self {
            attempt: 0,
            not_before: None,
            last_error: None,
        }
    }
}

/// Owned by one worker daemon.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub attempt: u32,
}

impl JobState for Claimed {}

#[derive(Debug, Clone)]
pub struct Done {
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl JobState for Done {}

/// Abandoned after exhausting retries or on a non-retryable error. Never re-run.
#[derive(Debug, Clone)]
pub struct DeadLettered {
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl JobState for DeadLettered {}

// ============================================================================
// Unified Job Representation
// ============================================================================

#[derive(Debug, Clone)]
pub enum AnyJob {
    Queued(Job<Queued>),
    Claimed(Job<Claimed>),
    Done(Job<Done>),
    DeadLettered(Job<DeadLettered>),
}

impl AnyJob {
    pub fn key(&self) -> ImageKey {
        self.data().key
    }

    pub fn data(&self) -> &JobData {
        match self {
            AnyJob::Queued(j) => &j.data,
            AnyJob::Claimed(j) => &j.data,
            AnyJob::Done(j) => &j.data,
            AnyJob::DeadLettered(j) => &j.data,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            AnyJob::Queued(_) => "queued",
            AnyJob::Claimed(_) => "claimed",
            AnyJob::Done(_) => "done",
            AnyJob::DeadLettered(_) => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyJob::Done(_) | AnyJob::DeadLettered(_))
    }

    /// Claimable at `now`: queued and past its backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self {
            AnyJob::Queued(j) => j.state.not_before.map_or(true, |t| t <= now),
            _ => false,
        }
    }

    pub fn as_queued(&self) -> Option<&Job<Queued>> {
        match self {
            AnyJob::Queued(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_dead_lettered(&self) -> Option<&Job<DeadLettered>> {
        match self {
            AnyJob::DeadLettered(j) => Some(j),
            _ => None,
        }
    }
}

impl From<Job<Queued>> for AnyJob {
    fn from(j: Job<Queued>) -> Self {
        AnyJob::Queued(j)
    }
}

impl From<Job<Claimed>> for AnyJob {
    fn from(j: Job<Claimed>) -> Self {
        AnyJob::Claimed(j)
    }
}

impl From<Job<Done>> for AnyJob {
    fn from(j: Job<Done>) -> Self {
        AnyJob::Done(j)
    }
}

impl From<Job<DeadLettered>> for AnyJob {
    fn from(j: Job<DeadLettered>) -> Self {
        AnyJob::DeadLettered(j)
    }
}
