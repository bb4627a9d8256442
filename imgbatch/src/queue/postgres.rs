//! PostgreSQL job queue on the `image_jobs` table.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED`, so any number of daemons can share
//! the table without handing one job to two workers at once.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{ImgBatchError, Result};
use crate::model::{ImageKey, RequestId};

use super::in_memory::DEFAULT_CLAIM_TIMEOUT;
use super::types::{
    AnyJob, Claimed, DeadLettered, Done, Job, JobData, Queued, RetryPolicy, WorkerId,
};
use super::JobQueue;

const UNIQUE_VIOLATION: &str = "23505";

const JOB_COLUMNS: &str = "request_id, serial_number, image_index, product_name, input_url, \
     state, attempt, max_attempts, backoff_ms, backoff_factor, max_backoff_ms, not_before, \
     worker_id, claimed_at, finished_at, last_error";

#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    claim_timeout: Duration,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_claim_timeout(pool, DEFAULT_CLAIM_TIMEOUT)
    }

    pub fn with_claim_timeout(pool: PgPool, claim_timeout: Duration) -> Self {
        Self {
            pool,
            claim_timeout,
        }
    }
}

fn job_data_from_row(row: &PgRow) -> Result<JobData> {
    Ok(JobData {
        key: ImageKey::new(
            RequestId(row.try_get("request_id")?),
            row.try_get("serial_number")?,
            row.try_get::<i32, _>("image_index")? as u32,
        ),
        product_name: row.try_get("product_name")?,
        input_url: row.try_get("input_url")?,
        retry: RetryPolicy {
            max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
            backoff_ms: row.try_get::<i64, _>("backoff_ms")? as u64,
            backoff_factor: row.try_get::<i64, _>("backoff_factor")? as u64,
            max_backoff_ms: row.try_get::<i64, _>("max_backoff_ms")? as u64,
        },
    })
}

fn job_from_row(row: &PgRow) -> Result<AnyJob> {
    let data = job_data_from_row(row)?;
    let state: String = row.try_get("state")?;
    let attempt = row.try_get::<i32, _>("attempt")? as u32;

    let key = data.key;
    let missing = move |field: &str| {
        ImgBatchError::InvalidState(
            format!("job {key}"),
            format!("{field} to be set"),
            "NULL".to_string(),
        )
    };

    let job = match state.as_str() {
        "queued" => AnyJob::Queued(Job {
            state: Queued {
                attempt,
                not_before: row.try_get("not_before")?,
                last_error: row.try_get("last_error")?,
            },
            data,
        }),
        "claimed" => {
            let worker_id: Option<Uuid> = row.try_get("worker_id")?;
            let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at")?;
            AnyJob::Claimed(Job {
                state: Claimed {
                    worker_id: worker_id.ok_or_else(|| missing("worker_id"))?,
                    claimed_at: claimed_at.ok_or_else(|| missing("claimed_at"))?,
                    attempt,
                },
                data,
            })
        }
        "done" => {
            let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;
            AnyJob::Done(Job {
                state: Done {
                    attempts: attempt + 1,
                    finished_at: finished_at.ok_or_else(|| missing("finished_at"))?,
                },
                data,
            })
        }
        "dead_lettered" => {
            let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;
            let last_error: Option<String> = row.try_get("last_error")?;
            AnyJob::DeadLettered(Job {
                state: DeadLettered {
                    attempts: attempt + 1,
                    error: last_error.unwrap_or_default(),
                    failed_at: finished_at.ok_or_else(|| missing("finished_at"))?,
                },
                data,
            })
        }
        other => {
            return Err(ImgBatchError::InvalidState(
                format!("job {}", data.key),
                "queued|claimed|done|dead_lettered".to_string(),
                other.to_string(),
            ))
        }
    };
    Ok(job)
}

#[async_trait]
impl JobQueue for PostgresQueue {
    async fn enqueue(&self, job: Job<Queued>) -> Result<()> {
        self.enqueue_many(vec![job]).await
    }

    async fn enqueue_many(&self, jobs: Vec<Job<Queued>>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut request_ids = Vec::with_capacity(jobs.len());
        let mut serials = Vec::with_capacity(jobs.len());
        let mut indexes = Vec::with_capacity(jobs.len());
        let mut product_names = Vec::with_capacity(jobs.len());
        let mut input_urls = Vec::with_capacity(jobs.len());
        let mut attempts = Vec::with_capacity(jobs.len());
        let mut max_attempts = Vec::with_capacity(jobs.len());
        let mut backoff_ms = Vec::with_capacity(jobs.len());
        let mut backoff_factor = Vec::with_capacity(jobs.len());
        let mut max_backoff_ms = Vec::with_capacity(jobs.len());

        for job in &jobs {
            request_ids.push(*job.data.key.request_id);
            serials.push(job.data.key.serial_number);
            indexes.push(job.data.key.image_index as i32);
            product_names.push(job.data.product_name.clone());
            input_urls.push(job.data.input_url.clone());
            attempts.push(job.state.attempt as i32);
            max_attempts.push(job.data.retry.max_attempts as i32);
            backoff_ms.push(job.data.retry.backoff_ms as i64);
            backoff_factor.push(job.data.retry.backoff_factor as i64);
            max_backoff_ms.push(job.data.retry.max_backoff_ms as i64);
        }

        // WITH ORDINALITY keeps seq in submission order.
        let result = sqlx::query(
            r#"
            INSERT INTO image_jobs (
                request_id, serial_number, image_index, product_name, input_url,
                state, attempt, max_attempts, backoff_ms, backoff_factor, max_backoff_ms
            )
            SELECT request_id, serial_number, image_index, product_name, input_url,
                   'queued', attempt, max_attempts, backoff_ms, backoff_factor, max_backoff_ms
            FROM UNNEST(
                $1::uuid[], $2::bigint[], $3::int[], $4::text[], $5::text[],
                $6::int[], $7::int[], $8::bigint[], $9::bigint[], $10::bigint[]
            ) WITH ORDINALITY AS t(
                request_id, serial_number, image_index, product_name, input_url,
                attempt, max_attempts, backoff_ms, backoff_factor, max_backoff_ms, ord
            )
            ORDER BY ord
            "#,
        )
        .bind(&request_ids)
        .bind(&serials)
        .bind(&indexes)
        .bind(&product_names)
        .bind(&input_urls)
        .bind(&attempts)
        .bind(&max_attempts)
        .bind(&backoff_ms)
        .bind(&backoff_factor)
        .bind(&max_backoff_ms)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_database_error()
                    .and_then(|d| d.code())
                    .is_some_and(|c| c == UNIQUE_VIOLATION) =>
            {
                Err(ImgBatchError::InvalidState(
                    format!("job {}", jobs[0].data.key),
                    "new".to_string(),
                    "exists".to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_jobs(&self, limit: usize, worker_id: WorkerId) -> Result<Vec<Job<Claimed>>> {
        let released = self.release_stale_claims().await?;
        if released > 0 {
            tracing::info!(released, "Released stale job claims before claiming new ones");
        }

        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            WITH to_claim AS (
                SELECT request_id, serial_number, image_index
                FROM image_jobs
                WHERE state = 'queued'
                    AND (not_before IS NULL OR not_before <= $2)
                ORDER BY seq
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE image_jobs j
            SET
                state = 'claimed',
                worker_id = $1,
                claimed_at = $2
            FROM to_claim
            WHERE j.request_id = to_claim.request_id
                AND j.serial_number = to_claim.serial_number
                AND j.image_index = to_claim.image_index
            RETURNING j.seq, j.request_id, j.serial_number, j.image_index, j.product_name,
                      j.input_url, j.state, j.attempt, j.max_attempts, j.backoff_ms,
                      j.backoff_factor, j.max_backoff_ms, j.not_before, j.worker_id,
                      j.claimed_at, j.finished_at, j.last_error
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified; restore queue order.
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq")?;
            match job_from_row(row)? {
                AnyJob::Claimed(job) => claimed.push((seq, job)),
                other => {
                    return Err(ImgBatchError::InvalidState(
                        format!("job {}", other.key()),
                        "claimed".to_string(),
                        other.state_name().to_string(),
                    ))
                }
            }
        }
        claimed.sort_by_key(|(seq, _)| *seq);
        Ok(claimed.into_iter().map(|(_, job)| job).collect())
    }

    async fn persist(&self, job: &AnyJob) -> Result<()> {
        let key = job.key();
        let query = match job {
            AnyJob::Queued(j) => sqlx::query(
                r#"
                UPDATE image_jobs SET
                    state = 'queued',
                    attempt = $4,
                    not_before = $5,
                    last_error = $6,
                    worker_id = NULL,
                    claimed_at = NULL,
                    finished_at = NULL
                WHERE request_id = $1 AND serial_number = $2 AND image_index = $3
                "#,
            )
            .bind(*key.request_id)
            .bind(key.serial_number)
            .bind(key.image_index as i32)
            .bind(j.state.attempt as i32)
            .bind(j.state.not_before)
            .bind(j.state.last_error.clone()),
            AnyJob::Claimed(j) => sqlx::query(
                r#"
                UPDATE image_jobs SET
                    state = 'claimed',
                    attempt = $4,
                    worker_id = $5,
                    claimed_at = $6
                WHERE request_id = $1 AND serial_number = $2 AND image_index = $3
                "#,
            )
            .bind(*key.request_id)
            .bind(key.serial_number)
            .bind(key.image_index as i32)
            .bind(j.state.attempt as i32)
            .bind(j.state.worker_id)
            .bind(j.state.claimed_at),
            AnyJob::Done(j) => sqlx::query(
                r#"
                UPDATE image_jobs SET
                    state = 'done',
                    attempt = $4,
                    finished_at = $5,
                    not_before = NULL
                WHERE request_id = $1 AND serial_number = $2 AND image_index = $3
                "#,
            )
            .bind(*key.request_id)
            .bind(key.serial_number)
            .bind(key.image_index as i32)
            .bind(j.state.attempts.saturating_sub(1) as i32)
            .bind(j.state.finished_at),
            AnyJob::DeadLettered(j) => sqlx::query(
                r#"
                UPDATE image_jobs SET
                    state = 'dead_lettered',
                    attempt = $4,
                    finished_at = $5,
                    last_error = $6,
                    not_before = NULL
                WHERE request_id = $1 AND serial_number = $2 AND image_index = $3
                "#,
            )
            .bind(*key.request_id)
            .bind(key.serial_number)
            .bind(key.image_index as i32)
            .bind(j.state.attempts.saturating_sub(1) as i32)
            .bind(j.state.failed_at)
            .bind(j.state.error.clone()),
        };

        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        if rows_affected == 0 {
            return Err(ImgBatchError::JobNotFound(key));
        }
        Ok(())
    }

    async fn get_job(&self, key: &ImageKey) -> Result<AnyJob> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM image_jobs \
             WHERE request_id = $1 AND serial_number = $2 AND image_index = $3"
        ))
        .bind(*key.request_id)
        .bind(key.serial_number)
        .bind(key.image_index as i32)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ImgBatchError::JobNotFound(*key))?;

        job_from_row(&row)
    }

    async fn release_stale_claims(&self) -> Result<usize> {
        let claim_timeout_ms = self.claim_timeout.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            UPDATE image_jobs
            SET
                state = 'queued',
                worker_id = NULL,
                claimed_at = NULL,
                not_before = NULL
            WHERE state = 'claimed'
                AND claimed_at < NOW() - ($1 || ' milliseconds')::INTERVAL
            RETURNING request_id, serial_number, image_index
            "#,
        )
        .bind(claim_timeout_ms.to_string())
        .fetch_all(&self.pool)
        .await?;

        let count = rows.len();
        if count > 0 {
            let keys = rows
                .iter()
                .map(|r| {
                    Ok(ImageKey::new(
                        RequestId(r.try_get("request_id")?),
                        r.try_get("serial_number")?,
                        r.try_get::<i32, _>("image_index")? as u32,
                    )
                    .to_string())
                })
                .collect::<Result<Vec<_>>>()?;
            tracing::warn!(
                count,
                keys = ?keys,
                claim_timeout_ms,
                "Released stale job claims (likely due to worker crash)"
            );
        }
        Ok(count)
    }

    async fn view_queued(&self, limit: usize) -> Result<Vec<Job<Queued>>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM image_jobs WHERE state = 'queued' ORDER BY seq LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut queued = Vec::with_capacity(rows.len());
        for row in &rows {
            if let AnyJob::Queued(job) = job_from_row(row)? {
                queued.push(job);
            }
        }
        Ok(queued)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job<DeadLettered>>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM image_jobs WHERE state = 'dead_lettered' \
             ORDER BY finished_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut dead = Vec::with_capacity(rows.len());
        for row in &rows {
            if let AnyJob::DeadLettered(job) = job_from_row(row)? {
                dead.push(job);
            }
        }
        Ok(dead)
    }
}
