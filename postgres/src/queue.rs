//! `PostgreSQL` job queue over the `jobs` table.

use crate::sql_limit;
use chrono::{DateTime, Utc};
use editions_core::BoxFuture;
use editions_core::ids::JobId;
use editions_core::queue::{
    BackoffPolicy, Job, JobHandle, JobOptions, JobQueue, JobStatus, QueueError, QueueName,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Matches a job only while the claim passed as `$1` (id), `$2` (`locked_by`)
/// still holds it.
const LEASE_HELD: &str = "id = $1 AND status = 'active' AND locked_by = $2";

const JOB_COLUMNS: &str = "id, queue, name, payload, status, attempts_made, max_attempts, \
                           backoff, remove_on_complete, dedup_key, run_at, locked_by, \
                           locked_until, last_error, created_at, updated_at";

/// [`JobQueue`] backed by `PostgreSQL`.
///
/// Workers claim with `FOR UPDATE SKIP LOCKED`, so any number of worker
/// processes can poll the same queue without handing out a job twice. A job
/// whose lease expired is claimable again, which is what makes delivery
/// at-least-once when a worker dies mid-job.
///
/// Deduplication uses the partial unique index `idx_jobs_dedup`: while a job
/// with the same `(queue, dedup_key)` is waiting or active, a second enqueue
/// returns the existing job's id.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    /// Create a queue over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let backoff = serde_json::to_value(options.backoff)?;
        let delay_secs = options.delay.unwrap_or_default().as_secs_f64();
        let max_attempts = i32::try_from(options.max_attempts).unwrap_or(i32::MAX);

        // A job holding the dedup key can finish between our insert and the
        // lookup of the existing row; one more insert settles that race.
        for _ in 0..2 {
            let id = JobId::new();
            let inserted = sqlx::query(
                r"
                INSERT INTO jobs (
                    id, queue, name, payload, status, max_attempts, backoff,
                    remove_on_complete, dedup_key, run_at
                ) VALUES (
                    $1, $2, $3, $4, 'waiting', $5, $6, $7, $8,
                    now() + make_interval(secs => $9)
                )
                ON CONFLICT (queue, dedup_key)
                    WHERE dedup_key IS NOT NULL AND status IN ('waiting', 'active')
                    DO NOTHING
                RETURNING id
                ",
            )
            .bind(id.0)
            .bind(queue.as_str())
            .bind(name)
            .bind(&payload)
            .bind(max_attempts)
            .bind(&backoff)
            .bind(options.remove_on_complete)
            .bind(options.dedup_key.as_deref())
            .bind(delay_secs)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

            if inserted.is_some() {
                metrics::counter!("queue.jobs.enqueued", "queue" => queue.as_str()).increment(1);
                return Ok(JobHandle {
                    id,
                    deduplicated: false,
                });
            }

            let existing: Option<(uuid::Uuid,)> = sqlx::query_as(
                r"
                SELECT id FROM jobs
                WHERE queue = $1 AND dedup_key = $2 AND status IN ('waiting', 'active')
                ",
            )
            .bind(queue.as_str())
            .bind(options.dedup_key.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

            if let Some((existing,)) = existing {
                tracing::debug!(
                    queue = %queue,
                    job = name,
                    dedup_key = options.dedup_key.as_deref().unwrap_or_default(),
                    "Enqueue collapsed onto pending job"
                );
                metrics::counter!("queue.jobs.deduplicated", "queue" => queue.as_str())
                    .increment(1);
                return Ok(JobHandle {
                    id: JobId(existing),
                    deduplicated: true,
                });
            }
        }

        Err(QueueError::Backend(format!(
            "could not enqueue {name} on {queue}: dedup key kept changing hands"
        )))
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!(
            r"
            WITH next AS (
                SELECT id AS next_id
                FROM jobs
                WHERE queue = $1
                  AND ((status = 'waiting' AND run_at <= now())
                    OR (status = 'active' AND locked_until < now()))
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'active',
                attempts_made = attempts_made + 1,
                locked_by = $2,
                locked_until = now() + make_interval(secs => $3),
                updated_at = now()
            FROM next
            WHERE jobs.id = next.next_id
            RETURNING {JOB_COLUMNS}
            "
        ))
        .bind(queue.as_str())
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn finish(&self, job: &Job) -> Result<(), QueueError> {
        let sql = if job.remove_on_complete {
            format!("DELETE FROM jobs WHERE {LEASE_HELD}")
        } else {
            format!(
                r"
                UPDATE jobs
                SET status = 'completed', locked_by = NULL, locked_until = NULL, updated_at = now()
                WHERE {LEASE_HELD}
                "
            )
        };
        let result = sqlx::query(&sql)
            .bind(job.id.0)
            .bind(job.locked_by.as_deref())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job.id));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        job: &Job,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(&format!(
            r"
            UPDATE jobs
            SET status = 'waiting',
                run_at = $3,
                last_error = $4,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = now()
            WHERE {LEASE_HELD}
            "
        ))
        .bind(job.id.0)
        .bind(job.locked_by.as_deref())
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job.id));
        }
        Ok(())
    }

    async fn mark_failed(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(&format!(
            r"
            UPDATE jobs
            SET status = 'failed',
                last_error = $3,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = now()
            WHERE {LEASE_HELD}
            "
        ))
        .bind(job.id.0)
        .bind(job.locked_by.as_deref())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job.id));
        }
        tracing::warn!(
            job_id = %job.id,
            queue = %job.queue,
            job = %job.name,
            error = error,
            "Job moved to failed set"
        );
        Ok(())
    }

    async fn failed_jobs(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1 AND status = 'failed'
            ORDER BY updated_at ASC
            LIMIT $2
            "
        ))
        .bind(queue.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn requeue(&self, job_id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'waiting',
                attempts_made = 0,
                run_at = now(),
                updated_at = now()
            WHERE id = $1 AND status = 'failed'
            ",
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        tracing::info!(job_id = %job_id, "Failed job requeued");
        Ok(())
    }

    async fn count_jobs(&self, queue: QueueName, status: JobStatus) -> Result<u64, QueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE queue = $1 AND status = $2")
                .bind(queue.as_str())
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> BoxFuture<'_, Result<JobHandle, QueueError>> {
        let name = name.to_string();
        Box::pin(async move { self.insert(queue, &name, payload, options).await })
    }

    fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> BoxFuture<'_, Result<Option<Job>, QueueError>> {
        let worker_id = worker_id.to_string();
        Box::pin(async move { self.claim_next(queue, &worker_id, lease).await })
    }

    fn complete(&self, job: &Job) -> BoxFuture<'_, Result<(), QueueError>> {
        let job = job.clone();
        Box::pin(async move { self.finish(&job).await })
    }

    fn retry_later(
        &self,
        job: &Job,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), QueueError>> {
        let job = job.clone();
        let error = error.to_string();
        Box::pin(async move { self.reschedule(&job, &error, run_at).await })
    }

    fn bury(&self, job: &Job, error: &str) -> BoxFuture<'_, Result<(), QueueError>> {
        let job = job.clone();
        let error = error.to_string();
        Box::pin(async move { self.mark_failed(&job, &error).await })
    }

    fn list_failed(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Job>, QueueError>> {
        Box::pin(self.failed_jobs(queue, limit))
    }

    fn requeue_failed(&self, job_id: JobId) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(self.requeue(job_id))
    }

    fn count(&self, queue: QueueName, status: JobStatus) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(self.count_jobs(queue, status))
    }
}

fn row_to_job(row: &PgRow) -> Result<Job, QueueError> {
    let decode = |e: sqlx::Error| QueueError::Payload(e.to_string());
    let queue: String = row.try_get("queue").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let backoff: serde_json::Value = row.try_get("backoff").map_err(decode)?;
    let attempts_made: i32 = row.try_get("attempts_made").map_err(decode)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(decode)?;

    Ok(Job {
        id: JobId(row.try_get("id").map_err(decode)?),
        queue: QueueName::parse(&queue)?,
        name: row.try_get("name").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status: JobStatus::parse(&status)?,
        attempts_made: u32::try_from(attempts_made).unwrap_or_default(),
        max_attempts: u32::try_from(max_attempts).unwrap_or_default(),
        backoff: serde_json::from_value::<BackoffPolicy>(backoff)?,
        remove_on_complete: row.try_get("remove_on_complete").map_err(decode)?,
        dedup_key: row.try_get("dedup_key").map_err(decode)?,
        run_at: row.try_get("run_at").map_err(decode)?,
        locked_by: row.try_get("locked_by").map_err(decode)?,
        locked_until: row.try_get("locked_until").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}
