//! Editions-queue jobs and their producers.

use crate::release::{ReleaseEngine, ReleaseOutcome};
use chrono::NaiveDate;
use editions_core::BoxFuture;
use editions_core::queue::{Job, JobHandle, JobOptions, JobQueue, QueueError, QueueName};
use editions_runtime::{JobError, JobHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Release one edition by number.
pub const RELEASE_JOB: &str = "edition.release";

/// Release whatever edition is due today.
pub const RELEASE_NEXT_JOB: &str = "edition.release-next";

/// Expire lapsed grants.
pub const EXPIRE_SWEEP_JOB: &str = "access.expire-sweep";

/// Payload of [`RELEASE_JOB`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseJob {
    /// Edition to release.
    pub edition_number: i32,
}

/// Handler for the editions queue.
pub struct EditionJobHandler {
    engine: Arc<ReleaseEngine>,
}

impl EditionJobHandler {
    /// Create a handler driving `engine`.
    #[must_use]
    pub const fn new(engine: Arc<ReleaseEngine>) -> Self {
        Self { engine }
    }

    async fn run(&self, job: &Job) -> Result<(), JobError> {
        match job.name.as_str() {
            RELEASE_JOB => {
                let ReleaseJob { edition_number } = job.payload_as()?;
                let outcome = self.engine.release_edition(edition_number).await?;
                log_outcome(job, &outcome);
            }
            RELEASE_NEXT_JOB => {
                if let Some(outcome) = self.engine.release_next_pending_edition().await? {
                    log_outcome(job, &outcome);
                }
            }
            EXPIRE_SWEEP_JOB => {
                self.engine.expire_lapsed_access().await?;
            }
            other => return Err(JobError::fatal(format!("unknown editions job: {other}"))),
        }
        Ok(())
    }
}

fn log_outcome(job: &Job, outcome: &ReleaseOutcome) {
    match outcome {
        ReleaseOutcome::Released(release) => info!(
            job_id = %job.id,
            edition_number = release.edition.number,
            unlocked = release.unlocked_count,
            cache_failed = release.cache.failed,
            batches = release.notifications.batches_enqueued,
            failed_batches = release.notifications.failed_batches,
            "Release job finished"
        ),
        ReleaseOutcome::NoOp {
            edition_number,
            current_status,
        } => info!(
            job_id = %job.id,
            edition_number,
            status = %current_status,
            "Release job was a no-op"
        ),
    }
}

impl JobHandler for EditionJobHandler {
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(self.run(job))
    }
}

/// Enqueue the release of edition `edition_number`.
///
/// # Errors
///
/// Returns [`QueueError`] if the job cannot be enqueued.
pub async fn schedule_release(
    queue: &dyn JobQueue,
    edition_number: i32,
) -> Result<JobHandle, QueueError> {
    let payload = serde_json::to_value(ReleaseJob { edition_number })?;
    queue
        .enqueue(
            QueueName::Editions,
            RELEASE_JOB,
            payload,
            JobOptions::default().with_dedup_key(format!("release:{edition_number}")),
        )
        .await
}

/// Enqueue a release check keyed on `today`.
///
/// Calls collapse onto one job only while that job is waiting or active. Once
/// it has finished, the next call enqueues a fresh check even on the same day;
/// releasing is idempotent, so the extra check is a no-op.
///
/// # Errors
///
/// Returns [`QueueError`] if the job cannot be enqueued.
pub async fn schedule_release_next(
    queue: &dyn JobQueue,
    today: NaiveDate,
) -> Result<JobHandle, QueueError> {
    queue
        .enqueue(
            QueueName::Editions,
            RELEASE_NEXT_JOB,
            serde_json::Value::Null,
            JobOptions::default().with_dedup_key(format!("release-next:{today}")),
        )
        .await
}

/// Enqueue an expiry sweep unless one is already pending.
///
/// # Errors
///
/// Returns [`QueueError`] if the job cannot be enqueued.
pub async fn schedule_expiry_sweep(queue: &dyn JobQueue) -> Result<JobHandle, QueueError> {
    queue
        .enqueue(
            QueueName::Editions,
            EXPIRE_SWEEP_JOB,
            serde_json::Value::Null,
            JobOptions::default().with_dedup_key(EXPIRE_SWEEP_JOB),
        )
        .await
}
