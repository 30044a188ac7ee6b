//! Queue workers.
//!
//! A [`QueueWorker`] owns one logical queue and one [`JobHandler`]. Each of its
//! tasks runs a claim → handle → settle loop:
//!
//! ```text
//! loop {
//!     shutdown requested?  -> stop
//!     claim one due job    -> none: sleep(poll_interval)
//!     handler.handle(job)
//!         Ok                         -> complete
//!         Retryable, attempts left   -> retry_later(now + backoff + jitter)
//!         Fatal or attempts exhausted-> bury (kept as failed)
//! }
//! ```
//!
//! Settling is guarded by the claim: if the lease ran out while the handler
//! was busy and another worker picked the job up, the stale worker leaves the
//! job alone and reports [`JobOutcome::LeaseLost`].
//!
//! Shutdown is only observed between jobs, so an in-flight job always runs to
//! completion and gets settled.

use crate::metrics::JobMetrics;
use chrono::{DateTime, Utc};
use editions_core::BoxFuture;
use editions_core::environment::Clock;
use editions_core::queue::{Job, JobQueue, QueueError, QueueName};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

/// Failure reported by a [`JobHandler`].
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the queue may try again.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; the job goes straight to the failed state.
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    /// A retryable failure.
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }

    /// A fatal failure.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }

    /// Whether the queue should attempt the job again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("invalid job payload: {err}"))
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Backend(_) => Self::Retryable(err.to_string()),
            QueueError::Payload(_) | QueueError::NotFound(_) => Self::Fatal(err.to_string()),
        }
    }
}

/// Processes the jobs of one queue.
pub trait JobHandler: Send + Sync {
    /// Handle one claimed job.
    ///
    /// Handlers must tolerate redelivery of the same job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Retryable`] for transient failures and
    /// [`JobError::Fatal`] for failures that retrying cannot fix.
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<(), JobError>>;
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent tasks per queue.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How long a claimed job stays invisible to other workers.
    pub lease: Duration,
    /// Upper bound of the random delay added to retry backoff.
    pub max_jitter: Duration,
    /// Sleep after a queue backend error.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(300),
            max_jitter: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Set concurrency.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the empty-queue poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the retry jitter bound.
    #[must_use]
    pub const fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }
}

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded.
    Completed,
    /// Handler failed; the job is due again at `run_at`.
    Retried {
        /// Next attempt time.
        run_at: DateTime<Utc>,
    },
    /// Job moved to the failed state.
    Buried {
        /// Final error.
        reason: String,
    },
    /// The lease expired before the job was settled; whoever holds it now
    /// decides its fate.
    LeaseLost,
}

/// Polls one queue and dispatches its jobs to a handler.
pub struct QueueWorker {
    name: String,
    queue: QueueName,
    jobs: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl QueueWorker {
    /// Create a worker with default tuning.
    #[must_use]
    pub fn new(
        queue: QueueName,
        jobs: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: format!("{queue}-worker"),
            queue,
            jobs,
            handler,
            clock,
            config: WorkerConfig::default(),
        }
    }

    /// Replace the tuning.
    #[must_use]
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the name used in logs and worker ids.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue this worker consumes.
    #[must_use]
    pub const fn queue(&self) -> QueueName {
        self.queue
    }

    /// Spawn `concurrency` polling tasks.
    ///
    /// Each task stops once `shutdown` fires (or its sender is dropped) after
    /// settling the job it is working on.
    #[must_use]
    pub fn spawn(self, shutdown: &broadcast::Receiver<()>) -> Vec<tokio::task::JoinHandle<()>> {
        let concurrency = self.config.concurrency.max(1);
        let worker = Arc::new(self);
        (0..concurrency)
            .map(|index| {
                let worker = Arc::clone(&worker);
                let shutdown = shutdown.resubscribe();
                let worker_id = format!("{}-{index}-{}", worker.name, uuid::Uuid::new_v4().simple());
                tokio::spawn(async move { worker.run(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run(&self, worker_id: String, mut shutdown: broadcast::Receiver<()>) {
        info!(worker = %worker_id, queue = %self.queue, "Queue worker started");

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Closed | TryRecvError::Lagged(_)) => break,
            }

            let idle = match self.run_once(&worker_id).await {
                Ok(Some(_)) => None,
                Ok(None) => Some(self.config.poll_interval),
                Err(e) => {
                    error!(worker = %worker_id, queue = %self.queue, error = %e, "Queue backend error");
                    Some(self.config.error_backoff)
                }
            };

            if let Some(delay) = idle {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(worker = %worker_id, queue = %self.queue, "Queue worker stopped");
    }

    /// Claim and process at most one due job.
    ///
    /// Returns `None` when nothing is due.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if claiming or settling the job fails. The job
    /// then becomes claimable again once its lease expires.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self
            .jobs
            .claim(self.queue, worker_id, self.config.lease)
            .await?
        else {
            return Ok(None);
        };

        self.process(job).await.map(Some)
    }

    /// Process due jobs until none is left.
    ///
    /// Jobs rescheduled into the future are not picked up again, so this
    /// terminates for any handler.
    ///
    /// # Errors
    ///
    /// Returns the first [`QueueError`].
    pub async fn drain(&self) -> Result<Vec<JobOutcome>, QueueError> {
        let worker_id = format!("{}-drain", self.name);
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once(&worker_id).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn process(&self, job: Job) -> Result<JobOutcome, QueueError> {
        match self.handle_and_settle(&job).await {
            Err(QueueError::LeaseLost(job_id)) => {
                warn!(
                    job_id = %job_id,
                    job = %job.name,
                    attempt = job.attempts_made,
                    "Lease expired before the job was settled, leaving it to the new holder"
                );
                Ok(JobOutcome::LeaseLost)
            }
            other => other,
        }
    }

    async fn handle_and_settle(&self, job: &Job) -> Result<JobOutcome, QueueError> {
        debug!(job_id = %job.id, job = %job.name, attempt = job.attempts_made, "Processing job");
        let started = Instant::now();

        match self.handler.handle(job).await {
            Ok(()) => {
                self.jobs.complete(job).await?;
                JobMetrics::record_completed(self.queue, started.elapsed());
                debug!(job_id = %job.id, job = %job.name, "Job completed");
                Ok(JobOutcome::Completed)
            }
            Err(e) if e.is_retryable() && job.has_attempts_left() => {
                let delay = job
                    .backoff
                    .delay_for_attempt(job.attempts_made.saturating_sub(1))
                    + jitter(self.config.max_jitter);
                let run_at = self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.jobs.retry_later(job, &e.to_string(), run_at).await?;
                JobMetrics::record_retried(self.queue);
                warn!(
                    job_id = %job.id,
                    job = %job.name,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    %run_at,
                    error = %e,
                    "Job failed, retry scheduled"
                );
                Ok(JobOutcome::Retried { run_at })
            }
            Err(e) => {
                let reason = e.to_string();
                self.jobs.bury(job, &reason).await?;
                JobMetrics::record_dead(self.queue);
                error!(
                    job_id = %job.id,
                    job = %job.name,
                    attempt = job.attempts_made,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Job failed permanently"
                );
                Ok(JobOutcome::Buried { reason })
            }
        }
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn queue_errors_classify() {
        assert!(JobError::from(QueueError::Backend("down".into())).is_retryable());
        assert!(!JobError::from(QueueError::Payload("bad".into())).is_retryable());
    }
}
