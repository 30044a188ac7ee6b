//! Durable named work queues.
//!
//! Delivery is at-least-once with no ordering guarantee. Handlers must be
//! idempotent under redelivery: payment jobs through the event ledger,
//! everything else through conditional updates and upserts.

use crate::ids::JobId;
use crate::{BoxFuture, UnknownCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// The three logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Outbound messages.
    Email,
    /// Payment settlement.
    Payments,
    /// Edition release timers and sweeps.
    Editions,
}

impl QueueName {
    /// All queues, in worker start-up order.
    pub const ALL: [Self; 3] = [Self::Email, Self::Payments, Self::Editions];

    /// Convert queue name to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Payments => "payments",
            Self::Editions => "editions",
        }
    }

    /// Parse queue name from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known queue.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "email" => Ok(Self::Email),
            "payments" => Ok(Self::Payments),
            "editions" => Ok(Self::Editions),
            _ => Err(UnknownCode::new("queue", s)),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Due at `run_at`.
    Waiting,
    /// Claimed by a worker until its lease expires.
    Active,
    /// Finished (kept only when `remove_on_complete` is false).
    Completed,
    /// Attempts exhausted or fatal error. Retained for operators.
    Failed,
}

impl JobStatus {
    /// Convert status to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse status from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownCode::new("job status", s)),
        }
    }
}

/// Delay policy between job attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `base * 2^attempt`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "duration_millis")]
        base: Duration,
        /// Upper bound.
        #[serde(with = "duration_millis")]
        max: Duration,
    },
    /// Same delay every time.
    Fixed {
        /// Delay between attempts.
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
}

impl BackoffPolicy {
    /// Exponential backoff with a one-hour cap.
    #[must_use]
    pub const fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            max: Duration::from_secs(3600),
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let multiplier = 2_u32.saturating_pow(attempt);
                base.saturating_mul(multiplier).min(max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(5))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-job delivery options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay policy between attempts.
    pub backoff: BackoffPolicy,
    /// Delete the job on success instead of keeping it as completed.
    pub remove_on_complete: bool,
    /// Collapse enqueues while a job with the same key is waiting or active.
    pub dedup_key: Option<String>,
    /// Initial delay before the first attempt.
    pub delay: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            remove_on_complete: true,
            dedup_key: None,
            delay: None,
        }
    }
}

impl JobOptions {
    /// Set the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keep completed jobs instead of deleting them.
    #[must_use]
    pub const fn keep_on_complete(mut self) -> Self {
        self.remove_on_complete = false;
        self
    }

    /// Set the deduplication key.
    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Delay the first attempt.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier.
    pub id: JobId,
    /// Queue the job lives on.
    pub queue: QueueName,
    /// Job name, used by handlers to dispatch.
    pub name: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: JobStatus,
    /// Attempts started so far (incremented on claim).
    pub attempts_made: u32,
    /// Attempt limit.
    pub max_attempts: u32,
    /// Delay policy.
    pub backoff: BackoffPolicy,
    /// Delete on success.
    pub remove_on_complete: bool,
    /// Deduplication key.
    pub dedup_key: Option<String>,
    /// When the job is next due.
    pub run_at: DateTime<Utc>,
    /// Worker holding the lease.
    pub locked_by: Option<String>,
    /// Lease expiry.
    pub locked_until: Option<DateTime<Utc>>,
    /// Last error.
    pub last_error: Option<String>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether another attempt is allowed after the current one.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    /// Job identifier (the existing job's when deduplicated).
    pub id: JobId,
    /// True when an equivalent job was already waiting or active.
    pub deduplicated: bool,
}

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend failure.
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// Payload could not be encoded or decoded.
    #[error("Queue payload error: {0}")]
    Payload(String),

    /// Job does not exist (or is not in the expected state).
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The claim that produced this job expired and the job was settled or
    /// reclaimed by someone else.
    #[error("Lease lost on job {0}")]
    LeaseLost(JobId),
}

impl From<UnknownCode> for QueueError {
    fn from(err: UnknownCode) -> Self {
        Self::Payload(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

/// Producer and consumer side of the durable work queues.
pub trait JobQueue: Send + Sync {
    /// Enqueue a job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the job cannot be persisted.
    fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> BoxFuture<'_, Result<JobHandle, QueueError>>;

    /// Claim one due job for `worker_id`, holding it for `lease`.
    ///
    /// Due means waiting with `run_at <= now`, or active with an expired lease.
    /// Claiming increments `attempts_made`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the backend fails.
    fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> BoxFuture<'_, Result<Option<Job>, QueueError>>;

    /// Mark a claimed job done.
    ///
    /// `complete`, `retry_later` and `bury` only act while the job is still
    /// active under the claim that returned `job` (same `locked_by`).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseLost`] if the claim no longer holds the job.
    fn complete(&self, job: &Job) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Return a claimed job to waiting, due at `run_at`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseLost`] if the claim no longer holds the job.
    fn retry_later(
        &self,
        job: &Job,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Move a claimed job to the failed state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseLost`] if the claim no longer holds the job.
    fn bury(&self, job: &Job, error: &str) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Failed jobs on a queue, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the backend fails.
    fn list_failed(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Job>, QueueError>>;

    /// Put a failed job back to waiting with its attempts reset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if no failed job has this id.
    fn requeue_failed(&self, job_id: JobId) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Number of jobs on `queue` in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the backend fails.
    fn count(&self, queue: QueueName, status: JobStatus) -> BoxFuture<'_, Result<u64, QueueError>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(9));
    }

    #[test]
    fn backoff_serializes_as_millis() {
        let json = serde_json::to_value(BackoffPolicy::exponential(Duration::from_secs(2))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "exponential", "base": 2000, "max": 3_600_000 })
        );
        let back: BackoffPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, BackoffPolicy::exponential(Duration::from_secs(2)));
    }

    #[test]
    fn options_builder() {
        let options = JobOptions::default()
            .with_max_attempts(5)
            .with_dedup_key("release:3")
            .keep_on_complete();
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.dedup_key.as_deref(), Some("release:3"));
        assert!(!options.remove_on_complete);
    }

    #[test]
    fn queue_names() {
        for queue in QueueName::ALL {
            assert_eq!(QueueName::parse(queue.as_str()).unwrap(), queue);
        }
        assert_eq!(QueueName::Payments.to_string(), "payments");
    }
}
