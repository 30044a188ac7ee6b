//! In-memory job queue.

use crate::lock;
use chrono::{DateTime, Utc};
use editions_core::BoxFuture;
use editions_core::environment::Clock;
use editions_core::ids::JobId;
use editions_core::queue::{Job, JobHandle, JobOptions, JobQueue, JobStatus, QueueError, QueueName};
use std::collections::HashSet;
use std::future::ready;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory [`JobQueue`] driven by an injected clock.
///
/// Jobs become due when the clock reaches their `run_at`; tests either move
/// the clock or call [`make_due`](Self::make_due).
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
    clock: Arc<dyn Clock>,
    failing_names: Mutex<HashSet<String>>,
    failing_enqueue_at: Mutex<HashSet<usize>>,
    enqueue_calls: Mutex<usize>,
}

impl InMemoryJobQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            clock,
            failing_names: Mutex::new(HashSet::new()),
            failing_enqueue_at: Mutex::new(HashSet::new()),
            enqueue_calls: Mutex::new(0),
        }
    }

    /// Reject every enqueue of jobs named `name`.
    pub fn fail_enqueues_named(&self, name: &str) {
        lock(&self.failing_names).insert(name.to_string());
    }

    /// Reject the enqueue call with this 0-based index (counted from now on).
    pub fn fail_enqueue_call(&self, index: usize) {
        let base = *lock(&self.enqueue_calls);
        lock(&self.failing_enqueue_at).insert(base + index);
    }

    /// All jobs on `queue`, in enqueue order.
    #[must_use]
    pub fn jobs(&self, queue: QueueName) -> Vec<Job> {
        lock(&self.jobs)
            .iter()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect()
    }

    /// Jobs on `queue` named `name`, in enqueue order.
    #[must_use]
    pub fn jobs_named(&self, queue: QueueName, name: &str) -> Vec<Job> {
        self.jobs(queue)
            .into_iter()
            .filter(|j| j.name == name)
            .collect()
    }

    /// A job by id.
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        lock(&self.jobs).iter().find(|j| j.id == id).cloned()
    }

    /// Make every waiting job due now.
    pub fn make_due(&self) {
        let now = self.clock.now();
        for job in lock(&self.jobs).iter_mut() {
            if job.status == JobStatus::Waiting && job.run_at > now {
                job.run_at = now;
            }
        }
    }

    fn with_job(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job, DateTime<Utc>),
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        f(job, now);
        job.updated_at = now;
        Ok(())
    }

    /// Apply `f` only while `claimed` still holds the job's lease.
    fn with_leased_job(
        &self,
        claimed: &Job,
        f: impl FnOnce(&mut Job),
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .iter_mut()
            .find(|j| holds_lease(j, claimed))
            .ok_or(QueueError::LeaseLost(claimed.id))?;
        f(job);
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = now;
        Ok(())
    }

    fn injected_failure(&self, name: &str) -> bool {
        let mut calls = lock(&self.enqueue_calls);
        let index = *calls;
        *calls += 1;
        lock(&self.failing_enqueue_at).remove(&index) || lock(&self.failing_names).contains(name)
    }
}

fn holds_lease(job: &Job, claimed: &Job) -> bool {
    job.id == claimed.id && job.status == JobStatus::Active && job.locked_by == claimed.locked_by
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> BoxFuture<'_, Result<JobHandle, QueueError>> {
        if self.injected_failure(name) {
            return Box::pin(ready(Err(QueueError::Backend(format!(
                "injected enqueue fault for {name}"
            )))));
        }

        let now = self.clock.now();
        let mut jobs = lock(&self.jobs);

        if let Some(key) = &options.dedup_key {
            let existing = jobs.iter().find(|j| {
                j.queue == queue
                    && j.dedup_key.as_ref() == Some(key)
                    && matches!(j.status, JobStatus::Waiting | JobStatus::Active)
            });
            if let Some(existing) = existing {
                return Box::pin(ready(Ok(JobHandle {
                    id: existing.id,
                    deduplicated: true,
                })));
            }
        }

        let id = JobId::new();
        jobs.push(Job {
            id,
            queue,
            name: name.to_string(),
            payload,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            remove_on_complete: options.remove_on_complete,
            dedup_key: options.dedup_key,
            run_at: now + options.delay.map_or_else(chrono::Duration::zero, to_chrono),
            locked_by: None,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        Box::pin(ready(Ok(JobHandle {
            id,
            deduplicated: false,
        })))
    }

    fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> BoxFuture<'_, Result<Option<Job>, QueueError>> {
        let now = self.clock.now();
        let mut jobs = lock(&self.jobs);
        let due = jobs
            .iter_mut()
            .filter(|j| j.queue == queue)
            .filter(|j| match j.status {
                JobStatus::Waiting => j.run_at <= now,
                JobStatus::Active => j.locked_until.is_some_and(|until| until < now),
                JobStatus::Completed | JobStatus::Failed => false,
            })
            .min_by_key(|j| (j.run_at, j.created_at));
        let claimed = due.map(|job| {
            job.status = JobStatus::Active;
            job.attempts_made += 1;
            job.locked_by = Some(worker_id.to_string());
            job.locked_until = Some(now + to_chrono(lease));
            job.updated_at = now;
            job.clone()
        });
        Box::pin(ready(Ok(claimed)))
    }

    fn complete(&self, job: &Job) -> BoxFuture<'_, Result<(), QueueError>> {
        let result = if job.remove_on_complete {
            let mut jobs = lock(&self.jobs);
            let before = jobs.len();
            jobs.retain(|j| !holds_lease(j, job));
            if jobs.len() == before {
                Err(QueueError::LeaseLost(job.id))
            } else {
                Ok(())
            }
        } else {
            self.with_leased_job(job, |j| j.status = JobStatus::Completed)
        };
        Box::pin(ready(result))
    }

    fn retry_later(
        &self,
        job: &Job,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), QueueError>> {
        let result = self.with_leased_job(job, |j| {
            j.status = JobStatus::Waiting;
            j.run_at = run_at;
            j.last_error = Some(error.to_string());
        });
        Box::pin(ready(result))
    }

    fn bury(&self, job: &Job, error: &str) -> BoxFuture<'_, Result<(), QueueError>> {
        let result = self.with_leased_job(job, |j| {
            j.status = JobStatus::Failed;
            j.last_error = Some(error.to_string());
        });
        Box::pin(ready(result))
    }

    fn list_failed(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Job>, QueueError>> {
        let failed = self
            .jobs(queue)
            .into_iter()
            .filter(|j| j.status == JobStatus::Failed)
            .take(limit)
            .collect();
        Box::pin(ready(Ok(failed)))
    }

    fn requeue_failed(&self, job_id: JobId) -> BoxFuture<'_, Result<(), QueueError>> {
        let is_failed = self.job(job_id).is_some_and(|j| j.status == JobStatus::Failed);
        let result = if is_failed {
            self.with_job(job_id, |j, now| {
                j.status = JobStatus::Waiting;
                j.attempts_made = 0;
                j.run_at = now;
            })
        } else {
            Err(QueueError::NotFound(job_id))
        };
        Box::pin(ready(result))
    }

    fn count(&self, queue: QueueName, status: JobStatus) -> BoxFuture<'_, Result<u64, QueueError>> {
        let n = self.jobs(queue).iter().filter(|j| j.status == status).count();
        Box::pin(ready(Ok(u64::try_from(n).unwrap_or(u64::MAX))))
    }
}
