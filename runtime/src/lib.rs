//! # Editions Runtime
//!
//! Generic job-processing runtime for the edition pipeline:
//!
//! - [`worker`]: [`QueueWorker`] poll loops over a [`JobQueue`](editions_core::queue::JobQueue),
//!   the [`JobHandler`] seam, and the retry / dead-letter decision
//! - [`retry`]: in-process retries with exponential backoff
//! - [`metrics`]: Prometheus exporter and metric recorders
//!
//! Nothing here knows about editions or payments; the handlers that do live in
//! `editions-pipeline`.

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Queue workers and the job handler seam
pub mod worker;

pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
pub use worker::{JobError, JobHandler, JobOutcome, QueueWorker, WorkerConfig};
