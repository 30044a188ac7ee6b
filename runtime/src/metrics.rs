//! Prometheus metrics for the job runtime and the pipeline services.
//!
//! Recorders are zero-sized structs with associated functions so call sites
//! read as `JobMetrics::record_completed(queue, duration)`. Without an
//! installed recorder every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use editions_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use editions_core::queue::QueueName;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter serving `/metrics` over HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime. A second call in the same
    /// process (tests) logs a warning and leaves the first recorder in place.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display`.
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Job runtime
    describe_counter!("jobs_completed_total", "Jobs that finished successfully");
    describe_counter!("jobs_retried_total", "Job attempts that failed and were rescheduled");
    describe_counter!("jobs_dead_total", "Jobs moved to the failed state");
    describe_histogram!("job_duration_seconds", "Time spent in a job handler");

    // Release engine
    describe_counter!("editions_released_total", "Editions transitioned to active");
    describe_counter!("access_unlocked_total", "Access grants unlocked by releases");
    describe_counter!("access_expired_total", "Users whose access grants were expired by sweeps");

    // Settlement
    describe_counter!("ledger_duplicates_total", "Payment events skipped as duplicates");
    describe_counter!("payments_settled_total", "Payment events settled");

    // Cache
    describe_counter!("cache_refresh_failures_total", "Per-user cache refreshes that failed");

    // Notifications
    describe_counter!(
        "notification_batches_enqueued_total",
        "Release email batches enqueued"
    );
    describe_counter!("notifications_sent_total", "Messages accepted by the mail provider");
    describe_counter!("notifications_failed_total", "Messages the mail provider refused");

    // In-process retries
    describe_counter!("retry_attempts_total", "In-process retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("retry_exhausted_total", "Operations that exhausted their retries");
}

/// Job runtime metrics recorder.
pub struct JobMetrics;

impl JobMetrics {
    /// Record a successful job.
    pub fn record_completed(queue: QueueName, duration: Duration) {
        counter!("jobs_completed_total", "queue" => queue.as_str()).increment(1);
        histogram!("job_duration_seconds", "queue" => queue.as_str())
            .record(duration.as_secs_f64());
    }

    /// Record a failed attempt that will be retried.
    pub fn record_retried(queue: QueueName) {
        counter!("jobs_retried_total", "queue" => queue.as_str()).increment(1);
    }

    /// Record a job moved to the failed state.
    pub fn record_dead(queue: QueueName) {
        counter!("jobs_dead_total", "queue" => queue.as_str()).increment(1);
    }
}

/// Release engine metrics recorder.
pub struct ReleaseMetrics;

impl ReleaseMetrics {
    /// Record a release and the grants it unlocked.
    pub fn record_release(unlocked: usize) {
        counter!("editions_released_total").increment(1);
        counter!("access_unlocked_total").increment(as_u64(unlocked));
    }

    /// Record users whose grants a sweep expired.
    pub fn record_expired(count: usize) {
        counter!("access_expired_total").increment(as_u64(count));
    }
}

/// Settlement metrics recorder.
pub struct SettlementMetrics;

impl SettlementMetrics {
    /// Record a delivery skipped by the ledger.
    pub fn record_duplicate(stage: &'static str) {
        counter!("ledger_duplicates_total", "stage" => stage).increment(1);
    }

    /// Record a settled payment event.
    pub fn record_settled(job_name: &str) {
        counter!("payments_settled_total", "job" => job_name.to_string()).increment(1);
    }

    /// Record an outcome that could not be written to the ledger.
    pub fn record_outcome_lost(job_name: &str) {
        counter!("ledger_outcomes_lost_total", "job" => job_name.to_string()).increment(1);
    }
}

/// Cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record failed per-user refreshes.
    pub fn record_refresh_failures(count: usize) {
        counter!("cache_refresh_failures_total").increment(as_u64(count));
    }
}

/// Notification metrics recorder.
pub struct NotificationMetrics;

impl NotificationMetrics {
    /// Record an enqueued release batch.
    pub fn record_batch_enqueued() {
        counter!("notification_batches_enqueued_total").increment(1);
    }

    /// Record messages accepted by the provider.
    pub fn record_sent(count: usize) {
        counter!("notifications_sent_total").increment(as_u64(count));
    }

    /// Record messages the provider refused.
    pub fn record_failed(count: usize) {
        counter!("notifications_failed_total").increment(as_u64(count));
    }
}

/// In-process retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

fn as_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}
