//! Webhook intake: verify, de-duplicate, enqueue.

use crate::error::IntakeError;
use editions_core::ids::JobId;
use editions_core::ledger::{EventLedger, LedgerStatus};
use editions_core::queue::{BackoffPolicy, JobOptions, JobQueue, QueueError, QueueName};
use editions_core::webhook::WebhookVerifier;
use editions_runtime::metrics::SettlementMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What [`PaymentIntake::receive`] did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// A settlement job was enqueued.
    Enqueued {
        /// External event id.
        event_id: String,
        /// New job.
        job_id: JobId,
    },
    /// The ledger already marks the event handled.
    Duplicate {
        /// External event id.
        event_id: String,
    },
    /// A settlement job for the event is already waiting or running.
    AlreadyQueued {
        /// External event id.
        event_id: String,
        /// The existing job.
        job_id: JobId,
    },
}

/// Entry point for signed payment-provider notifications.
///
/// Intake never settles anything itself. The ledger check here only avoids
/// enqueueing work for events already HANDLED; the settlement worker's own
/// ledger claim is what guarantees at-most-once.
pub struct PaymentIntake {
    verifier: Arc<dyn WebhookVerifier>,
    ledger: Arc<dyn EventLedger>,
    queue: Arc<dyn JobQueue>,
    options: JobOptions,
}

impl PaymentIntake {
    /// Create an intake with the default settlement job options: 5 attempts,
    /// exponential backoff from 10 seconds.
    #[must_use]
    pub fn new(
        verifier: Arc<dyn WebhookVerifier>,
        ledger: Arc<dyn EventLedger>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            verifier,
            ledger,
            queue,
            options: JobOptions::default()
                .with_max_attempts(5)
                .with_backoff(BackoffPolicy::exponential(Duration::from_secs(10))),
        }
    }

    /// Replace the settlement job options. The dedup key is always the event id.
    #[must_use]
    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Verify `raw_body` against `signature` and enqueue its settlement.
    ///
    /// # Errors
    ///
    /// - [`IntakeError::Webhook`] for bad signatures or payloads; the provider
    ///   should not resend as-is
    /// - [`IntakeError::Ledger`] / [`IntakeError::Queue`] for backend failures;
    ///   the provider should resend
    pub async fn receive(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<IntakeOutcome, IntakeError> {
        let event = self.verifier.verify_and_parse(raw_body, signature)?;
        let event_id = event.event_id.clone();

        if let Some(entry) = self.ledger.find(&event_id).await? {
            if entry.status == LedgerStatus::Handled {
                SettlementMetrics::record_duplicate("intake");
                info!(event_id = %event_id, "Payment event already handled, ignoring delivery");
                return Ok(IntakeOutcome::Duplicate { event_id });
            }
        }

        let name = event.kind.job_name();
        let payload = event.to_payload().map_err(QueueError::from)?;
        let handle = self
            .queue
            .enqueue(
                QueueName::Payments,
                name,
                payload,
                self.options.clone().with_dedup_key(event_id.clone()),
            )
            .await?;

        if handle.deduplicated {
            info!(event_id = %event_id, job_id = %handle.id, "Payment event already queued");
            return Ok(IntakeOutcome::AlreadyQueued {
                event_id,
                job_id: handle.id,
            });
        }
        info!(event_id = %event_id, job = name, job_id = %handle.id, "Payment event enqueued");
        Ok(IntakeOutcome::Enqueued {
            event_id,
            job_id: handle.id,
        })
    }
}
