//! Error types for the pipeline services.
//!
//! Every error classifies itself: [`is_retryable`](ReleaseError::is_retryable)
//! is true only for transient infrastructure failures. Duplicate deliveries are
//! not errors at all; they are skipped before any of these are produced.

use editions_core::ids::{EditionId, OrderId, SubscriptionId, UserId};
use editions_core::ledger::LedgerError;
use editions_core::payment::MissingField;
use editions_core::queue::QueueError;
use editions_core::store::StoreError;
use editions_core::webhook::WebhookError;
use editions_runtime::JobError;
use thiserror::Error;

/// Errors from the release engine.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// No edition has this number.
    #[error("Edition #{0} not found")]
    EditionNotFound(i32),

    /// The release transaction failed and was rolled back.
    #[error("Release store error: {0}")]
    Store(#[from] StoreError),
}

impl ReleaseError {
    /// Whether the release may succeed if attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::EditionNotFound(_) => false,
            Self::Store(e) => e.is_retryable(),
        }
    }
}

impl From<ReleaseError> for JobError {
    fn from(err: ReleaseError) -> Self {
        if err.is_retryable() {
            Self::retryable(err)
        } else {
            Self::fatal(err)
        }
    }
}

/// Errors from payment settlement.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// The event kind is acknowledged but not handled by settlement.
    #[error("Unsupported payment event: {0}")]
    Unsupported(String),

    /// A required identifier is missing from the event.
    #[error(transparent)]
    MissingField(#[from] MissingField),

    /// Required configuration is missing.
    #[error("Settlement configuration error: {0}")]
    Config(String),

    /// The preorder being paid does not exist.
    #[error("Preorder {0} not found")]
    PreorderNotFound(OrderId),

    /// The subscription being renewed does not exist.
    #[error("Subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    /// The edition referenced by an order does not exist.
    #[error("Edition {0} not found")]
    EditionNotFound(EditionId),

    /// The paying user does not exist.
    #[error("User {0} not found")]
    UserNotFound(UserId),

    /// Store failure; the settlement transaction was rolled back.
    #[error("Settlement store error: {0}")]
    Store(#[from] StoreError),

    /// Ledger failure.
    #[error("Settlement ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The branch ran but its outcome never reached the ledger, which still
    /// holds the entry as PROCESSING and will skip redeliveries.
    #[error("Payment event outcome {status} not recorded, entry left processing: {source}")]
    OutcomeNotRecorded {
        /// Status that should have been written.
        status: &'static str,
        /// Last ledger error.
        source: LedgerError,
    },

    /// Enqueue failure.
    #[error("Settlement queue error: {0}")]
    Queue(#[from] QueueError),

    /// A message that is the whole effect of the event could not be queued.
    #[error("Settlement notification error: {0}")]
    Notification(#[from] FanoutError),
}

impl SettlementError {
    /// Whether the job should be attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Ledger(e) => matches!(e, LedgerError::Database(_)),
            Self::Queue(e) => matches!(e, QueueError::Backend(_)),
            Self::Notification(e) => e.is_retryable(),
            Self::Unsupported(_)
            | Self::OutcomeNotRecorded { .. }
            | Self::MissingField(_)
            | Self::Config(_)
            | Self::PreorderNotFound(_)
            | Self::SubscriptionNotFound(_)
            | Self::EditionNotFound(_)
            | Self::UserNotFound(_) => false,
        }
    }
}

impl From<SettlementError> for JobError {
    fn from(err: SettlementError) -> Self {
        if err.is_retryable() {
            Self::retryable(err)
        } else {
            Self::fatal(err)
        }
    }
}

/// Errors from notification fan-out and dispatch.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// A message job could not be enqueued.
    #[error("Notification enqueue failed: {0}")]
    Enqueue(#[from] QueueError),

    /// A message payload could not be encoded.
    #[error("Notification payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// No recipient of a batch could be served.
    #[error("All {failed} deliveries failed: {last_error}")]
    Delivery {
        /// Recipients that failed.
        failed: usize,
        /// Whether any failure may succeed later.
        retryable: bool,
        /// Last provider error.
        last_error: String,
    },
}

impl FanoutError {
    /// Whether the job should be attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Enqueue(e) => matches!(e, QueueError::Backend(_)),
            Self::Payload(_) => false,
            Self::Delivery { retryable, .. } => *retryable,
        }
    }
}

impl From<FanoutError> for JobError {
    fn from(err: FanoutError) -> Self {
        if err.is_retryable() {
            Self::retryable(err)
        } else {
            Self::fatal(err)
        }
    }
}

/// Errors from webhook intake.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// Signature or payload rejected; the provider should not resend as-is.
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// Ledger lookup failed.
    #[error("Intake ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The settlement job could not be enqueued.
    #[error("Intake queue error: {0}")]
    Queue(#[from] QueueError),
}

impl IntakeError {
    /// Whether the provider should redeliver.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Webhook(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_errors_classify() {
        assert!(!ReleaseError::EditionNotFound(3).is_retryable());
        assert!(ReleaseError::Store(StoreError::Database("timeout".into())).is_retryable());
        assert!(!ReleaseError::Store(StoreError::Decode("bad".into())).is_retryable());
    }

    #[test]
    fn settlement_errors_map_to_job_errors() {
        let job: JobError = SettlementError::Unsupported("payment.failed".into()).into();
        assert!(!job.is_retryable());

        let job: JobError = SettlementError::Store(StoreError::Database("down".into())).into();
        assert!(job.is_retryable());

        let job: JobError = SettlementError::Queue(QueueError::Backend("down".into())).into();
        assert!(job.is_retryable());
    }

    #[test]
    fn delivery_error_keeps_retryability() {
        let err = FanoutError::Delivery {
            failed: 2,
            retryable: false,
            last_error: "rejected".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "All 2 deliveries failed: rejected");
    }
}
