//! Inbound payment-provider notifications.

use crate::payment::PaymentEvent;
use thiserror::Error;

/// Errors from webhook verification.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Signature header missing or not matching the body.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Body verified but is not a recognizable payment event.
    #[error("Malformed webhook payload: {0}")]
    Malformed(String),

    /// Verified event type outside the pipeline.
    #[error("Unsupported webhook event type: {0}")]
    UnsupportedType(String),
}

/// Verifies signed provider notifications and normalizes them.
///
/// Verification is CPU-only, so the call is synchronous.
pub trait WebhookVerifier: Send + Sync {
    /// Check `signature` against `raw_body` and parse the normalized event.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidSignature`] when the signature does not
    /// match, or a parse error for unusable payloads.
    fn verify_and_parse(&self, raw_body: &[u8], signature: &str)
    -> Result<PaymentEvent, WebhookError>;
}
