//! Webhook verifier with a shared-secret signature.

use editions_core::payment::PaymentEvent;
use editions_core::webhook::{WebhookError, WebhookVerifier};

/// Accepts bodies whose signature equals a fixed secret; the body must be a
/// JSON [`PaymentEvent`].
#[derive(Debug, Clone)]
pub struct StaticSignatureVerifier {
    secret: String,
}

impl StaticSignatureVerifier {
    /// Create a verifier for `secret`.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl WebhookVerifier for StaticSignatureVerifier {
    fn verify_and_parse(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<PaymentEvent, WebhookError> {
        if signature != self.secret {
            return Err(WebhookError::InvalidSignature);
        }
        serde_json::from_slice(raw_body).map_err(|e| WebhookError::Malformed(e.to_string()))
    }
}
