//! Recording mailer.

use crate::lock;
use editions_core::BoxFuture;
use editions_core::notify::{Mailer, MailerError, MessageContent, Recipient, TemplateType};
use std::collections::HashSet;
use std::future::ready;
use std::sync::Mutex;

/// A message accepted by [`RecordingMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Recipient.
    pub recipient: Recipient,
    /// Template.
    pub template: TemplateType,
    /// Variables.
    pub content: MessageContent,
}

/// [`Mailer`] that records messages instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMessage>>,
    unavailable_for: Mutex<HashSet<String>>,
    rejected_for: Mutex<HashSet<String>>,
}

impl RecordingMailer {
    /// Create a mailer that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail sends to `email` with a retryable error.
    pub fn fail_for(&self, email: impl Into<String>) {
        lock(&self.unavailable_for).insert(email.into());
    }

    /// Reject sends to `email` permanently.
    pub fn reject(&self, email: impl Into<String>) {
        lock(&self.rejected_for).insert(email.into());
    }

    /// Let sends to `email` succeed again.
    pub fn recover(&self, email: &str) {
        lock(&self.unavailable_for).remove(email);
        lock(&self.rejected_for).remove(email);
    }

    /// Messages accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    /// Messages accepted for `email`.
    #[must_use]
    pub fn sent_to(&self, email: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.recipient.email == email)
            .collect()
    }
}

impl Mailer for RecordingMailer {
    fn send(
        &self,
        recipient: &Recipient,
        template: TemplateType,
        content: &MessageContent,
    ) -> BoxFuture<'_, Result<(), MailerError>> {
        let result = if lock(&self.rejected_for).contains(&recipient.email) {
            Err(MailerError::Rejected(recipient.email.clone()))
        } else if lock(&self.unavailable_for).contains(&recipient.email) {
            Err(MailerError::Unavailable(recipient.email.clone()))
        } else {
            lock(&self.sent).push(SentMessage {
                recipient: recipient.clone(),
                template,
                content: content.clone(),
            });
            Ok(())
        };
        Box::pin(ready(result))
    }
}
