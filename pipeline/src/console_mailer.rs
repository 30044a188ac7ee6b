//! Console mailer for development.

use editions_core::BoxFuture;
use editions_core::notify::{Mailer, MailerError, MessageContent, Recipient, TemplateType};
use std::future::ready;
use tracing::info;

/// Mailer that logs messages instead of sending them.
///
/// Used by the worker when no mail provider is configured.
#[derive(Clone, Debug, Default)]
pub struct ConsoleMailer;

impl ConsoleMailer {
    /// Create a console mailer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Mailer for ConsoleMailer {
    fn send(
        &self,
        recipient: &Recipient,
        template: TemplateType,
        content: &MessageContent,
    ) -> BoxFuture<'_, Result<(), MailerError>> {
        let variables = content
            .variables
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            to = %recipient.email,
            name = recipient.name.as_deref().unwrap_or(""),
            template = %template,
            subject = content.subject.as_deref().unwrap_or(""),
            variables = %variables,
            "📧 Message (Development Mode)"
        );
        Box::pin(ready(Ok(())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_mailer_accepts_everything() {
        let mailer = ConsoleMailer::new();
        let content = MessageContent::default().with_var("edition_number", 3);
        mailer
            .send(
                &Recipient::address("ops@example.com"),
                TemplateType::EditionReleased,
                &content,
            )
            .await
            .unwrap();
    }
}
