//! Outbound templated messages.

use crate::ids::UserId;
use crate::{BoxFuture, UnknownCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Who a message goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// Email address.
    pub email: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Owning user, when the recipient is a customer.
    #[serde(default)]
    pub user_id: Option<UserId>,
}

impl Recipient {
    /// A customer recipient.
    #[must_use]
    pub fn user(user_id: UserId, email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
            user_id: Some(user_id),
        }
    }

    /// An internal (non-customer) recipient.
    #[must_use]
    pub fn address(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            user_id: None,
        }
    }
}

/// Message templates known to the mail provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    /// Edition unlocked for a digital reader.
    EditionReleased,
    /// Printed edition is about to ship.
    EditionShipping,
    /// Preorder payment confirmed.
    PreorderConfirmed,
    /// First subscription payment confirmed.
    SubscriptionStarted,
    /// Renewal payment confirmed.
    SubscriptionRenewed,
    /// Internal notice that the provider created a subscription.
    AdminSubscriptionCreated,
}

impl TemplateType {
    /// Convert template to its provider code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EditionReleased => "edition_released",
            Self::EditionShipping => "edition_shipping",
            Self::PreorderConfirmed => "preorder_confirmed",
            Self::SubscriptionStarted => "subscription_started",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::AdminSubscriptionCreated => "admin_subscription_created",
        }
    }

    /// Parse template from its provider code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known template.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "edition_released" => Ok(Self::EditionReleased),
            "edition_shipping" => Ok(Self::EditionShipping),
            "preorder_confirmed" => Ok(Self::PreorderConfirmed),
            "subscription_started" => Ok(Self::SubscriptionStarted),
            "subscription_renewed" => Ok(Self::SubscriptionRenewed),
            "admin_subscription_created" => Ok(Self::AdminSubscriptionCreated),
            _ => Err(UnknownCode::new("template", s)),
        }
    }
}

impl std::fmt::Display for TemplateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Subject line override.
    #[serde(default)]
    pub subject: Option<String>,
    /// Substitution variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl MessageContent {
    /// Set the subject line.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Add a substitution variable.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.variables.insert(key.into(), value.to_string());
        self
    }
}

/// Errors from the mail provider.
#[derive(Debug, Error)]
pub enum MailerError {
    /// Provider throttled the request.
    #[error("Mail provider rate limited: {0}")]
    RateLimited(String),

    /// Provider unreachable or returned a server error.
    #[error("Mail provider unavailable: {0}")]
    Unavailable(String),

    /// Provider rejected the recipient or template.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl MailerError {
    /// Whether resending later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Unavailable(_))
    }
}

/// Outbound message provider.
pub trait Mailer: Send + Sync {
    /// Send one templated message.
    ///
    /// # Errors
    ///
    /// Returns a [`MailerError`] describing why delivery failed.
    fn send(
        &self,
        recipient: &Recipient,
        template: TemplateType,
        content: &MessageContent,
    ) -> BoxFuture<'_, Result<(), MailerError>>;
}
