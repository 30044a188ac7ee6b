//! Normalized payment events.
//!
//! A [`PaymentEvent`] is what a [`WebhookVerifier`](crate::webhook::WebhookVerifier)
//! produces from a signed provider notification, and what travels as the
//! payload of a payments-queue job.

use crate::UnknownCode;
use crate::access::PlanType;
use crate::ids::{AddressId, EditionId, OrderId, SubscriptionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the provider is telling us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventKind {
    /// A charge succeeded.
    PaymentSucceeded,
    /// A charge failed.
    PaymentFailed,
    /// The provider confirmed a new subscription mandate.
    SubscriptionCreated,
}

impl PaymentEventKind {
    /// Job name used on the payments queue.
    #[must_use]
    pub const fn job_name(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "payment.success",
            Self::PaymentFailed => "payment.failed",
            Self::SubscriptionCreated => "subscription.created",
        }
    }

    /// Parse a payments-queue job name.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] for job names outside the settlement state machine.
    pub fn from_job_name(name: &str) -> Result<Self, UnknownCode> {
        match name {
            "payment.success" => Ok(Self::PaymentSucceeded),
            "payment.failed" => Ok(Self::PaymentFailed),
            "subscription.created" => Ok(Self::SubscriptionCreated),
            _ => Err(UnknownCode::new("payment job", name)),
        }
    }
}

/// Which kind of order a payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// One-off preorder of a single edition.
    Preorder,
    /// Recurring subscription charge.
    Subscription,
}

impl OrderType {
    /// Convert order type to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preorder => "preorder",
            Self::Subscription => "subscription",
        }
    }

    /// Parse order type from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known order type.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "preorder" => Ok(Self::Preorder),
            "subscription" => Ok(Self::Subscription),
            _ => Err(UnknownCode::new("order type", s)),
        }
    }
}

/// A required identifier was absent from a payment event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payment event {event_id} is missing {field}")]
pub struct MissingField {
    /// Event that was incomplete.
    pub event_id: String,
    /// Missing field name.
    pub field: &'static str,
}

/// Provider-agnostic payment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// External event identifier, the idempotency key.
    pub event_id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: PaymentEventKind,
    /// Order kind being settled.
    pub order_type: OrderType,
    /// Paying user.
    pub user_id: UserId,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// Provider success flag.
    pub success: bool,
    /// Plan tier, for subscriptions.
    #[serde(default)]
    pub plan: Option<PlanType>,
    /// Subscription being renewed or created.
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
    /// Preorder order being paid.
    #[serde(default)]
    pub order_id: Option<OrderId>,
    /// Preordered edition.
    #[serde(default)]
    pub edition_id: Option<EditionId>,
    /// Provider-side plan identifier.
    #[serde(default)]
    pub subscription_plan_id: Option<String>,
    /// Shipping address for physical plans.
    #[serde(default)]
    pub address_id: Option<AddressId>,
    /// Whether this charge starts a new subscription (vs. a renewal).
    #[serde(default)]
    pub is_new_subscription: bool,
    /// Provider-reported period start.
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
    /// Provider-reported period end.
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
}

impl PaymentEvent {
    fn missing(&self, field: &'static str) -> MissingField {
        MissingField {
            event_id: self.event_id.clone(),
            field,
        }
    }

    /// The subscription identifier.
    ///
    /// # Errors
    ///
    /// Returns [`MissingField`] if the event carries none.
    pub fn require_subscription_id(&self) -> Result<SubscriptionId, MissingField> {
        self.subscription_id
            .ok_or_else(|| self.missing("subscription_id"))
    }

    /// The preorder order identifier.
    ///
    /// # Errors
    ///
    /// Returns [`MissingField`] if the event carries none.
    pub fn require_order_id(&self) -> Result<OrderId, MissingField> {
        self.order_id.ok_or_else(|| self.missing("order_id"))
    }

    /// Serialize as a job payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be encoded.
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Deserialize from a job payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload is not a payment event.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}
