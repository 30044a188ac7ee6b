//! Financial records the settlement path reads and writes.
//!
//! Orders, payments and subscriptions are owned by the business layer; the
//! pipeline only touches the fields it needs to turn a confirmed payment into
//! entitlements.

use crate::UnknownCode;
use crate::access::PlanType;
use crate::ids::{AddressId, EditionId, OrderId, SubscriptionId, UserId};
use crate::payment::OrderType;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

/// Order settlement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created at checkout, awaiting payment.
    Pending,
    /// Payment confirmed.
    Paid,
}

impl OrderStatus {
    /// Convert status to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }

    /// Parse status from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            _ => Err(UnknownCode::new("order status", s)),
        }
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created, first payment not yet confirmed.
    Pending,
    /// Paid up for the current period.
    Active,
    /// Renewal payment missing.
    PastDue,
    /// Ended by the customer or operator.
    Cancelled,
}

impl SubscriptionStatus {
    /// Convert status to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse status from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(UnknownCode::new("subscription status", s)),
        }
    }
}

/// A subscription row after renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Row identifier.
    pub id: SubscriptionId,
    /// Subscriber.
    pub user_id: UserId,
    /// Plan tier.
    pub plan: PlanType,
    /// Status.
    pub status: SubscriptionStatus,
    /// Start of the paid period.
    pub current_period_start: DateTime<Utc>,
    /// End of the paid period.
    pub current_period_end: DateTime<Utc>,
    /// Default shipping address.
    pub address_id: Option<AddressId>,
}

/// A paid billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    /// Period start.
    pub start: DateTime<Utc>,
    /// Period end.
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// Resolve the period from provider timestamps.
    ///
    /// Missing bounds default to "start now, end one calendar month after the
    /// start".
    #[must_use]
    pub fn resolve(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let start = start.unwrap_or(now);
        let end = end.unwrap_or_else(|| one_month_after(start));
        Self { start, end }
    }
}

fn one_month_after(start: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + chrono::Duration::days(30))
}

/// A preorder order as seen by `mark_preorder_paid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidPreorder {
    /// Order identifier.
    pub order_id: OrderId,
    /// Buyer.
    pub user_id: UserId,
    /// Preordered edition.
    pub edition_id: EditionId,
    /// Plan tier bought.
    pub plan: PlanType,
    /// Shipping address, for physical plans.
    pub address_id: Option<AddressId>,
    /// False when the order was already paid before this call.
    pub newly_paid: bool,
}

/// Insert request for a paid order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    /// Order identifier.
    pub id: OrderId,
    /// Buyer.
    pub user_id: UserId,
    /// Order kind.
    pub kind: OrderType,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// External payment event that paid for the order (unique).
    pub external_event_id: String,
    /// Subscription renewed by this order.
    pub subscription_id: Option<SubscriptionId>,
    /// When the order was paid.
    pub paid_at: DateTime<Utc>,
}

/// Insert request for a payment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    /// Order paid.
    pub order_id: OrderId,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// Provider reference (the external event id).
    pub provider_reference: String,
    /// When the payment was confirmed.
    pub paid_at: DateTime<Utc>,
}

/// Insert request for a shipment of a printed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShipment {
    /// Recipient.
    pub user_id: UserId,
    /// Edition to ship.
    pub edition_id: EditionId,
    /// Destination.
    pub address_id: AddressId,
    /// Originating subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Request time.
    pub requested_at: DateTime<Utc>,
}

/// Contact details for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    /// User.
    pub user_id: UserId,
    /// Email address.
    pub email: String,
    /// Display name.
    pub name: Option<String>,
}
