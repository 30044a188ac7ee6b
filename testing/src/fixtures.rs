//! Builders for test data.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use editions_core::access::{AccessStatus, EditionAccess, PlanType};
use editions_core::commerce::UserContact;
use editions_core::edition::{Edition, EditionStatus};
use editions_core::ids::{AccessId, EditionId, OrderId, SubscriptionId, UserId};
use editions_core::payment::{OrderType, PaymentEvent, PaymentEventKind};

/// A UTC timestamp on the hour.
///
/// Out-of-range input falls back to the Unix epoch.
#[must_use]
pub fn ts(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A calendar date.
///
/// Out-of-range input falls back to 1970-01-01.
#[must_use]
pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

/// Edition `number`, due 2026-03-01 and marked ready.
#[must_use]
pub fn edition(number: i32, status: EditionStatus) -> Edition {
    Edition {
        id: EditionId::new(),
        number,
        status,
        release_date: Some(date(2026, 3, 1)),
        ready_for_release: true,
        max_copies: None,
        released_at: None,
    }
}

/// A user with a deterministic address derived from `handle`.
#[must_use]
pub fn user(handle: &str) -> UserContact {
    UserContact {
        user_id: UserId::new(),
        email: format!("{handle}@example.com"),
        name: Some(handle.to_string()),
    }
}

/// A SCHEDULED grant of `edition` to `user_id`.
#[must_use]
pub fn scheduled_access(user_id: UserId, edition: &Edition, plan: PlanType) -> EditionAccess {
    let granted_at = ts(2026, 2, 1, 0);
    EditionAccess {
        id: AccessId::new(),
        user_id,
        edition_id: edition.id,
        status: AccessStatus::Scheduled,
        unlock_at: edition.unlock_at(granted_at),
        unlocked_at: None,
        granted_at,
        expires_at: None,
        subscription_id: None,
        access_type: plan,
    }
}

/// An ACTIVE grant of `edition` to `user_id`.
#[must_use]
pub fn active_access(user_id: UserId, edition: &Edition, plan: PlanType) -> EditionAccess {
    let mut access = scheduled_access(user_id, edition, plan);
    access.status = AccessStatus::Active;
    access.unlocked_at = Some(access.unlock_at);
    access
}

/// A successful subscription renewal event.
#[must_use]
pub fn renewal_event(
    event_id: &str,
    user_id: UserId,
    subscription_id: SubscriptionId,
    plan: PlanType,
) -> PaymentEvent {
    PaymentEvent {
        event_id: event_id.to_string(),
        kind: PaymentEventKind::PaymentSucceeded,
        order_type: OrderType::Subscription,
        user_id,
        amount_cents: 1_500,
        success: true,
        plan: Some(plan),
        subscription_id: Some(subscription_id),
        order_id: None,
        edition_id: None,
        subscription_plan_id: Some("plan_monthly".to_string()),
        address_id: None,
        is_new_subscription: false,
        period_start: None,
        period_end: None,
    }
}

/// A successful preorder payment event.
#[must_use]
pub fn preorder_event(
    event_id: &str,
    user_id: UserId,
    order_id: OrderId,
    edition_id: EditionId,
) -> PaymentEvent {
    PaymentEvent {
        event_id: event_id.to_string(),
        kind: PaymentEventKind::PaymentSucceeded,
        order_type: OrderType::Preorder,
        user_id,
        amount_cents: 2_400,
        success: true,
        plan: Some(PlanType::Digital),
        subscription_id: None,
        order_id: Some(order_id),
        edition_id: Some(edition_id),
        subscription_plan_id: None,
        address_id: None,
        is_new_subscription: false,
        period_start: None,
        period_end: None,
    }
}
