//! Settlement worker: ledger-guarded preorder and subscription payments.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{ADMIN_EMAIL, Harness, batch_of};
use editions_core::access::{AccessStatus, PlanType};
use editions_core::cache::CacheStore;
use editions_core::commerce::{OrderStatus, Subscription, SubscriptionStatus, UserContact};
use editions_core::edition::{Edition, EditionStatus};
use editions_core::environment::Clock;
use editions_core::ids::{AddressId, OrderId, SubscriptionId};
use editions_core::ledger::{EventLedger, LedgerStatus};
use editions_core::notify::TemplateType;
use editions_core::payment::{OrderType, PaymentEventKind};
use editions_core::queue::{JobQueue, QueueName};
use editions_core::store::EntitlementStore;
use editions_pipeline::fanout::SEND_MESSAGE_JOB;
use editions_pipeline::{
    EntitlementCache, IntakeOutcome, PaymentIntake, SettlementConfig, SettlementError,
    SettlementOutcome, SettlementWorker,
};
use editions_runtime::{JobOutcome, QueueWorker, WorkerConfig};
use editions_testing::{OrderRecord, StaticSignatureVerifier, fixtures};
use std::sync::Arc;
use std::time::Duration;

const SUCCEEDED: PaymentEventKind = PaymentEventKind::PaymentSucceeded;

async fn subscription(h: &Harness, user: &UserContact, plan: PlanType) -> SubscriptionId {
    let now = h.clock.now();
    let id = SubscriptionId::new();
    h.store
        .insert_subscription(Subscription {
            id,
            user_id: user.user_id,
            plan,
            status: SubscriptionStatus::PastDue,
            current_period_start: now - chrono::Duration::days(30),
            current_period_end: now,
            address_id: None,
        })
        .await;
    id
}

async fn preorder(h: &Harness, user: &UserContact, edition: &Edition) -> OrderId {
    let id = OrderId::new();
    h.store
        .insert_order(OrderRecord {
            id,
            user_id: user.user_id,
            kind: OrderType::Preorder,
            status: OrderStatus::Pending,
            amount_cents: 2_400,
            external_event_id: None,
            edition_id: Some(edition.id),
            plan: PlanType::Digital,
            address_id: None,
            subscription_id: None,
            paid_at: None,
        })
        .await;
    id
}

fn messages(h: &Harness, template: TemplateType) -> Vec<String> {
    h.email_jobs(SEND_MESSAGE_JOB)
        .iter()
        .map(batch_of)
        .filter(|batch| batch.template == template)
        .flat_map(|batch| batch.recipients.into_iter().map(|r| r.email))
        .collect()
}

#[tokio::test]
async fn renewal_is_applied_at_most_once() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_renew_1", user.user_id, sub_id, PlanType::Digital);
    let worker = h.settlement();

    assert_eq!(worker.process(SUCCEEDED, &event).await.unwrap(), SettlementOutcome::Settled);
    assert_eq!(worker.process(SUCCEEDED, &event).await.unwrap(), SettlementOutcome::Duplicate);

    let state = h.store.snapshot().await;
    assert_eq!(state.orders.len(), 1);
    assert_eq!(state.payments.len(), 1);
    assert_eq!(state.access.len(), 1);
    let entry = h.ledger.entry("evt_renew_1").unwrap();
    assert_eq!(entry.status, LedgerStatus::Handled);
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.handled_at, Some(h.clock.now()));
}

#[tokio::test]
async fn concurrent_deliveries_settle_once() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_race", user.user_id, sub_id, PlanType::Digital);
    let worker = Arc::new(h.settlement());

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let worker = Arc::clone(&worker);
            let event = event.clone();
            tokio::spawn(async move { worker.process(SUCCEEDED, &event).await.unwrap() })
        })
        .collect();
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }

    let settled = outcomes
        .iter()
        .filter(|o| **o == SettlementOutcome::Settled)
        .count();
    assert_eq!(settled, 1);
    assert_eq!(h.store.snapshot().await.orders.len(), 1);
}

#[tokio::test]
async fn renewal_grants_the_next_unseen_edition() {
    let h = Harness::new();
    let first = h.edition(1, EditionStatus::Active).await;
    let second = h.edition(2, EditionStatus::PreorderOpen).await;
    h.edition(3, EditionStatus::Pending).await;
    let user = h.user("reader").await;
    h.store
        .insert_access(fixtures::active_access(user.user_id, &first, PlanType::Digital))
        .await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_renew_2", user.user_id, sub_id, PlanType::Digital);

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    let grant = h.store.access_for(user.user_id, second.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Scheduled);
    assert_eq!(grant.subscription_id, Some(sub_id));
    assert_eq!(grant.unlock_at, fixtures::ts(2026, 3, 1, 0));

    let state = h.store.snapshot().await;
    let subscription = &state.subscriptions[&sub_id];
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.current_period_start, h.clock.now());
    assert_eq!(subscription.current_period_end, fixtures::ts(2026, 4, 1, 9));
    let order = state.orders.values().next().unwrap();
    assert_eq!(order.kind, OrderType::Subscription);
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.external_event_id.as_deref(), Some("evt_renew_2"));
    assert_eq!(state.payments[0].provider_reference, "evt_renew_2");

    assert_eq!(messages(&h, TemplateType::SubscriptionRenewed), vec!["reader@example.com"]);
    assert!(messages(&h, TemplateType::SubscriptionStarted).is_empty());
}

#[tokio::test]
async fn first_payment_sends_the_welcome_template() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("newbie").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let mut event = fixtures::renewal_event("evt_first", user.user_id, sub_id, PlanType::Digital);
    event.is_new_subscription = true;

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    assert_eq!(messages(&h, TemplateType::SubscriptionStarted), vec!["newbie@example.com"]);
    let jobs = h.email_jobs(SEND_MESSAGE_JOB);
    let batch = batch_of(&jobs[0]);
    let vars = &batch.content.variables;
    assert_eq!(vars.get("edition_number").map(String::as_str), Some("1"));
    assert_eq!(vars.get("plan").map(String::as_str), Some("digital"));
}

#[tokio::test]
async fn immediate_digital_grant_refreshes_the_cache() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_now", user.user_id, sub_id, PlanType::Digital);

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    let cached = h.cache.get_user_access(user.user_id).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert!(h.cache_store.raw(&EntitlementCache::key(user.user_id)).is_some());
}

#[tokio::test]
async fn physical_renewal_requests_a_shipment() {
    let h = Harness::new();
    let edition = h.edition(1, EditionStatus::Active).await;
    let user = h.user("collector").await;
    let sub_id = subscription(&h, &user, PlanType::Physical).await;
    let address_id = AddressId::new();
    let mut event = fixtures::renewal_event("evt_print", user.user_id, sub_id, PlanType::Digital);
    event.address_id = Some(address_id);

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    let state = h.store.snapshot().await;
    assert_eq!(state.shipments.len(), 1);
    assert_eq!(state.shipments[0].address_id, address_id);
    assert_eq!(state.shipments[0].subscription_id, Some(sub_id));
    // The subscription's plan wins over the event's.
    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.access_type, PlanType::Physical);
    // Print-only grants never reach the entitlement cache.
    assert!(h.cache_store.raw(&EntitlementCache::key(user.user_id)).is_none());
}

#[tokio::test]
async fn physical_renewal_without_address_skips_the_shipment() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("collector").await;
    let sub_id = subscription(&h, &user, PlanType::Combined).await;
    let event = fixtures::renewal_event("evt_noaddr", user.user_id, sub_id, PlanType::Combined);

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    let state = h.store.snapshot().await;
    assert!(state.shipments.is_empty());
    assert_eq!(state.access.len(), 1);
}

#[tokio::test]
async fn unknown_subscription_fails_without_retry() {
    let h = Harness::new();
    let user = h.user("ghost").await;
    let event = fixtures::renewal_event("evt_ghost", user.user_id, SubscriptionId::new(), PlanType::Digital);

    let err = h.settlement().process(SUCCEEDED, &event).await.unwrap_err();

    assert!(matches!(err, SettlementError::SubscriptionNotFound(_)));
    assert!(!err.is_retryable());
    let entry = h.ledger.entry("evt_ghost").unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert!(entry.error_message.unwrap().contains("not found"));
}

#[tokio::test]
async fn transient_store_fault_is_retried_to_handled() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_flaky", user.user_id, sub_id, PlanType::Digital);
    let worker = h.settlement();
    h.store.fail_operation("record_payment");

    let err = worker.process(SUCCEEDED, &event).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.ledger.entry("evt_flaky").unwrap().status, LedgerStatus::Failed);
    assert!(h.store.snapshot().await.orders.is_empty());

    h.store.clear_faults();
    assert_eq!(worker.process(SUCCEEDED, &event).await.unwrap(), SettlementOutcome::Settled);

    let entry = h.ledger.entry("evt_flaky").unwrap();
    assert_eq!(entry.status, LedgerStatus::Handled);
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.error_message, None);
    assert_eq!(h.store.snapshot().await.orders.len(), 1);
}

#[tokio::test]
async fn ledger_completion_is_retried_in_process() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_ledger", user.user_id, sub_id, PlanType::Digital);
    h.ledger.fail_next_completions(2);

    let outcome = h.settlement().process(SUCCEEDED, &event).await.unwrap();

    assert_eq!(outcome, SettlementOutcome::Settled);
    assert_eq!(h.ledger.entry("evt_ledger").unwrap().status, LedgerStatus::Handled);
}

#[tokio::test]
async fn unrecorded_outcome_buries_the_job() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_lost", user.user_id, sub_id, PlanType::Digital);
    let intake = PaymentIntake::new(
        Arc::new(StaticSignatureVerifier::new("whsec")),
        h.ledger.clone(),
        h.queue.clone(),
    );
    intake
        .receive(&serde_json::to_vec(&event).unwrap(), "whsec")
        .await
        .unwrap();
    h.store.fail_operation("record_payment");
    h.ledger.fail_next_completions(10);
    let worker = QueueWorker::new(
        QueueName::Payments,
        h.queue.clone(),
        Arc::new(h.settlement()),
        h.clock.clone(),
    )
    .with_config(WorkerConfig::default().with_max_jitter(Duration::ZERO));

    let outcomes = worker.drain().await.unwrap();

    assert!(matches!(outcomes.as_slice(), [JobOutcome::Buried { .. }]));
    assert_eq!(h.ledger.entry("evt_lost").unwrap().status, LedgerStatus::Processing);
    let failed = h.queue.list_failed(QueueName::Payments, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("not recorded"));
    assert!(h.store.snapshot().await.orders.is_empty());
}

#[tokio::test]
async fn unrecorded_outcome_is_fatal_even_after_success() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_unsaved", user.user_id, sub_id, PlanType::Digital);
    h.ledger.fail_next_completions(10);

    let err = h.settlement().process(SUCCEEDED, &event).await.unwrap_err();

    assert!(matches!(
        err,
        SettlementError::OutcomeNotRecorded { status: "handled", .. }
    ));
    assert!(!err.is_retryable());
    assert_eq!(h.store.snapshot().await.orders.len(), 1);
}

#[tokio::test]
async fn preorder_for_a_released_edition_unlocks_immediately() {
    let h = Harness::new();
    let edition = h.edition(2, EditionStatus::Active).await;
    let user = h.user("buyer").await;
    let order_id = preorder(&h, &user, &edition).await;
    let event = fixtures::preorder_event("evt_pre_1", user.user_id, order_id, edition.id);

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Active);
    assert_eq!(grant.unlocked_at, Some(h.clock.now()));
    let state = h.store.snapshot().await;
    let order = &state.orders[&order_id];
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.paid_at, Some(h.clock.now()));
    assert_eq!(state.payments[0].order_id, order_id);
    assert_eq!(state.payments[0].amount_cents, 2_400);

    let raw = h.cache_store.get(&EntitlementCache::key(user.user_id)).await.unwrap();
    assert!(raw.is_some());
    assert_eq!(messages(&h, TemplateType::PreorderConfirmed), vec!["buyer@example.com"]);
}

#[tokio::test]
async fn second_payment_for_a_paid_preorder_records_nothing() {
    let h = Harness::new();
    let edition = h.edition(2, EditionStatus::Active).await;
    let user = h.user("buyer").await;
    let order_id = preorder(&h, &user, &edition).await;
    let worker = h.settlement();
    let first = fixtures::preorder_event("evt_pre_a", user.user_id, order_id, edition.id);
    let second = fixtures::preorder_event("evt_pre_b", user.user_id, order_id, edition.id);

    worker.process(SUCCEEDED, &first).await.unwrap();
    let paid_at = h.clock.now();
    h.clock.advance(chrono::Duration::hours(1));
    let outcome = worker.process(SUCCEEDED, &second).await.unwrap();

    assert_eq!(outcome, SettlementOutcome::Settled);
    let state = h.store.snapshot().await;
    assert_eq!(state.payments.len(), 1);
    assert_eq!(state.payments[0].provider_reference, "evt_pre_a");
    assert_eq!(state.orders[&order_id].paid_at, Some(paid_at));
    assert_eq!(messages(&h, TemplateType::PreorderConfirmed), vec!["buyer@example.com"]);
    assert_eq!(h.ledger.entry("evt_pre_b").unwrap().status, LedgerStatus::Handled);
}

#[tokio::test]
async fn preorder_for_an_upcoming_edition_is_scheduled() {
    let h = Harness::new();
    let edition = h.edition(4, EditionStatus::PreorderOpen).await;
    let user = h.user("buyer").await;
    let order_id = preorder(&h, &user, &edition).await;
    let event = fixtures::preorder_event("evt_pre_2", user.user_id, order_id, edition.id);

    h.settlement().process(SUCCEEDED, &event).await.unwrap();

    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Scheduled);
    assert_eq!(grant.unlock_at, fixtures::ts(2026, 3, 1, 0));
    assert_eq!(grant.unlocked_at, None);
    assert!(h.cache_store.raw(&EntitlementCache::key(user.user_id)).is_none());

    // The release picks the grant up.
    h.engine().release_edition(4).await.unwrap();
    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Active);
}

#[tokio::test]
async fn missing_preorder_flags_the_buyer() {
    let h = Harness::new();
    let edition = h.edition(2, EditionStatus::Active).await;
    let user = h.user("buyer").await;
    let event = fixtures::preorder_event("evt_pre_3", user.user_id, OrderId::new(), edition.id);

    let err = h.settlement().process(SUCCEEDED, &event).await.unwrap_err();

    assert!(matches!(err, SettlementError::PreorderNotFound(_)));
    assert_eq!(h.store.payment_status(user.user_id).await.as_deref(), Some("retry_pending"));
    assert_eq!(h.ledger.entry("evt_pre_3").unwrap().status, LedgerStatus::Failed);
    assert!(h.store.access_for(user.user_id, edition.id).await.is_none());
    assert!(h.store.snapshot().await.payments.is_empty());
}

#[tokio::test]
async fn preorder_event_without_order_id_is_rejected() {
    let h = Harness::new();
    let edition = h.edition(2, EditionStatus::Active).await;
    let user = h.user("buyer").await;
    let mut event = fixtures::preorder_event("evt_pre_4", user.user_id, OrderId::new(), edition.id);
    event.order_id = None;

    let err = h.settlement().process(SUCCEEDED, &event).await.unwrap_err();

    assert!(matches!(err, SettlementError::MissingField(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unsuccessful_payment_is_unsupported() {
    let h = Harness::new();
    let user = h.user("reader").await;
    let mut event = fixtures::renewal_event("evt_declined", user.user_id, SubscriptionId::new(), PlanType::Digital);
    event.success = false;

    let err = h.settlement().process(SUCCEEDED, &event).await.unwrap_err();

    assert!(matches!(err, SettlementError::Unsupported(_)));
    assert!(h.store.snapshot().await.orders.is_empty());
}

#[tokio::test]
async fn subscription_created_notifies_the_operator() {
    let h = Harness::new();
    let user = h.user("reader").await;
    let mut event = fixtures::renewal_event("evt_created", user.user_id, SubscriptionId::new(), PlanType::Combined);
    event.kind = PaymentEventKind::SubscriptionCreated;

    let outcome = h
        .settlement()
        .process(PaymentEventKind::SubscriptionCreated, &event)
        .await
        .unwrap();

    assert_eq!(outcome, SettlementOutcome::Settled);
    assert_eq!(messages(&h, TemplateType::AdminSubscriptionCreated), vec![ADMIN_EMAIL]);
    let batch = batch_of(&h.email_jobs(SEND_MESSAGE_JOB)[0]);
    assert_eq!(batch.content.variables.get("plan").map(String::as_str), Some("combined"));
    assert_eq!(
        batch.content.variables.get("event_id").map(String::as_str),
        Some("evt_created")
    );
}

#[tokio::test]
async fn subscription_created_without_admin_address_is_a_config_error() {
    let h = Harness::new();
    let user = h.user("reader").await;
    let event = fixtures::renewal_event("evt_created_2", user.user_id, SubscriptionId::new(), PlanType::Digital);
    let worker = SettlementWorker::new(
        h.ledger.clone() as Arc<dyn EventLedger>,
        h.store.clone() as Arc<dyn EntitlementStore>,
        h.cache.clone(),
        h.fanout.clone(),
        h.clock.clone(),
    )
    .with_config(SettlementConfig::default().with_ledger_retry(common::fast_retry()));

    let err = worker
        .process(PaymentEventKind::SubscriptionCreated, &event)
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::Config(_)));
    assert!(!err.is_retryable());
    assert!(h.email_jobs(SEND_MESSAGE_JOB).is_empty());
}

#[tokio::test]
async fn failed_operator_notice_fails_the_event() {
    let h = Harness::new();
    let user = h.user("reader").await;
    let event = fixtures::renewal_event("evt_created_3", user.user_id, SubscriptionId::new(), PlanType::Digital);
    h.queue.fail_enqueues_named(SEND_MESSAGE_JOB);

    let err = h
        .settlement()
        .process(PaymentEventKind::SubscriptionCreated, &event)
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::Notification(_)));
    assert!(err.is_retryable());
    assert_eq!(h.ledger.entry("evt_created_3").unwrap().status, LedgerStatus::Failed);
}

#[tokio::test]
async fn customer_notice_failure_does_not_fail_the_payment() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_quiet", user.user_id, sub_id, PlanType::Digital);
    h.queue.fail_enqueues_named(SEND_MESSAGE_JOB);

    let outcome = h.settlement().process(SUCCEEDED, &event).await.unwrap();

    assert_eq!(outcome, SettlementOutcome::Settled);
    assert_eq!(h.ledger.entry("evt_quiet").unwrap().status, LedgerStatus::Handled);
}

#[tokio::test]
async fn payment_failed_job_is_buried_after_intake() {
    let h = Harness::new();
    let user = h.user("reader").await;
    let mut event = fixtures::renewal_event("evt_failed", user.user_id, SubscriptionId::new(), PlanType::Digital);
    event.kind = PaymentEventKind::PaymentFailed;
    event.success = false;
    let intake = PaymentIntake::new(
        Arc::new(StaticSignatureVerifier::new("whsec")),
        h.ledger.clone(),
        h.queue.clone(),
    );
    intake
        .receive(&serde_json::to_vec(&event).unwrap(), "whsec")
        .await
        .unwrap();
    let worker = QueueWorker::new(
        QueueName::Payments,
        h.queue.clone(),
        Arc::new(h.settlement()),
        h.clock.clone(),
    )
    .with_config(WorkerConfig::default().with_max_jitter(Duration::ZERO));

    let outcomes = worker.drain().await.unwrap();

    assert!(matches!(outcomes.as_slice(), [JobOutcome::Buried { .. }]));
    let entry = h.ledger.entry("evt_failed").unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert_eq!(entry.event_type, "payment.failed");
}

#[tokio::test]
async fn payments_queue_settles_a_renewal_end_to_end() {
    let h = Harness::new();
    h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    let sub_id = subscription(&h, &user, PlanType::Digital).await;
    let event = fixtures::renewal_event("evt_e2e", user.user_id, sub_id, PlanType::Digital);
    let intake = PaymentIntake::new(
        Arc::new(StaticSignatureVerifier::new("whsec")),
        h.ledger.clone(),
        h.queue.clone(),
    );
    let body = serde_json::to_vec(&event).unwrap();
    intake.receive(&body, "whsec").await.unwrap();
    let payments = QueueWorker::new(
        QueueName::Payments,
        h.queue.clone(),
        Arc::new(h.settlement()),
        h.clock.clone(),
    )
    .with_config(WorkerConfig::default().with_max_jitter(Duration::ZERO));
    let email = QueueWorker::new(
        QueueName::Email,
        h.queue.clone(),
        Arc::new(h.dispatcher()),
        h.clock.clone(),
    )
    .with_config(WorkerConfig::default().with_max_jitter(Duration::ZERO));

    assert_eq!(payments.drain().await.unwrap(), vec![JobOutcome::Completed]);
    assert_eq!(email.drain().await.unwrap(), vec![JobOutcome::Completed]);

    let sent = h.mailer.sent_to("reader@example.com");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, TemplateType::SubscriptionRenewed);

    // A late redelivery of the same notification is ignored.
    assert!(matches!(
        intake.receive(&body, "whsec").await.unwrap(),
        IntakeOutcome::Duplicate { .. }
    ));
}
