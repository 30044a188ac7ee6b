//! Payment settlement.
//!
//! [`SettlementWorker`] is the payments-queue handler. Every delivery is
//! claimed in the [`EventLedger`] before anything else happens and completed
//! after the branch has run, whatever its outcome:
//!
//! ```text
//! begin_event ── None ──► duplicate, skip
//!      │
//!      └─ entry ──► settle(kind, event) ──► complete_event(HANDLED | FAILED)
//! ```
//!
//! Branches, by job name:
//!
//! - `payment.success` + preorder: mark the order paid, record the payment and
//!   grant the preordered edition
//! - `payment.success` + subscription: renew the period, record order and
//!   payment, grant the next edition the subscriber has not received
//! - `subscription.created`: notify the operator
//! - `payment.failed`: unsupported, fails without retry

use crate::cache::EntitlementCache;
use crate::config::SettlementConfig;
use crate::error::SettlementError;
use crate::fanout::NotificationFanout;
use editions_core::BoxFuture;
use editions_core::access::{AccessStatus, NewAccess, PlanType};
use editions_core::commerce::{BillingPeriod, NewOrder, NewPayment, NewShipment};
use editions_core::environment::Clock;
use editions_core::ids::{AddressId, EditionId, OrderId, SubscriptionId, UserId};
use editions_core::ledger::{EventLedger, LedgerStatus};
use editions_core::notify::{MessageContent, Recipient, TemplateType};
use editions_core::payment::{OrderType, PaymentEvent, PaymentEventKind};
use editions_core::queue::Job;
use editions_core::store::{AccessUpsert, EntitlementStore, StoreTransaction};
use editions_runtime::metrics::SettlementMetrics;
use editions_runtime::{JobError, JobHandler, retry_with_backoff};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of [`SettlementWorker::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// This call ran the branch and the ledger entry is HANDLED.
    Settled,
    /// The ledger already had the event; nothing ran.
    Duplicate,
}

/// Turns confirmed payment events into orders, payments and access grants.
pub struct SettlementWorker {
    ledger: Arc<dyn EventLedger>,
    store: Arc<dyn EntitlementStore>,
    cache: Arc<EntitlementCache>,
    fanout: Arc<NotificationFanout>,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl SettlementWorker {
    /// Create a worker with default settings.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        store: Arc<dyn EntitlementStore>,
        cache: Arc<EntitlementCache>,
        fanout: Arc<NotificationFanout>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            store,
            cache,
            fanout,
            clock,
            config: SettlementConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: SettlementConfig) -> Self {
        self.config = config;
        self
    }

    /// Settle `event` at most once.
    ///
    /// The ledger entry ends HANDLED on success and FAILED with the error
    /// message otherwise, so a later delivery of a failed event retries it and
    /// a later delivery of a handled one is skipped.
    ///
    /// # Errors
    ///
    /// Returns the branch's [`SettlementError`], or a ledger error when the
    /// event cannot be claimed. When the outcome cannot be written back to the
    /// ledger the error is [`SettlementError::OutcomeNotRecorded`], which is
    /// fatal so the job is buried next to the stuck PROCESSING entry.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, kind = kind.job_name()))]
    pub async fn process(
        &self,
        kind: PaymentEventKind,
        event: &PaymentEvent,
    ) -> Result<SettlementOutcome, SettlementError> {
        let raw_payload = event.to_payload().unwrap_or_default();
        let Some(entry) = self
            .ledger
            .begin_event(&event.event_id, kind.job_name(), raw_payload)
            .await?
        else {
            SettlementMetrics::record_duplicate("worker");
            info!("Payment event already handled or in progress, skipping");
            return Ok(SettlementOutcome::Duplicate);
        };
        if entry.attempts > 1 {
            info!(attempts = entry.attempts, "Retrying failed payment event");
        }

        let result = self.settle(kind, event).await;

        let (status, message) = match &result {
            Ok(()) => (LedgerStatus::Handled, None),
            Err(e) => (LedgerStatus::Failed, Some(e.to_string())),
        };
        let completed = retry_with_backoff(self.config.ledger_retry.clone(), || {
            self.ledger
                .complete_event(&event.event_id, kind.job_name(), status, message.clone())
        })
        .await;
        if let Err(e) = completed {
            error!(
                status = status.as_str(),
                error = %e,
                "Failed to record payment event outcome, entry left processing"
            );
            SettlementMetrics::record_outcome_lost(kind.job_name());
            return Err(SettlementError::OutcomeNotRecorded {
                status: status.as_str(),
                source: e,
            });
        }

        match result {
            Ok(()) => {
                SettlementMetrics::record_settled(kind.job_name());
                Ok(SettlementOutcome::Settled)
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Payment event failed");
                Err(e)
            }
        }
    }

    async fn settle(&self, kind: PaymentEventKind, event: &PaymentEvent) -> Result<(), SettlementError> {
        match kind {
            PaymentEventKind::PaymentSucceeded if !event.success => Err(
                SettlementError::Unsupported(format!(
                    "{} reported as unsuccessful",
                    kind.job_name()
                )),
            ),
            PaymentEventKind::PaymentSucceeded => match event.order_type {
                OrderType::Preorder => self.complete_preorder(event).await,
                OrderType::Subscription => self.renew_subscription(event).await,
            },
            PaymentEventKind::SubscriptionCreated => self.acknowledge_subscription(event).await,
            PaymentEventKind::PaymentFailed => {
                Err(SettlementError::Unsupported(kind.job_name().to_string()))
            }
        }
    }

    /// Preorder completion. Any failure flags the buyer for a payment retry
    /// before it is re-raised.
    async fn complete_preorder(&self, event: &PaymentEvent) -> Result<(), SettlementError> {
        let result = self.settle_preorder(event).await;
        if let Err(e) = &result {
            if let Err(flag_error) = self
                .store
                .flag_payment_retry(event.user_id, &e.to_string())
                .await
            {
                warn!(
                    user_id = %event.user_id,
                    error = %flag_error,
                    "Failed to flag payment retry"
                );
            }
        }
        result
    }

    async fn settle_preorder(&self, event: &PaymentEvent) -> Result<(), SettlementError> {
        let order_id = event.require_order_id()?;
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let preorder = tx
            .mark_preorder_paid(order_id, now)
            .await?
            .ok_or(SettlementError::PreorderNotFound(order_id))?;
        if !preorder.newly_paid {
            drop(tx);
            SettlementMetrics::record_duplicate("preorder");
            info!(order_id = %order_id, "Preorder already paid, skipping");
            return Ok(());
        }
        tx.record_payment(NewPayment {
            order_id,
            amount_cents: event.amount_cents,
            provider_reference: event.event_id.clone(),
            paid_at: now,
        })
        .await?;
        let edition = tx
            .find_edition(preorder.edition_id)
            .await?
            .ok_or(SettlementError::EditionNotFound(preorder.edition_id))?;
        let grant = tx
            .upsert_access(NewAccess::for_edition(
                preorder.user_id,
                &edition,
                preorder.plan,
                None,
                now,
            ))
            .await?;
        let shipment = Shipment {
            user_id: preorder.user_id,
            edition_id: edition.id,
            plan: preorder.plan,
            address_id: preorder.address_id.or(event.address_id),
            subscription_id: None,
        };
        let shipped = shipment.request(tx.as_mut(), now).await?;
        let contact = tx
            .find_user(preorder.user_id)
            .await?
            .ok_or(SettlementError::UserNotFound(preorder.user_id))?;
        tx.commit().await?;

        info!(
            order_id = %order_id,
            user_id = %preorder.user_id,
            edition_number = edition.number,
            grant_created = grant.created,
            immediate = grant.access.status == AccessStatus::Active,
            shipped,
            "Preorder settled"
        );

        self.refresh_if_unlocked(&grant).await;
        self.notify(
            Recipient::user(contact.user_id, contact.email, contact.name),
            TemplateType::PreorderConfirmed,
            MessageContent::default()
                .with_var("edition_number", edition.number)
                .with_var("order_id", order_id),
        )
        .await;
        Ok(())
    }

    async fn renew_subscription(&self, event: &PaymentEvent) -> Result<(), SettlementError> {
        let subscription_id = event.require_subscription_id()?;
        let now = self.clock.now();
        let period = BillingPeriod::resolve(event.period_start, event.period_end, now);

        let mut tx = self.store.begin().await?;
        let subscription = tx
            .renew_subscription(subscription_id, period)
            .await?
            .ok_or(SettlementError::SubscriptionNotFound(subscription_id))?;
        let user_id = subscription.user_id;

        let order_id = OrderId::new();
        let recorded = tx
            .record_order(NewOrder {
                id: order_id,
                user_id,
                kind: OrderType::Subscription,
                amount_cents: event.amount_cents,
                external_event_id: event.event_id.clone(),
                subscription_id: Some(subscription_id),
                paid_at: now,
            })
            .await?;
        if !recorded {
            drop(tx);
            SettlementMetrics::record_duplicate("order");
            info!(
                subscription_id = %subscription_id,
                "Order for this payment event already exists, skipping renewal"
            );
            return Ok(());
        }
        tx.record_payment(NewPayment {
            order_id,
            amount_cents: event.amount_cents,
            provider_reference: event.event_id.clone(),
            paid_at: now,
        })
        .await?;

        let plan = subscription.plan;
        let mut grant = None;
        let mut edition_number = None;
        let mut shipped = false;
        if let Some(edition) = tx.next_unseen_edition(user_id).await? {
            grant = Some(
                tx.upsert_access(NewAccess::for_edition(
                    user_id,
                    &edition,
                    plan,
                    Some(subscription_id),
                    now,
                ))
                .await?,
            );
            let shipment = Shipment {
                user_id,
                edition_id: edition.id,
                plan,
                address_id: event.address_id.or(subscription.address_id),
                subscription_id: Some(subscription_id),
            };
            shipped = shipment.request(tx.as_mut(), now).await?;
            edition_number = Some(edition.number);
        } else {
            info!(user_id = %user_id, "Subscriber already holds every open edition");
        }

        let contact = tx
            .find_user(user_id)
            .await?
            .ok_or(SettlementError::UserNotFound(user_id))?;
        tx.commit().await?;

        info!(
            subscription_id = %subscription_id,
            user_id = %user_id,
            plan = plan.as_str(),
            edition_number,
            shipped,
            period_end = %period.end,
            "Subscription payment settled"
        );

        if let Some(grant) = &grant {
            self.refresh_if_unlocked(grant).await;
        }

        let template = if event.is_new_subscription {
            TemplateType::SubscriptionStarted
        } else {
            TemplateType::SubscriptionRenewed
        };
        let mut content = MessageContent::default()
            .with_var("plan", plan.as_str())
            .with_var("period_end", period.end.date_naive());
        if let Some(number) = edition_number {
            content = content.with_var("edition_number", number);
        }
        self.notify(
            Recipient::user(contact.user_id, contact.email, contact.name),
            template,
            content,
        )
        .await;
        Ok(())
    }

    /// The operator notice is the whole effect of this event, so a failed
    /// enqueue fails the event.
    async fn acknowledge_subscription(&self, event: &PaymentEvent) -> Result<(), SettlementError> {
        let admin_email = self.config.admin_email.as_deref().ok_or_else(|| {
            SettlementError::Config("admin notification address is not configured".to_string())
        })?;

        let mut content = MessageContent::default()
            .with_subject("New subscription")
            .with_var("event_id", &event.event_id)
            .with_var("user_id", event.user_id);
        if let Some(subscription_id) = event.subscription_id {
            content = content.with_var("subscription_id", subscription_id);
        }
        if let Some(plan) = event.plan {
            content = content.with_var("plan", plan.as_str());
        }
        if let Some(plan_id) = &event.subscription_plan_id {
            content = content.with_var("subscription_plan_id", plan_id);
        }

        let handle = self
            .fanout
            .send_message(
                Recipient::address(admin_email),
                TemplateType::AdminSubscriptionCreated,
                content,
            )
            .await?;
        info!(job_id = %handle.id, user_id = %event.user_id, "Subscription creation acknowledged");
        Ok(())
    }

    async fn refresh_if_unlocked(&self, grant: &AccessUpsert) {
        let access = &grant.access;
        if !(grant.created
            && access.status == AccessStatus::Active
            && access.access_type.includes_digital())
        {
            return;
        }
        if let Err(e) = self.cache.reload_user(access.user_id).await {
            warn!(user_id = %access.user_id, error = %e, "Failed to refresh access cache");
        }
    }

    async fn notify(&self, recipient: Recipient, template: TemplateType, content: MessageContent) {
        let email = recipient.email.clone();
        if let Err(e) = self.fanout.send_message(recipient, template, content).await {
            warn!(email = %email, template = %template, error = %e, "Failed to enqueue message");
        }
    }
}

/// A printed copy owed for one grant.
struct Shipment {
    user_id: UserId,
    edition_id: EditionId,
    plan: PlanType,
    address_id: Option<AddressId>,
    subscription_id: Option<SubscriptionId>,
}

impl Shipment {
    /// Request the shipment when the plan prints and an address is known.
    /// Returns whether a new request was created.
    async fn request(
        self,
        tx: &mut dyn StoreTransaction,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, SettlementError> {
        if !self.plan.includes_physical() {
            return Ok(false);
        }
        let Some(address_id) = self.address_id else {
            warn!(
                user_id = %self.user_id,
                edition_id = %self.edition_id,
                "Physical plan without a shipping address, no shipment requested"
            );
            return Ok(false);
        };
        Ok(tx
            .create_shipment_request(NewShipment {
                user_id: self.user_id,
                edition_id: self.edition_id,
                address_id,
                subscription_id: self.subscription_id,
                requested_at: now,
            })
            .await?)
    }
}

impl JobHandler for SettlementWorker {
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            let kind = PaymentEventKind::from_job_name(&job.name).map_err(JobError::fatal)?;
            let event = PaymentEvent::from_payload(&job.payload)?;
            self.process(kind, &event).await?;
            Ok(())
        })
    }
}
