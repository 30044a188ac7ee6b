//! In-memory entitlement store.
//!
//! A transaction holds the store's single async lock for its whole lifetime
//! and works on a private copy of the state. `commit` swaps the copy in;
//! dropping the transaction throws it away. Transactions are therefore fully
//! serialized, which is stricter than Postgres but enough to exercise the
//! pipeline's transactional contracts.
//!
//! Pool-level reads wait for an open transaction to finish, so never call
//! them while holding a transaction on the same task.

use crate::lock;
use chrono::{DateTime, NaiveDate, Utc};
use editions_core::BoxFuture;
use editions_core::access::{
    AccessStatus, AccessView, EditionAccess, NewAccess, PlanType, UnlockedGrant,
};
use editions_core::commerce::{
    BillingPeriod, NewOrder, NewPayment, NewShipment, OrderStatus, PaidPreorder, Subscription,
    SubscriptionStatus, UserContact,
};
use editions_core::edition::{Edition, EditionStatus};
use editions_core::ids::{AccessId, AddressId, EditionId, OrderId, SubscriptionId, UserId};
use editions_core::payment::OrderType;
use editions_core::store::{AccessUpsert, EntitlementStore, StoreError, StoreTransaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::ready;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A stored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Contact details.
    pub contact: UserContact,
    /// Payment status flag (`ok`, `retry_pending`).
    pub payment_status: String,
}

/// A stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    /// Order id.
    pub id: OrderId,
    /// Buyer.
    pub user_id: UserId,
    /// Order kind.
    pub kind: OrderType,
    /// Settlement status.
    pub status: OrderStatus,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// Paying event.
    pub external_event_id: Option<String>,
    /// Preordered edition.
    pub edition_id: Option<EditionId>,
    /// Plan tier.
    pub plan: PlanType,
    /// Shipping address.
    pub address_id: Option<AddressId>,
    /// Renewed subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Payment time.
    pub paid_at: Option<DateTime<Utc>>,
}

/// Everything the in-memory store holds.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    /// Users by id.
    pub users: HashMap<UserId, UserRecord>,
    /// Editions.
    pub editions: Vec<Edition>,
    /// Access grants in insertion order.
    pub access: Vec<EditionAccess>,
    /// Orders by id.
    pub orders: HashMap<OrderId, OrderRecord>,
    /// Payments in insertion order.
    pub payments: Vec<NewPayment>,
    /// Subscriptions by id.
    pub subscriptions: HashMap<SubscriptionId, Subscription>,
    /// Shipment requests in insertion order.
    pub shipments: Vec<NewShipment>,
}

impl StoreState {
    fn edition_by_number(&self, number: i32) -> Option<&Edition> {
        self.editions.iter().find(|e| e.number == number)
    }

    fn edition_by_id(&self, id: EditionId) -> Option<&Edition> {
        self.editions.iter().find(|e| e.id == id)
    }

    fn active_views(&self, users: &HashSet<UserId>, now: DateTime<Utc>) -> Vec<AccessView> {
        let mut views: Vec<AccessView> = self
            .access
            .iter()
            .filter(|a| users.contains(&a.user_id))
            .filter(|a| a.status == AccessStatus::Active)
            .filter(|a| a.expires_at.is_none_or(|at| at > now))
            .filter_map(|a| {
                let edition = self.edition_by_id(a.edition_id)?;
                Some(AccessView {
                    access_id: a.id,
                    user_id: a.user_id,
                    edition_id: a.edition_id,
                    edition_number: edition.number,
                    access_type: a.access_type,
                    unlocked_at: a.unlocked_at,
                    expires_at: a.expires_at,
                    release_date: edition.release_date,
                    ready_for_release: edition.ready_for_release,
                })
            })
            .collect();
        views.sort_by_key(|v| (v.user_id, v.edition_number));
        views
    }
}

/// Named operations that can be made to fail.
#[derive(Debug, Default)]
struct Faults {
    failing: Mutex<HashSet<&'static str>>,
}

impl Faults {
    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if lock(&self.failing).contains(operation) {
            return Err(StoreError::Database(format!("injected fault in {operation}")));
        }
        Ok(())
    }
}

/// In-memory [`EntitlementStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntitlementStore {
    state: Arc<AsyncMutex<StoreState>>,
    faults: Arc<Faults>,
}

impl InMemoryEntitlementStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` (a trait method name, or `"commit"`) fail until
    /// [`clear_faults`](Self::clear_faults) is called.
    pub fn fail_operation(&self, operation: &'static str) {
        lock(&self.faults.failing).insert(operation);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        lock(&self.faults.failing).clear();
    }

    /// Copy of the whole state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }

    /// Add a user.
    pub async fn insert_user(&self, contact: UserContact) {
        self.state.lock().await.users.insert(
            contact.user_id,
            UserRecord {
                contact,
                payment_status: "ok".to_string(),
            },
        );
    }

    /// Add an edition.
    pub async fn insert_edition(&self, edition: Edition) {
        self.state.lock().await.editions.push(edition);
    }

    /// Add an access grant.
    pub async fn insert_access(&self, access: EditionAccess) {
        self.state.lock().await.access.push(access);
    }

    /// Add an order.
    pub async fn insert_order(&self, order: OrderRecord) {
        self.state.lock().await.orders.insert(order.id, order);
    }

    /// Add a subscription.
    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Edition by number.
    pub async fn edition(&self, number: i32) -> Option<Edition> {
        self.state.lock().await.edition_by_number(number).cloned()
    }

    /// Grant for a `(user, edition)` pair.
    pub async fn access_for(&self, user_id: UserId, edition_id: EditionId) -> Option<EditionAccess> {
        self.state
            .lock()
            .await
            .access
            .iter()
            .find(|a| a.user_id == user_id && a.edition_id == edition_id)
            .cloned()
    }

    /// A user's payment status flag.
    pub async fn payment_status(&self, user_id: UserId) -> Option<String> {
        self.state
            .lock()
            .await
            .users
            .get(&user_id)
            .map(|u| u.payment_status.clone())
    }
}

impl EntitlementStore for InMemoryEntitlementStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, StoreError>> {
        Box::pin(async move {
            self.faults.check("begin")?;
            let guard = Arc::clone(&self.state).lock_owned().await;
            let working = guard.clone();
            Ok(Box::new(InMemoryTransaction {
                guard,
                working,
                faults: Arc::clone(&self.faults),
            }) as Box<dyn StoreTransaction>)
        })
    }

    fn find_edition_by_number(
        &self,
        number: i32,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(async move {
            self.faults.check("find_edition_by_number")?;
            Ok(self.state.lock().await.edition_by_number(number).cloned())
        })
    }

    fn next_releasable_edition(
        &self,
        today: NaiveDate,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(async move {
            self.faults.check("next_releasable_edition")?;
            let state = self.state.lock().await;
            Ok(state
                .editions
                .iter()
                .filter(|e| e.ready_for_release && e.status.is_releasable())
                .filter(|e| e.release_date.is_some_and(|d| d <= today))
                .min_by_key(|e| e.number)
                .cloned())
        })
    }

    fn active_access_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<AccessView>, StoreError>> {
        Box::pin(async move {
            self.faults.check("active_access_for_user")?;
            let users = HashSet::from([user_id]);
            Ok(self.state.lock().await.active_views(&users, now))
        })
    }

    fn expire_lapsed_access(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>> {
        Box::pin(async move {
            self.faults.check("expire_lapsed_access")?;
            let mut state = self.state.lock().await;
            let mut users = BTreeSet::new();
            for access in &mut state.access {
                if access.status == AccessStatus::Active
                    && access.expires_at.is_some_and(|at| at <= now)
                {
                    access.status = AccessStatus::Expired;
                    users.insert(access.user_id);
                }
            }
            Ok(users.into_iter().collect())
        })
    }

    fn flag_payment_retry(
        &self,
        user_id: UserId,
        _reason: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.faults.check("flag_payment_retry")?;
            let mut state = self.state.lock().await;
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
            user.payment_status = "retry_pending".to_string();
            Ok(())
        })
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
    faults: Arc<Faults>,
}

impl InMemoryTransaction {
    fn run<T: Send + 'static>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> BoxFuture<'static, Result<T, StoreError>> {
        let result = self.faults.check(operation).and_then(|()| f(&mut self.working));
        Box::pin(ready(result))
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn activate_edition(
        &mut self,
        number: i32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        self.run("activate_edition", |state| {
            Ok(state
                .editions
                .iter_mut()
                .find(|e| e.number == number && e.status.is_releasable())
                .map(|edition| {
                    edition.status = EditionStatus::Active;
                    edition.released_at = Some(now);
                    edition.clone()
                }))
        })
    }

    fn find_edition_by_number(
        &mut self,
        number: i32,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        self.run("find_edition_by_number", |state| {
            Ok(state.edition_by_number(number).cloned())
        })
    }

    fn find_edition(
        &mut self,
        edition_id: EditionId,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        self.run("find_edition", |state| Ok(state.edition_by_id(edition_id).cloned()))
    }

    fn unlock_scheduled_access(
        &mut self,
        edition_id: EditionId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<UnlockedGrant>, StoreError>> {
        self.run("unlock_scheduled_access", |state| {
            let mut unlocked = Vec::new();
            for access in &mut state.access {
                if access.edition_id == edition_id && access.status == AccessStatus::Scheduled {
                    access.status = AccessStatus::Active;
                    access.unlocked_at = Some(now);
                    unlocked.push((access.id, access.user_id, access.access_type));
                }
            }
            // Inner join on users, like the SQL version.
            let mut grants: Vec<UnlockedGrant> = unlocked
                .into_iter()
                .filter_map(|(access_id, user_id, access_type)| {
                    let user = state.users.get(&user_id)?;
                    Some(UnlockedGrant {
                        access_id,
                        user_id,
                        email: user.contact.email.clone(),
                        name: user.contact.name.clone(),
                        access_type,
                    })
                })
                .collect();
            grants.sort_by(|a, b| a.email.cmp(&b.email));
            Ok(grants)
        })
    }

    fn active_access_for_users(
        &mut self,
        users: Vec<UserId>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<AccessView>, StoreError>> {
        self.run("active_access_for_users", |state| {
            let users: HashSet<UserId> = users.into_iter().collect();
            Ok(state.active_views(&users, now))
        })
    }

    fn mark_preorder_paid(
        &mut self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<PaidPreorder>, StoreError>> {
        self.run("mark_preorder_paid", |state| {
            let Some(order) = state
                .orders
                .get_mut(&order_id)
                .filter(|o| o.kind == OrderType::Preorder)
            else {
                return Ok(None);
            };
            let Some(edition_id) = order.edition_id else {
                return Ok(None);
            };
            let newly_paid = order.status == OrderStatus::Pending;
            if newly_paid {
                order.status = OrderStatus::Paid;
                order.paid_at = Some(now);
            }
            Ok(Some(PaidPreorder {
                order_id,
                user_id: order.user_id,
                edition_id,
                plan: order.plan,
                address_id: order.address_id,
                newly_paid,
            }))
        })
    }

    fn renew_subscription(
        &mut self,
        subscription_id: SubscriptionId,
        period: BillingPeriod,
    ) -> BoxFuture<'_, Result<Option<Subscription>, StoreError>> {
        self.run("renew_subscription", |state| {
            Ok(state.subscriptions.get_mut(&subscription_id).map(|sub| {
                sub.status = SubscriptionStatus::Active;
                sub.current_period_start = period.start;
                sub.current_period_end = period.end;
                sub.clone()
            }))
        })
    }

    fn record_order(&mut self, order: NewOrder) -> BoxFuture<'_, Result<bool, StoreError>> {
        self.run("record_order", |state| {
            let duplicate = state
                .orders
                .values()
                .any(|o| o.external_event_id.as_deref() == Some(order.external_event_id.as_str()));
            if duplicate {
                return Ok(false);
            }
            let plan = order
                .subscription_id
                .and_then(|id| state.subscriptions.get(&id))
                .map_or(PlanType::Digital, |s| s.plan);
            state.orders.insert(
                order.id,
                OrderRecord {
                    id: order.id,
                    user_id: order.user_id,
                    kind: order.kind,
                    status: OrderStatus::Paid,
                    amount_cents: order.amount_cents,
                    external_event_id: Some(order.external_event_id),
                    edition_id: None,
                    plan,
                    address_id: None,
                    subscription_id: order.subscription_id,
                    paid_at: Some(order.paid_at),
                },
            );
            Ok(true)
        })
    }

    fn record_payment(&mut self, payment: NewPayment) -> BoxFuture<'_, Result<(), StoreError>> {
        self.run("record_payment", |state| {
            state.payments.push(payment);
            Ok(())
        })
    }

    fn next_unseen_edition(
        &mut self,
        user_id: UserId,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        self.run("next_unseen_edition", |state| {
            let seen: HashSet<EditionId> = state
                .access
                .iter()
                .filter(|a| a.user_id == user_id)
                .map(|a| a.edition_id)
                .collect();
            Ok(state
                .editions
                .iter()
                .filter(|e| e.status != EditionStatus::Closed && !seen.contains(&e.id))
                .min_by_key(|e| e.number)
                .cloned())
        })
    }

    fn upsert_access(&mut self, access: NewAccess) -> BoxFuture<'_, Result<AccessUpsert, StoreError>> {
        self.run("upsert_access", |state| {
            if let Some(existing) = state
                .access
                .iter()
                .find(|a| a.user_id == access.user_id && a.edition_id == access.edition_id)
            {
                return Ok(AccessUpsert {
                    access: existing.clone(),
                    created: false,
                });
            }
            let row = EditionAccess {
                id: AccessId::new(),
                user_id: access.user_id,
                edition_id: access.edition_id,
                status: access.status,
                unlock_at: access.unlock_at,
                unlocked_at: access.unlocked_at,
                granted_at: access.granted_at,
                expires_at: access.expires_at,
                subscription_id: access.subscription_id,
                access_type: access.access_type,
            };
            state.access.push(row.clone());
            Ok(AccessUpsert {
                access: row,
                created: true,
            })
        })
    }

    fn create_shipment_request(
        &mut self,
        shipment: NewShipment,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        self.run("create_shipment_request", |state| {
            let exists = state
                .shipments
                .iter()
                .any(|s| s.user_id == shipment.user_id && s.edition_id == shipment.edition_id);
            if exists {
                return Ok(false);
            }
            state.shipments.push(shipment);
            Ok(true)
        })
    }

    fn find_user(&mut self, user_id: UserId) -> BoxFuture<'_, Result<Option<UserContact>, StoreError>> {
        self.run("find_user", |state| {
            Ok(state.users.get(&user_id).map(|u| u.contact.clone()))
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        let Self {
            mut guard,
            working,
            faults,
        } = *self;
        let result = faults.check("commit").map(|()| {
            *guard = working;
        });
        Box::pin(ready(result))
    }
}
