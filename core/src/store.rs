//! The transactional system of record.
//!
//! [`EntitlementStore`] exposes pool-level reads plus [`EntitlementStore::begin`].
//! Everything that must be atomic (a release, a settlement) goes through a
//! [`StoreTransaction`]. Dropping a transaction without calling
//! [`StoreTransaction::commit`] rolls it back.

use crate::access::{AccessView, EditionAccess, NewAccess, UnlockedGrant};
use crate::commerce::{
    BillingPeriod, NewOrder, NewPayment, NewShipment, PaidPreorder, Subscription, UserContact,
};
use crate::edition::Edition;
use crate::ids::{EditionId, OrderId, SubscriptionId, UserId};
use crate::{BoxFuture, UnknownCode};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A row referenced by the operation does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the operation may succeed if attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<UnknownCode> for StoreError {
    fn from(err: UnknownCode) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result of [`StoreTransaction::upsert_access`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUpsert {
    /// The grant now stored for the `(user, edition)` pair.
    pub access: EditionAccess,
    /// False when the grant already existed and was left untouched.
    pub created: bool,
}

/// Pool-level store operations.
pub trait EntitlementStore: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection is available.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, StoreError>>;

    /// Look up an edition by number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn find_edition_by_number(
        &self,
        number: i32,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>>;

    /// The earliest edition that is ready, due on or before `today` and still
    /// pending or open for preorder.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn next_releasable_edition(
        &self,
        today: NaiveDate,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>>;

    /// A user's ACTIVE, non-expired grants.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn active_access_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<AccessView>, StoreError>>;

    /// Flip ACTIVE grants with `expires_at <= now` to EXPIRED.
    ///
    /// Returns the distinct users whose grants expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn expire_lapsed_access(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>>;

    /// Mark a user's payment as needing a retry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the user does not exist.
    fn flag_payment_retry(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Operations inside one store transaction.
pub trait StoreTransaction: Send {
    /// Conditionally activate an edition.
    ///
    /// Sets `status = active, released_at = now` only when the edition is
    /// neither active nor closed. Returns `None` when no row matched, which is
    /// how concurrent releases of the same edition lose.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn activate_edition(
        &mut self,
        number: i32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>>;

    /// Look up an edition by number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn find_edition_by_number(
        &mut self,
        number: i32,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>>;

    /// Look up an edition by id.
    ///
    /// The edition row stays locked against activation until the transaction
    /// ends, so a grant status derived from it cannot be overtaken by a
    /// concurrent release.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn find_edition(
        &mut self,
        edition_id: EditionId,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>>;

    /// Flip every SCHEDULED grant of an edition to ACTIVE.
    ///
    /// Returns the unlocked grants joined with grantee identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn unlock_scheduled_access(
        &mut self,
        edition_id: EditionId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<UnlockedGrant>, StoreError>>;

    /// ACTIVE, non-expired grants of several users.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn active_access_for_users(
        &mut self,
        users: Vec<UserId>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<AccessView>, StoreError>>;

    /// Mark a pending preorder order paid.
    ///
    /// Returns `None` when no preorder has this id. An order that is already
    /// paid is returned untouched with `newly_paid = false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn mark_preorder_paid(
        &mut self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<PaidPreorder>, StoreError>>;

    /// Set a subscription ACTIVE for `period`.
    ///
    /// Returns `None` when the subscription does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn renew_subscription(
        &mut self,
        subscription_id: SubscriptionId,
        period: BillingPeriod,
    ) -> BoxFuture<'_, Result<Option<Subscription>, StoreError>>;

    /// Insert a paid order.
    ///
    /// Returns false when an order for the same external event already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn record_order(&mut self, order: NewOrder) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Insert a payment record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn record_payment(&mut self, payment: NewPayment) -> BoxFuture<'_, Result<(), StoreError>>;

    /// The lowest-numbered edition that is not closed and that the user has no
    /// grant for. Locks the edition row like [`Self::find_edition`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn next_unseen_edition(
        &mut self,
        user_id: UserId,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>>;

    /// Insert a grant unless one exists for `(user_id, edition_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn upsert_access(&mut self, access: NewAccess) -> BoxFuture<'_, Result<AccessUpsert, StoreError>>;

    /// Insert a shipment request unless one exists for the same user and
    /// edition. Returns false when it already existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn create_shipment_request(
        &mut self,
        shipment: NewShipment,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Contact details of a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    fn find_user(&mut self, user_id: UserId) -> BoxFuture<'_, Result<Option<UserContact>, StoreError>>;

    /// Commit every change made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the commit fails; nothing is applied.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}
