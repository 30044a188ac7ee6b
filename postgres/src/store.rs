//! `PostgreSQL` entitlement store.

use chrono::{DateTime, NaiveDate, Utc};
use editions_core::BoxFuture;
use editions_core::access::{
    AccessStatus, AccessView, EditionAccess, NewAccess, PlanType, UnlockedGrant,
};
use editions_core::commerce::{
    BillingPeriod, NewOrder, NewPayment, NewShipment, PaidPreorder, Subscription,
    SubscriptionStatus, UserContact,
};
use editions_core::edition::{Edition, EditionStatus};
use editions_core::ids::{
    AccessId, AddressId, EditionId, OrderId, SubscriptionId, UserId,
};
use editions_core::store::{AccessUpsert, EntitlementStore, StoreError, StoreTransaction};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

const EDITION_COLUMNS: &str =
    "id, number, status, release_date, ready_for_release, max_copies, released_at";

const ACCESS_COLUMNS: &str = "id, user_id, edition_id, status, unlock_at, unlocked_at, \
                              granted_at, expires_at, subscription_id, access_type";

const ACCESS_VIEW_QUERY: &str = r"
    SELECT a.id AS access_id, a.user_id, a.edition_id, e.number AS edition_number,
           a.access_type, a.unlocked_at, a.expires_at, e.release_date, e.ready_for_release
    FROM edition_access a
    JOIN editions e ON e.id = a.edition_id
    WHERE a.user_id = ANY($1)
      AND a.status = 'active'
      AND (a.expires_at IS NULL OR a.expires_at > $2)
    ORDER BY a.user_id, e.number
";

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn decode(e: sqlx::Error) -> StoreError {
    StoreError::Decode(e.to_string())
}

/// [`EntitlementStore`] backed by `PostgreSQL`.
///
/// # Example
///
/// ```ignore
/// use editions_core::store::EntitlementStore;
/// use editions_postgres::PostgresEntitlementStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEntitlementStore::new(pool);
/// let mut tx = store.begin().await?;
/// if let Some(edition) = tx.activate_edition(3, chrono::Utc::now()).await? {
///     let unlocked = tx.unlock_scheduled_access(edition.id, chrono::Utc::now()).await?;
///     println!("unlocked {}", unlocked.len());
/// }
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEntitlementStore {
    pool: PgPool,
}

impl PostgresEntitlementStore {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn releasable(&self, today: NaiveDate) -> Result<Option<Edition>, StoreError> {
        let row = sqlx::query(&format!(
            r"
            SELECT {EDITION_COLUMNS}
            FROM editions
            WHERE status IN ('pending', 'preorder_open')
              AND ready_for_release
              AND release_date <= $1
            ORDER BY number ASC
            LIMIT 1
            "
        ))
        .bind(today)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(row_to_edition).transpose()
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<UserId>, StoreError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r"
            WITH expired AS (
                UPDATE edition_access
                SET status = 'expired'
                WHERE status = 'active' AND expires_at <= $1
                RETURNING user_id
            )
            SELECT DISTINCT user_id FROM expired ORDER BY user_id
            ",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn flag_retry(&self, user_id: UserId, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE users
            SET payment_status = 'retry_pending',
                payment_status_reason = $2,
                updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(user_id.0)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }
}

impl EntitlementStore for PostgresEntitlementStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, StoreError>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(db)?;
            Ok(Box::new(PostgresTransaction { tx }) as Box<dyn StoreTransaction>)
        })
    }

    fn find_edition_by_number(
        &self,
        number: i32,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {EDITION_COLUMNS} FROM editions WHERE number = $1"
            ))
            .bind(number)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
            row.as_ref().map(row_to_edition).transpose()
        })
    }

    fn next_releasable_edition(
        &self,
        today: NaiveDate,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(self.releasable(today))
    }

    fn active_access_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<AccessView>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(ACCESS_VIEW_QUERY)
                .bind(vec![user_id.0])
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
            rows.iter().map(row_to_view).collect()
        })
    }

    fn expire_lapsed_access(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<UserId>, StoreError>> {
        Box::pin(self.expire(now))
    }

    fn flag_payment_retry(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let reason = reason.to_string();
        Box::pin(async move { self.flag_retry(user_id, &reason).await })
    }
}

/// One open `sqlx` transaction. Dropping it rolls back.
struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn edition_where(
        &mut self,
        clause: &str,
        bind: EditionKey,
    ) -> Result<Option<Edition>, StoreError> {
        // Share-locked so a concurrent release waits for this transaction,
        // and this read waits for an in-flight release to commit.
        let sql = format!("SELECT {EDITION_COLUMNS} FROM editions WHERE {clause} FOR SHARE");
        let query = sqlx::query(&sql);
        let query = match bind {
            EditionKey::Number(number) => query.bind(number),
            EditionKey::Id(id) => query.bind(id.0),
        };
        let row = query.fetch_optional(&mut *self.tx).await.map_err(db)?;
        row.as_ref().map(row_to_edition).transpose()
    }
}

enum EditionKey {
    Number(i32),
    Id(EditionId),
}

impl StoreTransaction for PostgresTransaction {
    fn activate_edition(
        &mut self,
        number: i32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                UPDATE editions
                SET status = 'active', released_at = $2
                WHERE number = $1 AND status NOT IN ('active', 'closed')
                RETURNING {EDITION_COLUMNS}
                "
            ))
            .bind(number)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;
            row.as_ref().map(row_to_edition).transpose()
        })
    }

    fn find_edition_by_number(
        &mut self,
        number: i32,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(self.edition_where("number = $1", EditionKey::Number(number)))
    }

    fn find_edition(
        &mut self,
        edition_id: EditionId,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(self.edition_where("id = $1", EditionKey::Id(edition_id)))
    }

    fn unlock_scheduled_access(
        &mut self,
        edition_id: EditionId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<UnlockedGrant>, StoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                UPDATE edition_access a
                SET status = 'active', unlocked_at = $2
                FROM users u
                WHERE a.edition_id = $1
                  AND a.status = 'scheduled'
                  AND u.id = a.user_id
                RETURNING a.id, a.user_id, u.email, u.name, a.access_type
                ",
            )
            .bind(edition_id.0)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db)?;

            let mut grants = rows
                .iter()
                .map(|row| {
                    let access_type: String = row.try_get("access_type").map_err(decode)?;
                    Ok(UnlockedGrant {
                        access_id: AccessId(row.try_get("id").map_err(decode)?),
                        user_id: UserId(row.try_get("user_id").map_err(decode)?),
                        email: row.try_get("email").map_err(decode)?,
                        name: row.try_get("name").map_err(decode)?,
                        access_type: PlanType::parse(&access_type)?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            grants.sort_by(|a, b| a.email.cmp(&b.email));
            Ok(grants)
        })
    }

    fn active_access_for_users(
        &mut self,
        users: Vec<UserId>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<AccessView>, StoreError>> {
        let ids: Vec<Uuid> = users.into_iter().map(|u| u.0).collect();
        Box::pin(async move {
            let rows = sqlx::query(ACCESS_VIEW_QUERY)
                .bind(ids)
                .bind(now)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(db)?;
            rows.iter().map(row_to_view).collect()
        })
    }

    fn mark_preorder_paid(
        &mut self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<PaidPreorder>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                WITH target AS (
                    SELECT id, user_id, edition_id, plan, address_id, status
                    FROM orders
                    WHERE id = $1 AND kind = 'preorder' AND edition_id IS NOT NULL
                    FOR UPDATE
                ),
                paid AS (
                    UPDATE orders o
                    SET status = 'paid', paid_at = $2
                    FROM target t
                    WHERE o.id = t.id AND t.status = 'pending'
                    RETURNING o.id
                )
                SELECT t.id, t.user_id, t.edition_id, t.plan, t.address_id,
                       EXISTS (SELECT 1 FROM paid) AS newly_paid
                FROM target t
                ",
            )
            .bind(order_id.0)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;

            row.map(|row| {
                let plan: String = row.try_get("plan").map_err(decode)?;
                Ok(PaidPreorder {
                    order_id: OrderId(row.try_get("id").map_err(decode)?),
                    user_id: UserId(row.try_get("user_id").map_err(decode)?),
                    edition_id: EditionId(row.try_get("edition_id").map_err(decode)?),
                    plan: PlanType::parse(&plan)?,
                    address_id: row
                        .try_get::<Option<Uuid>, _>("address_id")
                        .map_err(decode)?
                        .map(AddressId),
                    newly_paid: row.try_get("newly_paid").map_err(decode)?,
                })
            })
            .transpose()
        })
    }

    fn renew_subscription(
        &mut self,
        subscription_id: SubscriptionId,
        period: BillingPeriod,
    ) -> BoxFuture<'_, Result<Option<Subscription>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                UPDATE subscriptions
                SET status = 'active',
                    current_period_start = $2,
                    current_period_end = $3,
                    updated_at = now()
                WHERE id = $1
                RETURNING id, user_id, plan, status, current_period_start,
                          current_period_end, address_id
                ",
            )
            .bind(subscription_id.0)
            .bind(period.start)
            .bind(period.end)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;

            row.as_ref().map(row_to_subscription).transpose()
        })
    }

    fn record_order(&mut self, order: NewOrder) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO orders (
                    id, user_id, kind, status, amount_cents, external_event_id,
                    plan, address_id, subscription_id, paid_at
                )
                SELECT $1, $2, $3, 'paid', $4, $5,
                       COALESCE(s.plan, 'digital'), s.address_id, $6, $7
                FROM (SELECT 1) AS one
                LEFT JOIN subscriptions s ON s.id = $6
                ON CONFLICT (external_event_id) DO NOTHING
                ",
            )
            .bind(order.id.0)
            .bind(order.user_id.0)
            .bind(order.kind.as_str())
            .bind(order.amount_cents)
            .bind(&order.external_event_id)
            .bind(order.subscription_id.map(|id| id.0))
            .bind(order.paid_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn record_payment(&mut self, payment: NewPayment) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO payments (order_id, amount_cents, provider_reference, paid_at)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(payment.order_id.0)
            .bind(payment.amount_cents)
            .bind(&payment.provider_reference)
            .bind(payment.paid_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
            Ok(())
        })
    }

    fn next_unseen_edition(
        &mut self,
        user_id: UserId,
    ) -> BoxFuture<'_, Result<Option<Edition>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                SELECT {EDITION_COLUMNS}
                FROM editions e
                WHERE e.status <> 'closed'
                  AND NOT EXISTS (
                      SELECT 1 FROM edition_access a
                      WHERE a.edition_id = e.id AND a.user_id = $1
                  )
                ORDER BY e.number ASC
                LIMIT 1
                FOR SHARE OF e
                "
            ))
            .bind(user_id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;
            row.as_ref().map(row_to_edition).transpose()
        })
    }

    fn upsert_access(&mut self, access: NewAccess) -> BoxFuture<'_, Result<AccessUpsert, StoreError>> {
        Box::pin(async move {
            let inserted = sqlx::query(&format!(
                r"
                INSERT INTO edition_access (
                    id, user_id, edition_id, status, unlock_at, unlocked_at,
                    granted_at, expires_at, subscription_id, access_type
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (user_id, edition_id) DO NOTHING
                RETURNING {ACCESS_COLUMNS}
                "
            ))
            .bind(AccessId::new().0)
            .bind(access.user_id.0)
            .bind(access.edition_id.0)
            .bind(access.status.as_str())
            .bind(access.unlock_at)
            .bind(access.unlocked_at)
            .bind(access.granted_at)
            .bind(access.expires_at)
            .bind(access.subscription_id.map(|id| id.0))
            .bind(access.access_type.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;

            if let Some(row) = inserted {
                return Ok(AccessUpsert {
                    access: row_to_access(&row)?,
                    created: true,
                });
            }

            let existing = sqlx::query(&format!(
                "SELECT {ACCESS_COLUMNS} FROM edition_access WHERE user_id = $1 AND edition_id = $2"
            ))
            .bind(access.user_id.0)
            .bind(access.edition_id.0)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db)?;

            Ok(AccessUpsert {
                access: row_to_access(&existing)?,
                created: false,
            })
        })
    }

    fn create_shipment_request(
        &mut self,
        shipment: NewShipment,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO shipment_requests (
                    user_id, edition_id, address_id, subscription_id, requested_at
                ) VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, edition_id) DO NOTHING
                ",
            )
            .bind(shipment.user_id.0)
            .bind(shipment.edition_id.0)
            .bind(shipment.address_id.0)
            .bind(shipment.subscription_id.map(|id| id.0))
            .bind(shipment.requested_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn find_user(&mut self, user_id: UserId) -> BoxFuture<'_, Result<Option<UserContact>, StoreError>> {
        Box::pin(async move {
            let row: Option<(Uuid, String, Option<String>)> =
                sqlx::query_as("SELECT id, email, name FROM users WHERE id = $1")
                    .bind(user_id.0)
                    .fetch_optional(&mut *self.tx)
                    .await
                    .map_err(db)?;

            Ok(row.map(|(id, email, name)| UserContact {
                user_id: UserId(id),
                email,
                name,
            }))
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move { self.tx.commit().await.map_err(db) })
    }
}

fn row_to_edition(row: &PgRow) -> Result<Edition, StoreError> {
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Edition {
        id: EditionId(row.try_get("id").map_err(decode)?),
        number: row.try_get("number").map_err(decode)?,
        status: EditionStatus::parse(&status)?,
        release_date: row.try_get("release_date").map_err(decode)?,
        ready_for_release: row.try_get("ready_for_release").map_err(decode)?,
        max_copies: row.try_get("max_copies").map_err(decode)?,
        released_at: row.try_get("released_at").map_err(decode)?,
    })
}

fn row_to_access(row: &PgRow) -> Result<EditionAccess, StoreError> {
    let status: String = row.try_get("status").map_err(decode)?;
    let access_type: String = row.try_get("access_type").map_err(decode)?;
    Ok(EditionAccess {
        id: AccessId(row.try_get("id").map_err(decode)?),
        user_id: UserId(row.try_get("user_id").map_err(decode)?),
        edition_id: EditionId(row.try_get("edition_id").map_err(decode)?),
        status: AccessStatus::parse(&status)?,
        unlock_at: row.try_get("unlock_at").map_err(decode)?,
        unlocked_at: row.try_get("unlocked_at").map_err(decode)?,
        granted_at: row.try_get("granted_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        subscription_id: row
            .try_get::<Option<Uuid>, _>("subscription_id")
            .map_err(decode)?
            .map(SubscriptionId),
        access_type: PlanType::parse(&access_type)?,
    })
}

fn row_to_view(row: &PgRow) -> Result<AccessView, StoreError> {
    let access_type: String = row.try_get("access_type").map_err(decode)?;
    Ok(AccessView {
        access_id: AccessId(row.try_get("access_id").map_err(decode)?),
        user_id: UserId(row.try_get("user_id").map_err(decode)?),
        edition_id: EditionId(row.try_get("edition_id").map_err(decode)?),
        edition_number: row.try_get("edition_number").map_err(decode)?,
        access_type: PlanType::parse(&access_type)?,
        unlocked_at: row.try_get("unlocked_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        release_date: row.try_get("release_date").map_err(decode)?,
        ready_for_release: row.try_get("ready_for_release").map_err(decode)?,
    })
}

fn row_to_subscription(row: &PgRow) -> Result<Subscription, StoreError> {
    let plan: String = row.try_get("plan").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Subscription {
        id: SubscriptionId(row.try_get("id").map_err(decode)?),
        user_id: UserId(row.try_get("user_id").map_err(decode)?),
        plan: PlanType::parse(&plan)?,
        status: SubscriptionStatus::parse(&status)?,
        current_period_start: row.try_get("current_period_start").map_err(decode)?,
        current_period_end: row.try_get("current_period_end").map_err(decode)?,
        address_id: row
            .try_get::<Option<Uuid>, _>("address_id")
            .map_err(decode)?
            .map(AddressId),
    })
}
