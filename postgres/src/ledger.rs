//! `PostgreSQL` event ledger over the `payment_events` table.

use crate::sql_limit;
use chrono::{DateTime, Utc};
use editions_core::BoxFuture;
use editions_core::ledger::{EventLedger, LedgerEntry, LedgerError, LedgerStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const ENTRY_COLUMNS: &str = "id, event_type, status, raw_payload, error_message, attempts, \
                             handled_at, created_at, updated_at";

/// [`EventLedger`] backed by `PostgreSQL`.
///
/// The first-sighting insert relies on the primary key of `payment_events`
/// (`ON CONFLICT (id) DO NOTHING`), and the FAILED → PROCESSING flip is a
/// conditional `UPDATE`, so two workers racing on one event never both win.
#[derive(Clone)]
pub struct PostgresEventLedger {
    pool: PgPool,
}

impl PostgresEventLedger {
    /// Create a ledger over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: serde_json::Value,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let inserted = sqlx::query(&format!(
            r"
            INSERT INTO payment_events (id, event_type, status, raw_payload, attempts)
            VALUES ($1, $2, 'processing', $3, 1)
            ON CONFLICT (id) DO NOTHING
            RETURNING {ENTRY_COLUMNS}
            "
        ))
        .bind(event_id)
        .bind(event_type)
        .bind(&raw_payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Database(e.to_string()))?;

        if let Some(row) = inserted {
            metrics::counter!("ledger.events.claimed", "kind" => "first").increment(1);
            return row_to_entry(&row).map(Some);
        }

        let retried = sqlx::query(&format!(
            r"
            UPDATE payment_events
            SET status = 'processing',
                attempts = attempts + 1,
                error_message = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'failed'
            RETURNING {ENTRY_COLUMNS}
            "
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Database(e.to_string()))?;

        match retried {
            Some(row) => {
                let entry = row_to_entry(&row)?;
                tracing::info!(
                    event_id = event_id,
                    attempts = entry.attempts,
                    "Retrying previously failed payment event"
                );
                metrics::counter!("ledger.events.claimed", "kind" => "retry").increment(1);
                Ok(Some(entry))
            }
            None => {
                tracing::debug!(event_id = event_id, "Payment event already claimed or handled");
                Ok(None)
            }
        }
    }

    async fn complete(
        &self,
        event_id: &str,
        event_type: &str,
        status: LedgerStatus,
        error_message: Option<String>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r"
            UPDATE payment_events
            SET status = $2,
                error_message = $3,
                handled_at = CASE WHEN $2 = 'handled' THEN now() ELSE handled_at END,
                updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(error_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(event_id.to_string()));
        }

        if status == LedgerStatus::Failed {
            tracing::warn!(
                event_id = event_id,
                event_type = event_type,
                error = error_message.as_deref().unwrap_or_default(),
                "Payment event failed"
            );
        } else {
            tracing::debug!(event_id = event_id, event_type = event_type, status = %status.as_str(), "Payment event completed");
        }
        metrics::counter!("ledger.events.completed", "status" => status.as_str()).increment(1);

        Ok(())
    }

    async fn find_entry(&self, event_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM payment_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Database(e.to_string()))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list(&self, status: LedgerStatus, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ENTRY_COLUMNS}
            FROM payment_events
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "
        ))
        .bind(status.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Database(e.to_string()))?;

        rows.iter().map(row_to_entry).collect()
    }
}

impl EventLedger for PostgresEventLedger {
    fn begin_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: serde_json::Value,
    ) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>> {
        let event_id = event_id.to_string();
        let event_type = event_type.to_string();
        Box::pin(async move { self.begin(&event_id, &event_type, raw_payload).await })
    }

    fn complete_event(
        &self,
        event_id: &str,
        event_type: &str,
        status: LedgerStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<(), LedgerError>> {
        let event_id = event_id.to_string();
        let event_type = event_type.to_string();
        Box::pin(async move {
            self.complete(&event_id, &event_type, status, error_message)
                .await
        })
    }

    fn find(&self, event_id: &str) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>> {
        let event_id = event_id.to_string();
        Box::pin(async move { self.find_entry(&event_id).await })
    }

    fn list_by_status(
        &self,
        status: LedgerStatus,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<LedgerEntry>, LedgerError>> {
        Box::pin(self.list(status, limit))
    }
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let decode = |e: sqlx::Error| LedgerError::Decode(e.to_string());
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(LedgerEntry {
        id: row.try_get("id").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        status: LedgerStatus::parse(&status)?,
        raw_payload: row.try_get("raw_payload").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        attempts: row.try_get("attempts").map_err(decode)?,
        handled_at: row
            .try_get::<Option<DateTime<Utc>>, _>("handled_at")
            .map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}
