//! `PostgreSQL` adapters for the edition pipeline.
//!
//! - [`PostgresEntitlementStore`]: the system of record. Releases and
//!   settlements run inside `sqlx` transactions; the release guard is a
//!   conditional `UPDATE ... WHERE status NOT IN ('active', 'closed')`.
//! - [`PostgresEventLedger`]: idempotency over external event ids via
//!   `INSERT ... ON CONFLICT DO NOTHING`.
//! - [`PostgresJobQueue`]: durable queues claimed with `FOR UPDATE SKIP LOCKED`.
//!
//! All statements are runtime-checked `sqlx::query` calls; the schema lives in
//! `migrations/` and is applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use editions_postgres::{PostgresEntitlementStore, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/editions").await?;
//!     migrate(&pool).await?;
//!     let store = PostgresEntitlementStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ledger;
mod queue;
mod store;

pub use ledger::PostgresEventLedger;
pub use queue::PostgresJobQueue;
pub use store::PostgresEntitlementStore;

use sqlx::PgPool;

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns the migration error if any migration fails to apply.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Convert a usize limit into a SQL `LIMIT` bind.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
