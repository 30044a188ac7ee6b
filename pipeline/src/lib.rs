//! # Editions Pipeline
//!
//! The services that turn payments and release dates into access:
//!
//! - [`PaymentIntake`]: verifies signed provider notifications and enqueues
//!   settlement jobs
//! - [`SettlementWorker`]: ledger-guarded payments-queue handler
//! - [`ReleaseEngine`]: conditional edition activation plus bulk unlock in one
//!   transaction, followed by cache write-through and notification fan-out
//! - [`EntitlementCache`]: per-user access lists over a [`CacheStore`](editions_core::cache::CacheStore)
//! - [`NotificationFanout`] and [`MessageDispatcher`]: bounded email batches
//!   and their delivery
//! - [`EditionJobHandler`]: editions-queue handler for release and expiry jobs
//!
//! Every service takes its collaborators as `Arc<dyn Trait>` from
//! `editions-core`, so the same code runs against Postgres/Redis in the worker
//! binary and against `editions-testing` doubles in tests.
//!
//! ## Example
//!
//! ```
//! use editions_core::EditionStatus;
//! use editions_core::environment::Clock;
//! use editions_pipeline::{EntitlementCache, NotificationFanout, ReleaseEngine};
//! use editions_testing::{
//!     fixtures, test_clock, InMemoryCacheStore, InMemoryEntitlementStore, InMemoryJobQueue,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock: Arc<dyn Clock> = Arc::new(test_clock());
//! let store = Arc::new(InMemoryEntitlementStore::new());
//! store.insert_edition(fixtures::edition(3, EditionStatus::PreorderOpen)).await;
//!
//! let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
//! let cache = Arc::new(EntitlementCache::new(
//!     Arc::new(InMemoryCacheStore::new()),
//!     store.clone(),
//!     clock.clone(),
//! ));
//! let engine = ReleaseEngine::new(store.clone(), cache, Arc::new(NotificationFanout::new(queue)), clock);
//!
//! assert!(engine.release_edition(3).await.is_ok_and(|o| o.is_released()));
//! assert!(engine.release_edition(3).await.is_ok_and(|o| !o.is_released()));
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod console_mailer;
pub mod dispatcher;
pub mod edition_jobs;
pub mod error;
pub mod fanout;
pub mod intake;
pub mod release;
pub mod settlement;

pub use cache::{EntitlementCache, RefreshReport, UserAccessUpdate};
pub use config::{CacheConfig, FanoutConfig, ReleaseConfig, SettlementConfig};
pub use console_mailer::ConsoleMailer;
pub use dispatcher::MessageDispatcher;
pub use edition_jobs::{EditionJobHandler, ReleaseJob};
pub use error::{FanoutError, IntakeError, ReleaseError, SettlementError};
pub use fanout::{FanoutReport, MessageBatch, NotificationFanout};
pub use intake::{IntakeOutcome, PaymentIntake};
pub use release::{EditionRelease, ReleaseEngine, ReleaseOutcome};
pub use settlement::{SettlementOutcome, SettlementWorker};
