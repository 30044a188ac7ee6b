//! # Editions Core
//!
//! Domain types and capability traits for the edition entitlement pipeline.
//!
//! The pipeline sells numbered, time-gated editions through preorders and
//! subscriptions and unlocks each user's access to an edition exactly once,
//! even though the triggers (payment webhooks, release timers, retried jobs)
//! arrive asynchronously and more than once.
//!
//! ## Architecture
//!
//! ```text
//!  signed webhook ──► WebhookVerifier ──► EventLedger (seen?) ──► JobQueue[payments]
//!                                                                      │
//!                                          SettlementWorker ◄──────────┘
//!                                          (begin/complete ledger entry)
//!                                                │
//!                                                ▼
//!  release timer ──► JobQueue[editions] ──► ReleaseEngine ──► EntitlementStore (tx)
//!                                                │
//!                          ┌─────────────────────┴──────────────────┐
//!                          ▼                                        ▼
//!                 EntitlementCache (write-through)      NotificationFanout ──► JobQueue[email]
//! ```
//!
//! This crate only defines the vocabulary and the seams:
//!
//! - [`ledger::EventLedger`]: durable idempotency guard over external event ids
//! - [`queue::JobQueue`]: named, durable, retryable work queues
//! - [`store::EntitlementStore`]: transactional system of record
//! - [`cache::CacheStore`]: best-effort key/value cache with TTLs
//! - [`notify::Mailer`]: outbound templated messages
//! - [`webhook::WebhookVerifier`]: signature verification and normalization
//! - [`environment::Clock`]: injectable time
//!
//! Implementations live in `editions-postgres`, `editions-redis` and
//! `editions-testing`; the services that drive them live in `editions-pipeline`.

pub mod access;
pub mod cache;
pub mod commerce;
pub mod edition;
pub mod environment;
pub mod ids;
pub mod ledger;
pub mod notify;
pub mod payment;
pub mod queue;
pub mod store;
pub mod webhook;

pub use access::{AccessStatus, AccessView, EditionAccess, NewAccess, PlanType, UnlockedGrant};
pub use edition::{Edition, EditionStatus};
pub use ids::{AccessId, AddressId, EditionId, JobId, OrderId, SubscriptionId, UserId};
pub use payment::{OrderType, PaymentEvent, PaymentEventKind};

/// Boxed, `Send` future returned by every capability trait so the traits stay
/// usable as `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// A stored status/kind code that does not map to any known variant.
///
/// Status enums are persisted as lower-case text codes; reading an unknown code
/// means the schema and the binary disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} code: {code}")]
pub struct UnknownCode {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending code.
    pub code: String,
}

impl UnknownCode {
    /// Create a new unknown-code error.
    #[must_use]
    pub fn new(kind: &'static str, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
        }
    }
}
