//! # Editions Testing
//!
//! In-memory implementations of every capability trait in `editions-core`,
//! plus fixtures, so pipeline behaviour can be tested without Postgres or
//! Redis.
//!
//! - [`InMemoryEntitlementStore`]: transactional store (one writer at a time,
//!   rollback on drop) with fault injection
//! - [`InMemoryEventLedger`], [`InMemoryJobQueue`], [`InMemoryCacheStore`]
//! - [`RecordingMailer`], [`StaticSignatureVerifier`]
//! - [`FixedClock`]: settable, deterministic time
//!
//! ## Example
//!
//! ```
//! use editions_core::EditionStatus;
//! use editions_testing::{InMemoryEntitlementStore, fixtures};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemoryEntitlementStore::new();
//! store.insert_edition(fixtures::edition(3, EditionStatus::PreorderOpen)).await;
//! assert!(store.edition(3).await.is_some());
//! # }
//! ```

pub mod cache;
pub mod fixtures;
pub mod ledger;
pub mod mailer;
pub mod queue;
pub mod store;
pub mod webhook;

use chrono::{DateTime, Duration, Utc};
use editions_core::environment::Clock;
use std::sync::{Mutex, PoisonError};

pub use cache::InMemoryCacheStore;
pub use ledger::InMemoryEventLedger;
pub use mailer::{RecordingMailer, SentMessage};
pub use queue::InMemoryJobQueue;
pub use store::{InMemoryEntitlementStore, OrderRecord, StoreState, UserRecord};
pub use webhook::StaticSignatureVerifier;

/// Clock that only moves when told to.
///
/// # Example
///
/// ```
/// use chrono::Duration;
/// use editions_core::environment::Clock;
/// use editions_testing::test_clock;
///
/// let clock = test_clock();
/// let before = clock.now();
/// assert_eq!(clock.now(), before);
/// clock.advance(Duration::minutes(5));
/// assert_eq!(clock.now() - before, Duration::minutes(5));
/// ```
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    /// Jump to `time`.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed clock at 2026-03-01 09:00:00 UTC.
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(fixtures::ts(2026, 3, 1, 9))
}

/// Lock a std mutex, ignoring poisoning from a panicked test thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_only_moves_when_told() {
        let clock = test_clock();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(1));
        assert_eq!(clock.now(), start + Duration::hours(1));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
