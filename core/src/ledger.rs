//! Event ledger: the idempotency guard over external event identifiers.
//!
//! Every side-effecting handler of an external event runs between
//! [`EventLedger::begin_event`] and [`EventLedger::complete_event`]. The ledger's
//! atomic "insert if absent" is the only thing standing between at-least-once
//! delivery (provider webhooks, redelivered jobs) and duplicated side effects.
//!
//! # Entry lifecycle
//!
//! ```text
//!   (absent) ──begin──► PROCESSING ──complete(ok)──► HANDLED   (terminal)
//!                           │
//!                           └──complete(err)──► FAILED ──begin──► PROCESSING
//! ```
//!
//! A PROCESSING entry is never taken over automatically; recovering one whose
//! worker died is an operator decision.

use crate::{BoxFuture, UnknownCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// A worker owns the event.
    Processing,
    /// Side effects are committed; never reprocess.
    Handled,
    /// The last attempt failed; the next `begin_event` may retry it.
    Failed,
}

impl LedgerStatus {
    /// Convert status to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Handled => "handled",
            Self::Failed => "failed",
        }
    }

    /// Parse status from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "processing" => Ok(Self::Processing),
            "handled" => Ok(Self::Handled),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownCode::new("ledger status", s)),
        }
    }
}

/// A ledger record keyed by the external event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// External event id.
    pub id: String,
    /// Provider event type.
    pub event_type: String,
    /// Current status.
    pub status: LedgerStatus,
    /// Raw provider payload, kept for diagnostics and replays.
    pub raw_payload: serde_json::Value,
    /// Last failure, for FAILED entries.
    pub error_message: Option<String>,
    /// Number of times processing was started.
    pub attempts: i32,
    /// When the entry became HANDLED.
    pub handled_at: Option<DateTime<Utc>>,
    /// First sighting.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage backend failure.
    #[error("Ledger database error: {0}")]
    Database(String),

    /// `complete_event` was called for an event the ledger has never seen.
    #[error("Ledger entry not found: {0}")]
    NotFound(String),

    /// A stored row could not be decoded.
    #[error("Ledger decode error: {0}")]
    Decode(String),
}

impl From<UnknownCode> for LedgerError {
    fn from(err: UnknownCode) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Durable idempotency record over external event identifiers.
///
/// Implementations must make the first-sighting insert and the FAILED →
/// PROCESSING flip atomic with respect to concurrent callers.
pub trait EventLedger: Send + Sync {
    /// Claim an event for processing.
    ///
    /// - First sighting: inserts a PROCESSING entry and returns it.
    /// - Existing HANDLED entry: returns `None` (duplicate delivery, skip).
    /// - Existing PROCESSING entry: returns `None` (another worker owns it, skip).
    /// - Existing FAILED entry: flips it back to PROCESSING and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the backend fails.
    fn begin_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: serde_json::Value,
    ) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>>;

    /// Record the terminal status of an attempt.
    ///
    /// `HANDLED` stamps `handled_at`; `FAILED` persists `error_message`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for unknown events and
    /// [`LedgerError::Database`] if the backend fails.
    fn complete_event(
        &self,
        event_id: &str,
        event_type: &str,
        status: LedgerStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<(), LedgerError>>;

    /// Look up an entry without claiming it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the backend fails.
    fn find(&self, event_id: &str) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>>;

    /// List entries in a status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the backend fails.
    fn list_by_status(
        &self,
        status: LedgerStatus,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<LedgerEntry>, LedgerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_status_roundtrip() {
        for status in [
            LedgerStatus::Processing,
            LedgerStatus::Handled,
            LedgerStatus::Failed,
        ] {
            assert_eq!(LedgerStatus::parse(status.as_str()), Ok(status));
        }
        assert!(LedgerStatus::parse("done").is_err());
    }
}
