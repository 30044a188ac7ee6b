//! In-memory event ledger.

use crate::lock;
use editions_core::BoxFuture;
use editions_core::environment::Clock;
use editions_core::ledger::{EventLedger, LedgerEntry, LedgerError, LedgerStatus};
use std::collections::HashMap;
use std::future::ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory [`EventLedger`].
///
/// The map lock makes `begin_event` atomic, mirroring the unique-key insert of
/// the SQL ledger.
pub struct InMemoryEventLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
    clock: Arc<dyn Clock>,
    failing_completions: AtomicUsize,
}

impl InMemoryEventLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            failing_completions: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` calls to `complete_event` fail.
    pub fn fail_next_completions(&self, n: usize) {
        self.failing_completions.store(n, Ordering::SeqCst);
    }

    /// Entry for `event_id`.
    #[must_use]
    pub fn entry(&self, event_id: &str) -> Option<LedgerEntry> {
        lock(&self.entries).get(event_id).cloned()
    }

    /// Seed an entry directly.
    pub fn insert(&self, entry: LedgerEntry) {
        lock(&self.entries).insert(entry.id.clone(), entry);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_completions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EventLedger for InMemoryEventLedger {
    fn begin_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: serde_json::Value,
    ) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>> {
        let now = self.clock.now();
        let mut entries = lock(&self.entries);
        let result = match entries.get_mut(event_id) {
            None => {
                let entry = LedgerEntry {
                    id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    status: LedgerStatus::Processing,
                    raw_payload,
                    error_message: None,
                    attempts: 1,
                    handled_at: None,
                    created_at: now,
                    updated_at: now,
                };
                entries.insert(event_id.to_string(), entry.clone());
                Some(entry)
            }
            Some(entry) if entry.status == LedgerStatus::Failed => {
                entry.status = LedgerStatus::Processing;
                entry.attempts += 1;
                entry.updated_at = now;
                Some(entry.clone())
            }
            Some(_) => None,
        };
        Box::pin(ready(Ok(result)))
    }

    fn complete_event(
        &self,
        event_id: &str,
        _event_type: &str,
        status: LedgerStatus,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<(), LedgerError>> {
        if self.take_injected_failure() {
            return Box::pin(ready(Err(LedgerError::Database(
                "injected completion fault".to_string(),
            ))));
        }
        let now = self.clock.now();
        let mut entries = lock(&self.entries);
        let result = match entries.get_mut(event_id) {
            None => Err(LedgerError::NotFound(event_id.to_string())),
            Some(entry) => {
                entry.status = status;
                entry.updated_at = now;
                if status == LedgerStatus::Handled {
                    entry.handled_at = Some(now);
                    entry.error_message = None;
                } else {
                    entry.error_message = error_message;
                }
                Ok(())
            }
        };
        Box::pin(ready(result))
    }

    fn find(&self, event_id: &str) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>> {
        Box::pin(ready(Ok(self.entry(event_id))))
    }

    fn list_by_status(
        &self,
        status: LedgerStatus,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<LedgerEntry>, LedgerError>> {
        let mut found: Vec<LedgerEntry> = lock(&self.entries)
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        found.truncate(limit);
        Box::pin(ready(Ok(found)))
    }
}
