//! In-memory cache.

use crate::lock;
use editions_core::BoxFuture;
use editions_core::cache::{CacheError, CacheStore};
use std::collections::{HashMap, HashSet};
use std::future::ready;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory [`CacheStore`] with failure toggles.
///
/// TTLs are recorded but never enforced.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, (String, Duration)>>,
    failing_keys: Mutex<HashSet<String>>,
    reads_fail: AtomicBool,
    writes_fail: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryCacheStore {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.reads_fail.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }

    /// Make writes to `key` fail.
    pub fn fail_key(&self, key: impl Into<String>) {
        lock(&self.failing_keys).insert(key.into());
    }

    /// Raw value for `key`.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).map(|(v, _)| v.clone())
    }

    /// TTL the value for `key` was written with.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        lock(&self.entries).get(key).map(|(_, ttl)| *ttl)
    }

    /// Store a raw value, bypassing failure toggles.
    pub fn put_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.entries).insert(key.into(), (value.into(), Duration::from_secs(60)));
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let result = if self.reads_fail.load(Ordering::SeqCst) {
            Err(CacheError::Backend("injected read fault".to_string()))
        } else {
            Ok(self.raw(key))
        };
        Box::pin(ready(result))
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let result = if self.writes_fail.load(Ordering::SeqCst) || lock(&self.failing_keys).contains(key) {
            Err(CacheError::Backend(format!("injected write fault for {key}")))
        } else {
            lock(&self.entries).insert(key.to_string(), (value, ttl));
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        Box::pin(ready(result))
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>> {
        let result = if self.writes_fail.load(Ordering::SeqCst) {
            Err(CacheError::Backend("injected delete fault".to_string()))
        } else {
            lock(&self.entries).remove(key);
            Ok(())
        };
        Box::pin(ready(result))
    }
}
