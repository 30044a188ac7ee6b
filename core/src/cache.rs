//! Best-effort key/value cache with TTLs.
//!
//! Never the system of record: every reader must be able to fall back to
//! the entitlement store.

use crate::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Cache backend unreachable or rejected the command.
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Cached value could not be encoded or decoded.
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// String key/value cache.
pub trait CacheStore: Send + Sync {
    /// Read a key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the cache is unreachable.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>>;

    /// Write a key that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the cache is unreachable.
    fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Remove a key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the cache is unreachable.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>>;
}
