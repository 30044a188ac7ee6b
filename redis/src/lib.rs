//! Redis-backed [`CacheStore`].
//!
//! Values are stored as plain strings under an optional key prefix with
//! `SETEX`, so every entry carries its own TTL and a stale entry disappears on
//! its own. The entitlement cache built on top never treats Redis as the system
//! of record.
//!
//! # Example
//!
//! ```no_run
//! use editions_redis::RedisCacheStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCacheStore::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use editions_core::BoxFuture;
use editions_core::cache::{CacheError, CacheStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// Redis cache store with TTL-based expiration.
///
/// Cloning is cheap; clones share the underlying `ConnectionManager`, which
/// reconnects on its own after a dropped connection.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn_manager: ConnectionManager,
    prefix: Option<String>,
}

impl RedisCacheStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the URL is invalid or the first
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Backend(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::Backend(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("Connected to Redis cache");
        Ok(Self::from_manager(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            prefix: None,
        }
    }

    /// Namespace every key under `prefix:`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }
}

/// `SETEX` rejects a zero TTL; sub-second TTLs round up to one second.
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

fn backend(e: &redis::RedisError) -> CacheError {
    metrics::counter!("cache.redis.errors").increment(1);
    CacheError::Backend(e.to_string())
}

impl CacheStore for RedisCacheStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let key = self.full_key(key);
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let value: Option<String> = conn.get(&key).await.map_err(|e| backend(&e))?;
            Ok(value)
        })
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = self.full_key(key);
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let () = conn
                .set_ex(&key, value, ttl_seconds(ttl))
                .await
                .map_err(|e| backend(&e))?;
            tracing::trace!(key = %key, ttl_seconds = ttl_seconds(ttl), "Cache entry written");
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = self.full_key(key);
        let mut conn = self.conn_manager.clone();
        Box::pin(async move {
            let _: i64 = conn.del(&key).await.map_err(|e| backend(&e))?;
            Ok(())
        })
    }
}
