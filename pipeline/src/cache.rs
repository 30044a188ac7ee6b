//! Per-user entitlement cache.
//!
//! Each user's ACTIVE, released grants are cached as one JSON list under
//! `user_access:{user_id}` with a 24 hour TTL. Reads fall back to the store on
//! any cache problem; writes after a release push the freshly computed list
//! (write-through) instead of deleting and letting every reader recompute.

use crate::config::CacheConfig;
use editions_core::access::AccessView;
use editions_core::cache::{CacheError, CacheStore};
use editions_core::environment::Clock;
use editions_core::ids::UserId;
use editions_core::store::{EntitlementStore, StoreError};
use editions_runtime::metrics::CacheMetrics;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The full access list of one user, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccessUpdate {
    /// User whose entry is written.
    pub user_id: UserId,
    /// The user's ACTIVE, non-expired grants.
    pub access: Vec<AccessView>,
}

impl UserAccessUpdate {
    /// Group access views by user, keeping every user in `users` even when
    /// they have no views.
    #[must_use]
    pub fn group(users: &[UserId], views: Vec<AccessView>) -> Vec<Self> {
        let mut by_user: BTreeMap<UserId, Vec<AccessView>> =
            users.iter().map(|u| (*u, Vec::new())).collect();
        for view in views {
            by_user.entry(view.user_id).or_default().push(view);
        }
        by_user
            .into_iter()
            .map(|(user_id, access)| Self { user_id, access })
            .collect()
    }

    /// Whether any grant unlocks digital reading.
    #[must_use]
    pub fn has_digital_access(&self) -> bool {
        self.access.iter().any(|v| v.access_type.includes_digital())
    }
}

/// Outcome of [`EntitlementCache::refresh_users`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Entries written.
    pub refreshed: usize,
    /// Physical-only users left untouched.
    pub skipped: usize,
    /// Writes that failed (logged, not propagated).
    pub failed: usize,
}

/// Read-through, write-through cache over the entitlement store.
pub struct EntitlementCache {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl EntitlementCache {
    /// Create a cache with default tuning.
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            config: CacheConfig::default(),
        }
    }

    /// Replace the tuning.
    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache key of a user's access list.
    #[must_use]
    pub fn key(user_id: UserId) -> String {
        format!("user_access:{user_id}")
    }

    /// A user's released, active grants.
    ///
    /// Served from the cache when possible. A miss, an unreachable cache or a
    /// corrupt entry all recompute from the store and write the result back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only when the store itself fails.
    pub async fn get_user_access(&self, user_id: UserId) -> Result<Vec<AccessView>, StoreError> {
        let key = Self::key(user_id);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<AccessView>>(&raw) {
                Ok(access) => return Ok(access),
                Err(e) => warn!(user_id = %user_id, error = %e, "Corrupt access cache entry, recomputing"),
            },
            Ok(None) => debug!(user_id = %user_id, "Access cache miss"),
            Err(e) => warn!(user_id = %user_id, error = %e, "Access cache unreachable, reading store"),
        }

        self.reload_user(user_id).await
    }

    /// Recompute a user's list from the store and write it through.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store read fails. A failed cache write is
    /// logged and the fresh list is still returned.
    pub async fn reload_user(&self, user_id: UserId) -> Result<Vec<AccessView>, StoreError> {
        let access = self
            .store
            .active_access_for_user(user_id, self.clock.now())
            .await?;
        let visible = self.visible(access);
        if let Err(e) = self.write(user_id, &visible).await {
            CacheMetrics::record_refresh_failures(1);
            warn!(user_id = %user_id, error = %e, "Failed to write access cache entry");
        }
        Ok(visible)
    }

    /// Push freshly computed lists for many users.
    ///
    /// Users without any digital grant are skipped. Writes run in batches of
    /// `batch_size` with at most `concurrency` in flight; a failed write is
    /// counted and logged and never aborts the remaining users.
    pub async fn refresh_users(&self, updates: Vec<UserAccessUpdate>) -> RefreshReport {
        let mut report = RefreshReport::default();
        let (digital, physical_only): (Vec<_>, Vec<_>) = updates
            .into_iter()
            .partition(UserAccessUpdate::has_digital_access);
        report.skipped = physical_only.len();

        for (index, batch) in digital.chunks(self.config.batch_size).enumerate() {
            let results: Vec<(UserId, Result<(), CacheError>)> = stream::iter(batch)
                .map(|update| async move {
                    let visible = self.visible(update.access.clone());
                    (update.user_id, self.write(update.user_id, &visible).await)
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;

            for (user_id, result) in results {
                match result {
                    Ok(()) => report.refreshed += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(user_id = %user_id, batch = index, error = %e, "Access cache refresh failed");
                    }
                }
            }
        }

        if report.failed > 0 {
            CacheMetrics::record_refresh_failures(report.failed);
        }
        info!(
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            "Access cache refreshed"
        );
        report
    }

    /// Drop a user's cached list.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache is unreachable.
    pub async fn invalidate(&self, user_id: UserId) -> Result<(), CacheError> {
        self.cache.delete(&Self::key(user_id)).await
    }

    fn visible(&self, access: Vec<AccessView>) -> Vec<AccessView> {
        let today = self.clock.today();
        access
            .into_iter()
            .filter(|view| view.is_visible_on(today))
            .collect()
    }

    async fn write(&self, user_id: UserId, access: &[AccessView]) -> Result<(), CacheError> {
        let value = serde_json::to_string(access)?;
        self.cache
            .set_with_ttl(&Self::key(user_id), value, self.config.ttl)
            .await
    }
}
