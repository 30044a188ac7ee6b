//! Edition release engine.
//!
//! A release is one store transaction:
//!
//! 1. conditionally activate the edition (`status NOT IN (active, closed)`),
//!    the only guard against two concurrent releases of the same edition
//! 2. flip every SCHEDULED grant of the edition to ACTIVE, returning the
//!    grantees
//! 3. stop early when nobody was waiting
//! 4. re-read the full access list of every affected user
//!
//! After the commit, and never inside the transaction, the engine pushes the
//! fresh lists into the entitlement cache and fans release notifications out
//! onto the email queue. Neither post-commit step can fail the release.

use crate::cache::{EntitlementCache, RefreshReport, UserAccessUpdate};
use crate::config::ReleaseConfig;
use crate::error::ReleaseError;
use crate::fanout::{FanoutReport, NotificationFanout};
use editions_core::access::UnlockedGrant;
use editions_core::edition::{Edition, EditionStatus};
use editions_core::environment::Clock;
use editions_core::ids::UserId;
use editions_core::notify::Recipient;
use editions_core::store::EntitlementStore;
use editions_runtime::metrics::ReleaseMetrics;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// A committed release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditionRelease {
    /// The edition as activated.
    pub edition: Edition,
    /// Grants flipped from SCHEDULED to ACTIVE.
    pub unlocked_count: usize,
    /// The unlocked grants with grantee identity, sorted by email.
    pub affected_users: Vec<UnlockedGrant>,
    /// Post-commit cache refresh.
    pub cache: RefreshReport,
    /// Post-commit notification fan-out.
    pub notifications: FanoutReport,
}

/// Result of [`ReleaseEngine::release_edition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The edition was activated by this call.
    Released(EditionRelease),
    /// The edition was already active or closed; nothing changed.
    NoOp {
        /// Edition that was asked for.
        edition_number: i32,
        /// Its status, untouched.
        current_status: EditionStatus,
    },
}

impl ReleaseOutcome {
    /// Whether this call released the edition.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        matches!(self, Self::Released(_))
    }

    /// Grants unlocked by this call (zero for a no-op).
    #[must_use]
    pub fn unlocked_count(&self) -> usize {
        match self {
            Self::Released(release) => release.unlocked_count,
            Self::NoOp { .. } => 0,
        }
    }
}

/// Drives editions from scheduled to released.
pub struct ReleaseEngine {
    store: Arc<dyn EntitlementStore>,
    cache: Arc<EntitlementCache>,
    fanout: Arc<NotificationFanout>,
    clock: Arc<dyn Clock>,
    config: ReleaseConfig,
}

impl ReleaseEngine {
    /// Create an engine with default behaviour.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        cache: Arc<EntitlementCache>,
        fanout: Arc<NotificationFanout>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            fanout,
            clock,
            config: ReleaseConfig::default(),
        }
    }

    /// Replace the behaviour switches.
    #[must_use]
    pub fn with_config(mut self, config: ReleaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Release edition `number`.
    ///
    /// Releasing an edition that is already active or closed is a
    /// [`ReleaseOutcome::NoOp`], so the call is safe to repeat and safe to
    /// race against itself.
    ///
    /// # Errors
    ///
    /// - [`ReleaseError::EditionNotFound`] if no edition has this number
    /// - [`ReleaseError::Store`] if the transaction fails; nothing is applied
    #[tracing::instrument(skip(self), name = "release_edition")]
    pub async fn release_edition(&self, number: i32) -> Result<ReleaseOutcome, ReleaseError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let Some(edition) = tx.activate_edition(number, now).await? else {
            let current = tx.find_edition_by_number(number).await?;
            drop(tx);
            let Some(current) = current else {
                return Err(ReleaseError::EditionNotFound(number));
            };
            info!(
                edition_number = number,
                status = %current.status,
                "Edition already released, nothing to do"
            );
            return Ok(ReleaseOutcome::NoOp {
                edition_number: number,
                current_status: current.status,
            });
        };

        let affected_users = tx.unlock_scheduled_access(edition.id, now).await?;
        if affected_users.is_empty() {
            tx.commit().await?;
            ReleaseMetrics::record_release(0);
            info!(edition_number = number, "Edition released with no scheduled access");
            return Ok(ReleaseOutcome::Released(EditionRelease {
                edition,
                unlocked_count: 0,
                affected_users,
                cache: RefreshReport::default(),
                notifications: FanoutReport::default(),
            }));
        }

        let users: Vec<UserId> = affected_users
            .iter()
            .map(|grant| grant.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let views = tx.active_access_for_users(users.clone(), now).await?;
        tx.commit().await?;

        let unlocked_count = affected_users.len();
        ReleaseMetrics::record_release(unlocked_count);
        info!(
            edition_number = number,
            unlocked = unlocked_count,
            users = users.len(),
            "Edition released"
        );

        let cache = self
            .cache
            .refresh_users(UserAccessUpdate::group(&users, views))
            .await;
        let notifications = if self.config.notify {
            self.notify(number, &affected_users).await
        } else {
            FanoutReport::default()
        };

        Ok(ReleaseOutcome::Released(EditionRelease {
            edition,
            unlocked_count,
            affected_users,
            cache,
            notifications,
        }))
    }

    /// Release the earliest edition that is ready and due today.
    ///
    /// Returns `None` when nothing is due; that is logged, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError`] if the lookup or the release fails.
    pub async fn release_next_pending_edition(&self) -> Result<Option<ReleaseOutcome>, ReleaseError> {
        let today = self.clock.today();
        let Some(edition) = self.store.next_releasable_edition(today).await? else {
            info!(%today, "No edition due for release");
            return Ok(None);
        };
        self.release_edition(edition.number).await.map(Some)
    }

    /// Expire lapsed grants and drop the affected users' cache entries.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Store`] if the sweep fails. Cache failures are
    /// logged only; the entries age out with their TTL.
    pub async fn expire_lapsed_access(&self) -> Result<Vec<UserId>, ReleaseError> {
        let users = self.store.expire_lapsed_access(self.clock.now()).await?;
        for user_id in &users {
            if let Err(e) = self.cache.invalidate(*user_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to invalidate expired access");
            }
        }
        ReleaseMetrics::record_expired(users.len());
        if !users.is_empty() {
            info!(users = users.len(), "Lapsed access expired");
        }
        Ok(users)
    }

    async fn notify(&self, number: i32, grants: &[UnlockedGrant]) -> FanoutReport {
        let (digital, physical): (Vec<&UnlockedGrant>, Vec<&UnlockedGrant>) = grants
            .iter()
            .partition(|grant| grant.access_type.includes_digital());

        let readers = self
            .fanout
            .send_edition_release_emails(number, recipients(&digital), self.config.digital_template)
            .await;
        let shipping = self
            .fanout
            .send_edition_release_emails(number, recipients(&physical), self.config.physical_template)
            .await;
        readers.merge(shipping)
    }
}

fn recipients(grants: &[&UnlockedGrant]) -> Vec<Recipient> {
    grants
        .iter()
        .map(|grant| Recipient::user(grant.user_id, grant.email.clone(), grant.name.clone()))
        .collect()
}
