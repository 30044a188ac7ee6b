//! Service configuration.
//!
//! Plain structs with production defaults and `with_*` builders. The worker
//! binary fills them from the environment; tests construct them directly.

use editions_core::notify::TemplateType;
use editions_core::queue::{BackoffPolicy, JobOptions};
use editions_runtime::RetryPolicy;
use std::time::Duration;

/// Entitlement cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of a cached access list.
    pub ttl: Duration,
    /// Users written per batch after a release.
    pub batch_size: usize,
    /// Concurrent cache writes within a batch.
    pub concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
            concurrency: 10,
        }
    }
}

impl CacheConfig {
    /// Set the entry TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the refresh batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the per-batch write concurrency (at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Notification fan-out tuning.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Recipients per outbound job.
    pub batch_size: usize,
    /// Delivery attempts per batch job.
    pub max_attempts: u32,
    /// Backoff between batch attempts.
    pub backoff: BackoffPolicy,
    /// Delay before a follow-up batch of failed recipients is attempted.
    pub followup_delay: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            backoff: BackoffPolicy::exponential(Duration::from_secs(30)),
            followup_delay: Duration::from_secs(60),
        }
    }
}

impl FanoutConfig {
    /// Set the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the per-batch attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the per-batch backoff.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the follow-up delay.
    #[must_use]
    pub const fn with_followup_delay(mut self, delay: Duration) -> Self {
        self.followup_delay = delay;
        self
    }

    pub(crate) fn job_options(&self) -> JobOptions {
        JobOptions::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff)
    }
}

/// Release engine behaviour.
#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    /// Enqueue release notifications after a release commits.
    pub notify: bool,
    /// Template for users with digital access.
    pub digital_template: TemplateType,
    /// Template for users who only receive the printed copy.
    pub physical_template: TemplateType,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            notify: true,
            digital_template: TemplateType::EditionReleased,
            physical_template: TemplateType::EditionShipping,
        }
    }
}

impl ReleaseConfig {
    /// Enable or disable release notifications.
    #[must_use]
    pub const fn with_notifications(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }
}

/// Settlement worker behaviour.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Recipient of internal subscription notices.
    pub admin_email: Option<String>,
    /// In-process retry of the final ledger write.
    pub ledger_retry: RetryPolicy,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            admin_email: None,
            ledger_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(2))
                .build(),
        }
    }
}

impl SettlementConfig {
    /// Set the admin notification address.
    #[must_use]
    pub fn with_admin_email(mut self, email: impl Into<String>) -> Self {
        self.admin_email = Some(email.into());
        self
    }

    /// Set the ledger write retry policy.
    #[must_use]
    pub fn with_ledger_retry(mut self, policy: RetryPolicy) -> Self {
        self.ledger_retry = policy;
        self
    }
}
