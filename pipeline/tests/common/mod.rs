//! Shared wiring for the pipeline behaviour tests.

#![allow(dead_code, clippy::unwrap_used)]

use editions_core::access::PlanType;
use editions_core::cache::CacheStore;
use editions_core::commerce::UserContact;
use editions_core::edition::{Edition, EditionStatus};
use editions_core::environment::Clock;
use editions_core::ledger::EventLedger;
use editions_core::queue::{Job, JobQueue, QueueName};
use editions_core::store::EntitlementStore;
use editions_pipeline::{
    EntitlementCache, FanoutConfig, MessageBatch, MessageDispatcher, NotificationFanout,
    ReleaseEngine, SettlementConfig, SettlementWorker,
};
use editions_runtime::RetryPolicy;
use editions_testing::{
    FixedClock, InMemoryCacheStore, InMemoryEntitlementStore, InMemoryEventLedger,
    InMemoryJobQueue, RecordingMailer, fixtures, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

pub const ADMIN_EMAIL: &str = "ops@example.com";

/// Every collaborator of the pipeline, in memory.
pub struct Harness {
    pub clock: Arc<FixedClock>,
    pub store: Arc<InMemoryEntitlementStore>,
    pub ledger: Arc<InMemoryEventLedger>,
    pub queue: Arc<InMemoryJobQueue>,
    pub cache_store: Arc<InMemoryCacheStore>,
    pub cache: Arc<EntitlementCache>,
    pub fanout: Arc<NotificationFanout>,
    pub mailer: Arc<RecordingMailer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fanout(FanoutConfig::default())
    }

    pub fn with_fanout(config: FanoutConfig) -> Self {
        let clock = Arc::new(test_clock());
        let store = Arc::new(InMemoryEntitlementStore::new());
        let ledger = Arc::new(InMemoryEventLedger::new(clock.clone() as Arc<dyn Clock>));
        let queue = Arc::new(InMemoryJobQueue::new(clock.clone() as Arc<dyn Clock>));
        let cache_store = Arc::new(InMemoryCacheStore::new());
        let cache = Arc::new(EntitlementCache::new(
            cache_store.clone() as Arc<dyn CacheStore>,
            store.clone() as Arc<dyn EntitlementStore>,
            clock.clone() as Arc<dyn Clock>,
        ));
        let fanout = Arc::new(
            NotificationFanout::new(queue.clone() as Arc<dyn JobQueue>).with_config(config),
        );
        Self {
            clock,
            store,
            ledger,
            queue,
            cache_store,
            cache,
            fanout,
            mailer: Arc::new(RecordingMailer::new()),
        }
    }

    pub fn engine(&self) -> ReleaseEngine {
        ReleaseEngine::new(
            self.store.clone(),
            self.cache.clone(),
            self.fanout.clone(),
            self.clock.clone(),
        )
    }

    pub fn settlement(&self) -> SettlementWorker {
        SettlementWorker::new(
            self.ledger.clone() as Arc<dyn EventLedger>,
            self.store.clone(),
            self.cache.clone(),
            self.fanout.clone(),
            self.clock.clone(),
        )
        .with_config(
            SettlementConfig::default()
                .with_admin_email(ADMIN_EMAIL)
                .with_ledger_retry(fast_retry()),
        )
    }

    pub fn dispatcher(&self) -> MessageDispatcher {
        MessageDispatcher::new(self.mailer.clone(), self.fanout.clone())
    }

    /// Insert edition `number` in `status`.
    pub async fn edition(&self, number: i32, status: EditionStatus) -> Edition {
        let edition = fixtures::edition(number, status);
        self.store.insert_edition(edition.clone()).await;
        edition
    }

    /// Insert a user.
    pub async fn user(&self, handle: &str) -> UserContact {
        let user = fixtures::user(handle);
        self.store.insert_user(user.clone()).await;
        user
    }

    /// Insert a user holding a SCHEDULED grant of `edition`.
    pub async fn subscriber(&self, handle: &str, edition: &Edition, plan: PlanType) -> UserContact {
        let user = self.user(handle).await;
        self.store
            .insert_access(fixtures::scheduled_access(user.user_id, edition, plan))
            .await;
        user
    }

    /// Email-queue jobs named `name`.
    pub fn email_jobs(&self, name: &str) -> Vec<Job> {
        self.queue.jobs_named(QueueName::Email, name)
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

pub fn batch_of(job: &Job) -> MessageBatch {
    job.payload_as().unwrap()
}

pub fn emails(batch: &MessageBatch) -> Vec<String> {
    let mut emails: Vec<String> = batch.recipients.iter().map(|r| r.email.clone()).collect();
    emails.sort();
    emails
}
