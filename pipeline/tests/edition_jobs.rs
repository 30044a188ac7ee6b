//! Editions-queue jobs driven through the queue worker.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use editions_core::access::{AccessStatus, PlanType};
use editions_core::edition::EditionStatus;
use editions_core::environment::Clock;
use editions_core::queue::{JobOptions, JobQueue, JobStatus, QueueName};
use editions_pipeline::edition_jobs::{self, EXPIRE_SWEEP_JOB, RELEASE_JOB, RELEASE_NEXT_JOB};
use editions_pipeline::EditionJobHandler;
use editions_runtime::{JobOutcome, QueueWorker, WorkerConfig};
use editions_testing::fixtures;
use std::sync::Arc;
use std::time::Duration;

fn editions_worker(h: &Harness) -> QueueWorker {
    QueueWorker::new(
        QueueName::Editions,
        h.queue.clone(),
        Arc::new(EditionJobHandler::new(Arc::new(h.engine()))),
        h.clock.clone(),
    )
    .with_config(WorkerConfig::default().with_max_jitter(Duration::ZERO))
}

#[tokio::test]
async fn release_job_releases_the_edition() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    let user = h.subscriber("alice", &edition, PlanType::Digital).await;

    let first = edition_jobs::schedule_release(h.queue.as_ref(), 3).await.unwrap();
    let again = edition_jobs::schedule_release(h.queue.as_ref(), 3).await.unwrap();
    assert!(again.deduplicated);
    assert_eq!(again.id, first.id);

    assert_eq!(editions_worker(&h).drain().await.unwrap(), vec![JobOutcome::Completed]);

    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::Active);
    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Active);
}

#[tokio::test]
async fn release_job_for_a_missing_edition_is_buried() {
    let h = Harness::new();
    edition_jobs::schedule_release(h.queue.as_ref(), 99).await.unwrap();

    let outcomes = editions_worker(&h).drain().await.unwrap();

    assert!(matches!(outcomes.as_slice(), [JobOutcome::Buried { .. }]));
    let failed = h.queue.list_failed(QueueName::Editions, 10).await.unwrap();
    assert_eq!(failed[0].name, RELEASE_JOB);
}

#[tokio::test]
async fn release_check_collapses_while_pending() {
    let h = Harness::new();
    h.edition(3, EditionStatus::PreorderOpen).await;
    let today = h.clock.today();

    edition_jobs::schedule_release_next(h.queue.as_ref(), today).await.unwrap();
    let repeat = edition_jobs::schedule_release_next(h.queue.as_ref(), today).await.unwrap();
    assert!(repeat.deduplicated);
    assert_eq!(h.queue.jobs_named(QueueName::Editions, RELEASE_NEXT_JOB).len(), 1);

    assert_eq!(editions_worker(&h).drain().await.unwrap(), vec![JobOutcome::Completed]);
    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::Active);

    // The finished check no longer holds the key, so a same-day tick enqueues
    // a fresh one, which finds nothing due.
    let later = edition_jobs::schedule_release_next(h.queue.as_ref(), today).await.unwrap();
    assert!(!later.deduplicated);
    assert_eq!(editions_worker(&h).drain().await.unwrap(), vec![JobOutcome::Completed]);
}

#[tokio::test]
async fn expiry_sweep_job_expires_grants() {
    let h = Harness::new();
    let edition = h.edition(1, EditionStatus::Active).await;
    let user = h.user("lapsed").await;
    let mut grant = fixtures::active_access(user.user_id, &edition, PlanType::Digital);
    grant.expires_at = Some(h.clock.now() - chrono::Duration::hours(1));
    h.store.insert_access(grant).await;

    edition_jobs::schedule_expiry_sweep(h.queue.as_ref()).await.unwrap();
    let pending = edition_jobs::schedule_expiry_sweep(h.queue.as_ref()).await.unwrap();
    assert!(pending.deduplicated);
    editions_worker(&h).drain().await.unwrap();

    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Expired);
    assert!(h.queue.jobs_named(QueueName::Editions, EXPIRE_SWEEP_JOB).is_empty());
}

#[tokio::test]
async fn unknown_job_is_fatal() {
    let h = Harness::new();
    let handle = h
        .queue
        .enqueue(
            QueueName::Editions,
            "edition.archive",
            serde_json::Value::Null,
            JobOptions::default(),
        )
        .await
        .unwrap();

    let outcomes = editions_worker(&h).drain().await.unwrap();

    assert!(matches!(outcomes.as_slice(), [JobOutcome::Buried { .. }]));
    assert_eq!(h.queue.job(handle.id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn store_outage_is_retried_by_the_queue() {
    let h = Harness::new();
    h.edition(3, EditionStatus::PreorderOpen).await;
    h.store.fail_operation("begin");
    edition_jobs::schedule_release(h.queue.as_ref(), 3).await.unwrap();
    let worker = editions_worker(&h);

    let outcomes = worker.drain().await.unwrap();
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Retried { .. }]));

    h.store.clear_faults();
    h.queue.make_due();
    assert_eq!(worker.drain().await.unwrap(), vec![JobOutcome::Completed]);
    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::Active);
}
