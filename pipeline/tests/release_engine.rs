//! Release engine behaviour against the in-memory store.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{Harness, batch_of, emails};
use editions_core::access::{AccessStatus, PlanType};
use editions_core::edition::EditionStatus;
use editions_core::environment::Clock;
use editions_core::queue::QueueName;
use editions_core::notify::TemplateType;
use editions_pipeline::fanout::RELEASE_EMAILS_JOB;
use editions_pipeline::{EntitlementCache, ReleaseConfig, ReleaseError, ReleaseOutcome};
use editions_testing::fixtures;

#[tokio::test]
async fn second_release_is_a_noop() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    h.subscriber("alice", &edition, PlanType::Digital).await;
    h.subscriber("bob", &edition, PlanType::Digital).await;
    let engine = h.engine();

    let first = engine.release_edition(3).await.unwrap();
    let ReleaseOutcome::Released(release) = first else {
        panic!("expected a release, got {first:?}");
    };
    assert_eq!(release.unlocked_count, 2);
    assert_eq!(release.edition.status, EditionStatus::Active);
    assert_eq!(release.edition.released_at, Some(h.clock.now()));
    let jobs_after_first = h.email_jobs(RELEASE_EMAILS_JOB).len();

    let second = engine.release_edition(3).await.unwrap();
    assert_eq!(
        second,
        ReleaseOutcome::NoOp {
            edition_number: 3,
            current_status: EditionStatus::Active,
        }
    );
    assert_eq!(second.unlocked_count(), 0);
    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::Active);
    assert_eq!(h.email_jobs(RELEASE_EMAILS_JOB).len(), jobs_after_first);
}

#[tokio::test]
async fn release_unlocks_every_scheduled_grant_and_nothing_else() {
    let h = Harness::new();
    let third = h.edition(3, EditionStatus::PreorderOpen).await;
    let fourth = h.edition(4, EditionStatus::Pending).await;
    let mut users = Vec::new();
    for handle in ["a", "b", "c"] {
        users.push(h.subscriber(handle, &third, PlanType::Digital).await);
    }
    h.store
        .insert_access(fixtures::scheduled_access(users[0].user_id, &fourth, PlanType::Digital))
        .await;

    let outcome = h.engine().release_edition(3).await.unwrap();
    assert_eq!(outcome.unlocked_count(), 3);

    for user in &users {
        let grant = h.store.access_for(user.user_id, third.id).await.unwrap();
        assert_eq!(grant.status, AccessStatus::Active);
        assert_eq!(grant.unlocked_at, Some(h.clock.now()));
    }
    let untouched = h.store.access_for(users[0].user_id, fourth.id).await.unwrap();
    assert_eq!(untouched.status, AccessStatus::Scheduled);
    assert_eq!(untouched.unlocked_at, None);
}

#[tokio::test]
async fn two_digital_users_share_one_notification_batch() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    let a = h.subscriber("a", &edition, PlanType::Digital).await;
    let b = h.subscriber("b", &edition, PlanType::Combined).await;

    let ReleaseOutcome::Released(release) = h.engine().release_edition(3).await.unwrap() else {
        panic!("expected a release");
    };

    let mut affected: Vec<_> = release.affected_users.iter().map(|g| g.user_id).collect();
    affected.sort();
    let mut expected = vec![a.user_id, b.user_id];
    expected.sort();
    assert_eq!(affected, expected);

    let jobs = h.email_jobs(RELEASE_EMAILS_JOB);
    assert_eq!(jobs.len(), 1);
    let batch = batch_of(&jobs[0]);
    assert_eq!(batch.template, TemplateType::EditionReleased);
    assert_eq!(emails(&batch), vec!["a@example.com", "b@example.com"]);
    assert_eq!(batch.content.variables.get("edition_number").map(String::as_str), Some("3"));
    assert_eq!(release.notifications.batches_enqueued, 1);
    assert_eq!(release.notifications.recipients, 2);
}

#[tokio::test]
async fn physical_only_users_get_the_shipping_template() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    h.subscriber("reader", &edition, PlanType::Digital).await;
    h.subscriber("collector", &edition, PlanType::Physical).await;

    h.engine().release_edition(3).await.unwrap();

    let jobs = h.email_jobs(RELEASE_EMAILS_JOB);
    assert_eq!(jobs.len(), 2);
    let templates: Vec<(TemplateType, Vec<String>)> = jobs
        .iter()
        .map(|job| {
            let batch = batch_of(job);
            (batch.template, emails(&batch))
        })
        .collect();
    assert!(templates.contains(&(TemplateType::EditionReleased, vec!["reader@example.com".to_string()])));
    assert!(templates.contains(&(TemplateType::EditionShipping, vec!["collector@example.com".to_string()])));
}

#[tokio::test]
async fn closed_edition_is_a_noop() {
    let h = Harness::new();
    let edition = h.edition(2, EditionStatus::Closed).await;
    let user = h.subscriber("late", &edition, PlanType::Digital).await;

    let outcome = h.engine().release_edition(2).await.unwrap();

    assert_eq!(
        outcome,
        ReleaseOutcome::NoOp {
            edition_number: 2,
            current_status: EditionStatus::Closed,
        }
    );
    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Scheduled);
    assert!(h.queue.jobs(QueueName::Email).is_empty());
}

#[tokio::test]
async fn unknown_edition_is_an_error() {
    let h = Harness::new();

    let err = h.engine().release_edition(42).await.unwrap_err();

    assert!(matches!(err, ReleaseError::EditionNotFound(42)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn release_without_scheduled_access_still_activates() {
    let h = Harness::new();
    h.edition(5, EditionStatus::Pending).await;

    let ReleaseOutcome::Released(release) = h.engine().release_edition(5).await.unwrap() else {
        panic!("expected a release");
    };

    assert_eq!(release.unlocked_count, 0);
    assert!(release.affected_users.is_empty());
    assert_eq!(release.notifications.batches_enqueued, 0);
    assert_eq!(h.store.edition(5).await.unwrap().status, EditionStatus::Active);
    assert!(h.email_jobs(RELEASE_EMAILS_JOB).is_empty());
}

#[tokio::test]
async fn failure_inside_the_transaction_rolls_everything_back() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    let user = h.subscriber("alice", &edition, PlanType::Digital).await;
    h.store.fail_operation("active_access_for_users");

    let err = h.engine().release_edition(3).await.unwrap_err();

    assert!(matches!(err, ReleaseError::Store(_)));
    assert!(err.is_retryable());
    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::PreorderOpen);
    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Scheduled);
    assert!(h.email_jobs(RELEASE_EMAILS_JOB).is_empty());
    assert!(h.cache_store.raw(&EntitlementCache::key(user.user_id)).is_none());

    h.store.clear_faults();
    assert_eq!(h.engine().release_edition(3).await.unwrap().unlocked_count(), 1);
}

#[tokio::test]
async fn failed_commit_applies_nothing() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    h.subscriber("alice", &edition, PlanType::Digital).await;
    h.store.fail_operation("commit");

    assert!(h.engine().release_edition(3).await.is_err());

    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::PreorderOpen);
    assert!(h.email_jobs(RELEASE_EMAILS_JOB).is_empty());
}

#[tokio::test]
async fn post_commit_failures_do_not_fail_the_release() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    h.subscriber("alice", &edition, PlanType::Digital).await;
    h.subscriber("bob", &edition, PlanType::Digital).await;
    h.cache_store.fail_writes(true);
    h.queue.fail_enqueues_named(RELEASE_EMAILS_JOB);

    let ReleaseOutcome::Released(release) = h.engine().release_edition(3).await.unwrap() else {
        panic!("expected a release");
    };

    assert_eq!(release.unlocked_count, 2);
    assert_eq!(release.cache.failed, 2);
    assert_eq!(release.cache.refreshed, 0);
    assert_eq!(release.notifications.failed_batches, 1);
    assert_eq!(h.store.edition(3).await.unwrap().status, EditionStatus::Active);
}

#[tokio::test]
async fn notifications_can_be_switched_off() {
    let h = Harness::new();
    let edition = h.edition(3, EditionStatus::PreorderOpen).await;
    h.subscriber("alice", &edition, PlanType::Digital).await;
    let engine = h
        .engine()
        .with_config(ReleaseConfig::default().with_notifications(false));

    assert_eq!(engine.release_edition(3).await.unwrap().unlocked_count(), 1);
    assert!(h.email_jobs(RELEASE_EMAILS_JOB).is_empty());
}

#[tokio::test]
async fn release_next_picks_the_earliest_due_edition() {
    let h = Harness::new();
    h.edition(2, EditionStatus::Active).await;
    let third = h.edition(3, EditionStatus::PreorderOpen).await;
    let mut fourth = fixtures::edition(4, EditionStatus::Pending);
    fourth.release_date = Some(fixtures::date(2026, 4, 1));
    h.store.insert_edition(fourth).await;
    let mut unready = fixtures::edition(5, EditionStatus::Pending);
    unready.ready_for_release = false;
    h.store.insert_edition(unready).await;
    h.subscriber("alice", &third, PlanType::Digital).await;
    let engine = h.engine();

    let outcome = engine.release_next_pending_edition().await.unwrap().unwrap();
    let ReleaseOutcome::Released(release) = outcome else {
        panic!("expected a release");
    };
    assert_eq!(release.edition.number, 3);

    assert!(engine.release_next_pending_edition().await.unwrap().is_none());
    assert_eq!(h.store.edition(4).await.unwrap().status, EditionStatus::Pending);
    assert_eq!(h.store.edition(5).await.unwrap().status, EditionStatus::Pending);
}

#[tokio::test]
async fn expiry_sweep_expires_and_invalidates() {
    let h = Harness::new();
    let edition = h.edition(1, EditionStatus::Active).await;
    let user = h.user("lapsed").await;
    let mut grant = fixtures::active_access(user.user_id, &edition, PlanType::Digital);
    grant.expires_at = Some(h.clock.now() - chrono::Duration::days(1));
    h.store.insert_access(grant).await;
    let key = EntitlementCache::key(user.user_id);
    h.cache_store.put_raw(key.clone(), "[]");

    let expired = h.engine().expire_lapsed_access().await.unwrap();

    assert_eq!(expired, vec![user.user_id]);
    assert!(h.cache_store.raw(&key).is_none());
    let grant = h.store.access_for(user.user_id, edition.id).await.unwrap();
    assert_eq!(grant.status, AccessStatus::Expired);
    assert!(h.engine().expire_lapsed_access().await.unwrap().is_empty());
}
