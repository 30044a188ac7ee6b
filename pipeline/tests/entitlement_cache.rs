//! Entitlement cache: write-through after release and store fallback.

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use editions_core::access::{AccessView, PlanType};
use editions_core::edition::EditionStatus;
use editions_pipeline::{CacheConfig, EntitlementCache, UserAccessUpdate};
use editions_testing::fixtures;
use std::time::Duration;

fn cached(h: &Harness, user_id: editions_core::UserId) -> Vec<AccessView> {
    serde_json::from_str(&h.cache_store.raw(&EntitlementCache::key(user_id)).unwrap()).unwrap()
}

#[tokio::test]
async fn release_writes_fresh_lists_for_digital_users() {
    let h = Harness::new();
    let first = h.edition(1, EditionStatus::Active).await;
    let third = h.edition(3, EditionStatus::PreorderOpen).await;
    let reader = h.subscriber("reader", &third, PlanType::Digital).await;
    h.store
        .insert_access(fixtures::active_access(reader.user_id, &first, PlanType::Digital))
        .await;
    // A stale list from before the release.
    h.cache_store.put_raw(EntitlementCache::key(reader.user_id), "[]");

    h.engine().release_edition(3).await.unwrap();

    let numbers: Vec<i32> = cached(&h, reader.user_id)
        .iter()
        .map(|view| view.edition_number)
        .collect();
    assert_eq!(numbers, vec![1, 3]);
    assert_eq!(
        h.cache_store.ttl(&EntitlementCache::key(reader.user_id)),
        Some(Duration::from_secs(24 * 60 * 60))
    );

    // Served from the cache: the store is not consulted.
    h.store.fail_operation("active_access_for_user");
    let access = h.cache.get_user_access(reader.user_id).await.unwrap();
    assert_eq!(access.len(), 2);
}

#[tokio::test]
async fn physical_only_entries_are_left_alone() {
    let h = Harness::new();
    let third = h.edition(3, EditionStatus::PreorderOpen).await;
    let collector = h.subscriber("collector", &third, PlanType::Physical).await;
    let reader = h.subscriber("reader", &third, PlanType::Combined).await;
    let key = EntitlementCache::key(collector.user_id);
    h.cache_store.put_raw(key.clone(), "untouched");

    let outcome = h.engine().release_edition(3).await.unwrap();
    let editions_pipeline::ReleaseOutcome::Released(release) = outcome else {
        unreachable!("edition 3 was releasable");
    };

    assert_eq!(release.cache.skipped, 1);
    assert_eq!(release.cache.refreshed, 1);
    assert_eq!(h.cache_store.raw(&key).as_deref(), Some("untouched"));
    assert_eq!(cached(&h, reader.user_id).len(), 1);
}

#[tokio::test]
async fn miss_reads_the_store_and_writes_through() {
    let h = Harness::new();
    let edition = h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    h.store
        .insert_access(fixtures::active_access(user.user_id, &edition, PlanType::Digital))
        .await;

    let access = h.cache.get_user_access(user.user_id).await.unwrap();

    assert_eq!(access.len(), 1);
    assert_eq!(cached(&h, user.user_id), access);
}

#[tokio::test]
async fn corrupt_entry_falls_back_to_the_store() {
    let h = Harness::new();
    let edition = h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    h.store
        .insert_access(fixtures::active_access(user.user_id, &edition, PlanType::Digital))
        .await;
    h.cache_store
        .put_raw(EntitlementCache::key(user.user_id), "{not json");

    let access = h.cache.get_user_access(user.user_id).await.unwrap();

    assert_eq!(access.len(), 1);
    assert_eq!(cached(&h, user.user_id), access);
}

#[tokio::test]
async fn unreachable_cache_falls_back_to_the_store() {
    let h = Harness::new();
    let edition = h.edition(1, EditionStatus::Active).await;
    let user = h.user("reader").await;
    h.store
        .insert_access(fixtures::active_access(user.user_id, &edition, PlanType::Digital))
        .await;
    h.cache_store.fail_reads(true);
    h.cache_store.fail_writes(true);

    let access = h.cache.get_user_access(user.user_id).await.unwrap();

    assert_eq!(access.len(), 1);
    assert_eq!(access[0].edition_number, 1);
}

#[tokio::test]
async fn unreleased_editions_are_hidden() {
    let h = Harness::new();
    let released = h.edition(1, EditionStatus::Active).await;
    let mut early = fixtures::edition(2, EditionStatus::Active);
    early.ready_for_release = false;
    early.release_date = Some(fixtures::date(2026, 6, 1));
    h.store.insert_edition(early.clone()).await;
    let user = h.user("reader").await;
    h.store
        .insert_access(fixtures::active_access(user.user_id, &released, PlanType::Digital))
        .await;
    h.store
        .insert_access(fixtures::active_access(user.user_id, &early, PlanType::Digital))
        .await;

    let access = h.cache.get_user_access(user.user_id).await.unwrap();

    assert_eq!(access.len(), 1);
    assert_eq!(access[0].edition_number, 1);
}

#[tokio::test]
async fn refresh_counts_failures_without_aborting() {
    let h = Harness::new();
    let cache = EntitlementCache::new(
        h.cache_store.clone(),
        h.store.clone(),
        h.clock.clone(),
    )
    .with_config(CacheConfig::default().with_batch_size(2).with_concurrency(2));
    let edition = h.edition(1, EditionStatus::Active).await;

    let mut updates = Vec::new();
    for handle in ["a", "b", "c", "d", "e"] {
        let user = h.user(handle).await;
        let access = fixtures::active_access(user.user_id, &edition, PlanType::Digital);
        h.store.insert_access(access).await;
        let views = h.cache.get_user_access(user.user_id).await.unwrap();
        updates.push(UserAccessUpdate {
            user_id: user.user_id,
            access: views,
        });
    }
    h.cache_store.fail_key(EntitlementCache::key(updates[2].user_id));
    let writes_before = h.cache_store.write_count();

    let report = cache.refresh_users(updates).await;

    assert_eq!(report.refreshed, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(h.cache_store.write_count() - writes_before, 4);
}

#[tokio::test]
async fn invalidate_drops_the_entry() {
    let h = Harness::new();
    let user = h.user("reader").await;
    let key = EntitlementCache::key(user.user_id);
    h.cache_store.put_raw(key.clone(), "[]");

    h.cache.invalidate(user.user_id).await.unwrap();

    assert!(h.cache_store.raw(&key).is_none());
}
