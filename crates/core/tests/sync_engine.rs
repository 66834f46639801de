mod common;

use common::{cached_ids, child, raw, stores, sync, FailingAt};
use finder_core::pipeline::sync_with_retry;
use finder_core::rate_limit::RateLimiter;
use finder_core::retry::RetryConfig;
use finder_core::sync::{SyncEngine, SyncError, SyncStart};
use providers::memory::StaticIndex;
use providers::{parse_page, RawRecord};
use std::time::Duration;

fn quick_retry(max_attempts: usize) -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
        max_attempts,
    }
}

#[tokio::test]
async fn first_sync_caches_everything_and_a_rerun_changes_nothing() {
    let stores = stores().await;
    let remote = StaticIndex::new((1..=5).map(|id| raw(id, "a b")).collect()).with_max_page_size(2);

    let first = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(first.start_id, 1);
    assert_eq!(first.pages, 3);
    assert_eq!(first.inserted, 5);
    assert_eq!(first.remote_highest, Some(5));
    assert_eq!(first.last_seen, Some(5));
    assert_eq!(cached_ids(&stores).await, vec![1, 2, 3, 4, 5]);

    let full = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(full.fetched, 5);
    assert_eq!(full.mutations(), 0);

    let resumed = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(resumed.start_id, 6);
    assert_eq!(resumed.pages, 0);
    assert_eq!(resumed.mutations(), 0);
}

#[tokio::test]
async fn changed_records_are_updated() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(1, "a"), raw(2, "b")]);
    sync(&remote, &stores, SyncStart::Resume).await;

    remote.set(vec![raw(1, "a"), raw(2, "b c")]);
    let report = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(report.updated, 1);
    assert_eq!(report.inserted, 0);
    assert_eq!(stores.cache.get(2).await.unwrap().unwrap().tags, "b c");
}

#[tokio::test]
async fn a_skipped_id_that_is_cached_gets_deleted() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(5, "a"), raw(6, "b"), raw(7, "c")]);
    sync(&remote, &stores, SyncStart::Resume).await;

    remote.remove(6);
    let report = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(report.gap_deleted, 1);
    assert_eq!(cached_ids(&stores).await, vec![5, 7]);
}

#[tokio::test]
async fn a_skipped_id_that_was_never_cached_deletes_nothing() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(5, "a"), raw(7, "c")]);
    let report = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(report.gap_deleted, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(cached_ids(&stores).await, vec![5, 7]);
}

#[tokio::test]
async fn gaps_are_tracked_across_page_boundaries() {
    let stores = stores().await;
    let remote = StaticIndex::new((1..=6).map(|id| raw(id, "x")).collect()).with_max_page_size(2);
    sync(&remote, &stores, SyncStart::Resume).await;

    // pages become [1, 2] [4, 5] [6]; 3 sits on the seam
    remote.remove(3);
    let report = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(report.gap_deleted, 1);
    assert_eq!(cached_ids(&stores).await, vec![1, 2, 4, 5, 6]);
}

#[tokio::test]
async fn orphans_resolve_once_their_parent_is_cached() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(1, "root"), child(2, "leaf", 5), child(5, "mid", 1)]);

    let report = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(report.inserted, 3);
    assert_eq!(report.orphans_resolved, 1);
    assert_eq!(report.orphans_forced, 0);
    assert_eq!(stores.cache.get(2).await.unwrap().unwrap().parent_id, Some(5));
    assert_eq!(stores.cache.get(5).await.unwrap().unwrap().parent_id, Some(1));
}

#[tokio::test]
async fn chained_orphans_take_several_passes() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![
        child(1, "a", 2),
        child(2, "b", 3),
        child(3, "c", 4),
        raw(4, "d"),
    ]);
    let report = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(report.orphans_resolved, 3);
    assert_eq!(report.orphans_forced, 0);
    assert!(report.orphan_passes >= 2);
    assert_eq!(stores.cache.get(1).await.unwrap().unwrap().parent_id, Some(2));
}

#[tokio::test]
async fn an_orphan_whose_parent_never_arrives_is_stored_without_one() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(1, "a"), child(3, "b", 99)]);

    let report = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(report.orphans_forced, 1);
    assert_eq!(stores.cache.get(3).await.unwrap().unwrap().parent_id, None);

    let again = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn removed_and_malformed_records_are_deleted_not_stored() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(1, "a"), raw(2, "b"), raw(3, "c"), raw(4, "d")]);
    sync(&remote, &stores, SyncStart::Resume).await;

    let deleted = RawRecord {
        status: Some("deleted".into()),
        ..raw(2, "b")
    };
    let flagged = RawRecord {
        status: Some("flagged".into()),
        ..raw(3, "c")
    };
    let malformed = RawRecord {
        md5: None,
        ..raw(4, "d")
    };
    let never_cached = RawRecord {
        status: Some("deleted".into()),
        ..raw(5, "e")
    };
    remote.set(vec![raw(1, "a"), deleted, flagged, malformed, never_cached]);

    let report = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(report.deleted, 3);
    assert_eq!(report.inserted, 0);
    assert_eq!(cached_ids(&stores).await, vec![1]);
}

#[tokio::test]
async fn deleting_a_parent_clears_the_link_on_its_children() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(1, "a"), child(2, "b", 1)]);
    sync(&remote, &stores, SyncStart::Resume).await;

    remote.remove(1);
    let report = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(report.gap_deleted, 1);
    assert_eq!(report.orphans_forced, 1);
    assert_eq!(cached_ids(&stores).await, vec![2]);
    assert_eq!(stores.cache.get(2).await.unwrap().unwrap().parent_id, None);
}

#[tokio::test]
async fn a_failed_fetch_keeps_committed_pages_and_a_resume_finishes() {
    let stores = stores().await;
    let inner = StaticIndex::new((1..=6).map(|id| raw(id, "x")).collect()).with_max_page_size(2);
    let remote = FailingAt::new(inner, 2, true);
    let limiter = RateLimiter::unlimited();
    let engine = SyncEngine::new(&remote, &stores.cache, &limiter, 100);

    let err = engine.run(SyncStart::Resume).await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch { from_id: 3, .. }));
    assert!(err.is_transient());
    assert_eq!(cached_ids(&stores).await, vec![1, 2]);

    let report = engine.run(SyncStart::Resume).await.unwrap();
    assert_eq!(report.start_id, 3);
    assert_eq!(report.inserted, 4);
    assert_eq!(cached_ids(&stores).await, vec![1, 2, 3, 4, 5, 6]);
}

fn parent_after_its_child() -> StaticIndex {
    StaticIndex::new(vec![raw(1, "a"), child(2, "b", 3), raw(3, "c"), raw(4, "d")])
        .with_max_page_size(2)
}

#[tokio::test]
async fn an_aborted_run_then_a_resume_matches_a_clean_sync() {
    let clean = stores().await;
    sync(&parent_after_its_child(), &clean, SyncStart::Resume).await;
    assert_eq!(clean.cache.get(2).await.unwrap().unwrap().parent_id, Some(3));

    let stores = stores().await;
    let remote = FailingAt::new(parent_after_its_child(), 2, true);
    let limiter = RateLimiter::unlimited();
    let engine = SyncEngine::new(&remote, &stores.cache, &limiter, 100);

    let err = engine.run(SyncStart::Resume).await.unwrap_err();
    assert!(err.is_transient());
    // 2 waits for 3, which sits on the page that failed
    assert_eq!(cached_ids(&stores).await, vec![1, 2]);
    let unlinked = stores.cache.get(2).await.unwrap().unwrap();
    assert_eq!(unlinked.parent_id, None);
    assert_eq!(unlinked.declared_parent_id, Some(3));

    let resumed = engine.run(SyncStart::Resume).await.unwrap();
    assert_eq!(resumed.start_id, 3);
    assert_eq!(resumed.inserted, 2);
    assert_eq!(resumed.orphans_relinked, 1);
    assert_eq!(stores.cache.get(2).await.unwrap().unwrap().parent_id, Some(3));
    assert_eq!(stores.cache.all().await.unwrap(), clean.cache.all().await.unwrap());

    let again = engine.run(SyncStart::FromId(1)).await.unwrap();
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn a_retried_sync_keeps_parent_links() {
    let clean = stores().await;
    sync(&parent_after_its_child(), &clean, SyncStart::Resume).await;

    let stores = stores().await;
    let remote = FailingAt::new(parent_after_its_child(), 2, true);
    let limiter = RateLimiter::unlimited();
    sync_with_retry(
        &remote,
        &stores.cache,
        &limiter,
        100,
        SyncStart::Resume,
        &quick_retry(3),
    )
    .await
    .unwrap();
    assert_eq!(stores.cache.all().await.unwrap(), clean.cache.all().await.unwrap());
}

#[tokio::test]
async fn a_late_parent_relinks_a_stored_orphan() {
    let stores = stores().await;
    let remote = StaticIndex::new(vec![raw(1, "a"), child(3, "b", 9)]);
    sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(stores.cache.get(3).await.unwrap().unwrap().parent_id, None);

    remote.set(vec![raw(1, "a"), child(3, "b", 9), raw(9, "late")]);
    let report = sync(&remote, &stores, SyncStart::Resume).await;
    assert_eq!(report.start_id, 4);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.orphans_relinked, 1);
    assert_eq!(stores.cache.get(3).await.unwrap().unwrap().parent_id, Some(9));

    let again = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn a_mistyped_record_is_deleted_and_the_rest_of_its_page_syncs() {
    let stores = stores().await;
    let remote = StaticIndex::new((1..=3).map(|id| raw(id, "x")).collect());
    sync(&remote, &stores, SyncStart::Resume).await;

    let mut page: Vec<serde_json::Value> = [raw(1, "x"), raw(3, "y"), raw(4, "z")]
        .iter()
        .map(|r| serde_json::to_value(r).unwrap())
        .collect();
    page.insert(1, serde_json::json!({"id": 2, "score": "oops"}));
    let body = serde_json::to_vec(&page).unwrap();
    remote.set(parse_page(&body).unwrap());

    let report = sync(&remote, &stores, SyncStart::FromId(1)).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(cached_ids(&stores).await, vec![1, 3, 4]);
    assert_eq!(stores.cache.get(3).await.unwrap().unwrap().tags, "y");
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let stores = stores().await;
    let remote = StaticIndex::new((1..=3).map(|id| raw(id, "x")).collect());
    // the first failure lands on the highest-id lookup, the second on page one
    remote.fail_next(2);
    let limiter = RateLimiter::unlimited();

    let report = sync_with_retry(
        &remote,
        &stores.cache,
        &limiter,
        100,
        SyncStart::Resume,
        &quick_retry(3),
    )
    .await
    .unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(cached_ids(&stores).await, vec![1, 2, 3]);
}

#[tokio::test]
async fn fatal_failures_are_not_retried() {
    let stores = stores().await;
    let inner = StaticIndex::new((1..=3).map(|id| raw(id, "x")).collect());
    let remote = FailingAt::new(inner, 1, false);
    let limiter = RateLimiter::unlimited();

    let err = sync_with_retry(
        &remote,
        &stores.cache,
        &limiter,
        100,
        SyncStart::Resume,
        &quick_retry(5),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SyncError::Fetch { .. }));
    assert_eq!(remote.page_calls(), 1);
}

#[tokio::test]
async fn page_size_respects_the_remote_cap() {
    let stores = stores().await;
    let remote = StaticIndex::new(Vec::new()).with_max_page_size(50);
    let limiter = RateLimiter::unlimited();
    let engine = SyncEngine::new(&remote, &stores.cache, &limiter, 200);
    assert_eq!(engine.page_size(), 50);
}
