//! Change Discoverer tests

use super::*;
use crate::git::fixtures::{git, Origin};
use crate::metrics;
use crate::sniff::RULES_VERSION;
use crate::store::ScanType;
use crate::testing::{Harness, AWS_LINE};
use serial_test::serial;
use std::time::Duration;

fn discoverer(h: &Harness, max_failures: u32) -> Arc<ChangeDiscoverer> {
    Arc::new(ChangeDiscoverer::new(
        h.store.clone(),
        h.git.clone(),
        Arc::new(h.scanner()),
        h.metrics.clone(),
        h.clock.clone(),
        FetchIntervalPolicy::new(Duration::from_secs(60), Duration::from_secs(3600)),
        max_failures,
    ))
}

async fn baseline(h: &Harness, origin: &Origin) -> Repository {
    let repo = h.cloned(origin, "acme", "widgets").await;
    let tips = h.git.branch_tips(&repo.path).await.unwrap();
    h.scanner()
        .scan_multiple(&repo, &tips, ScanType::Init)
        .await
        .unwrap();
    repo
}

#[tokio::test]
#[serial]
async fn test_push_to_main_records_fetch_and_scans_new_range() {
    let h = Harness::new();
    let origin = Origin::new();
    let old = origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;

    let new = origin.commit("config/prod.env", AWS_LINE, "add prod config");
    origin.push();

    let report = discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.changed_refs, 1);
    assert_eq!(report.credentials, 1);
    assert_eq!(report.failed_scans, 0);

    let fetches = h.store.fetches_for_repository(repo.id).unwrap();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].path, "refs/heads/main");
    assert_eq!(fetches[0].changes, [old.clone(), new.clone()]);

    let scans = h.store.scans_for_repository(repo.id).unwrap();
    let fetch_scan = scans
        .iter()
        .find(|s| s.scan_type == ScanType::Fetch)
        .unwrap();
    assert_eq!(fetch_scan.start_sha, new);
    assert_eq!(fetch_scan.stop_sha.as_deref(), Some(old.as_str()));
    assert_eq!(fetch_scan.fetch_id, Some(fetches[0].id));
    assert_eq!(fetch_scan.branch, "main");
    assert_eq!(scans.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_fetch_without_changes_only_updates_schedule() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;

    let report = discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.changed_refs, 0);
    assert_eq!(report.next_interval_secs, 600);
    assert!(h.store.fetches_for_repository(repo.id).unwrap().is_empty());
    let stored = h.store.repository(repo.id).unwrap().unwrap();
    assert_eq!(stored.last_fetched_at, Some(h.clock_now()));
    assert_eq!(stored.fetch_interval_secs, 600);
    assert!(h.store.repositories_due_for_fetch(h.clock_now()).unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_changes_shrink_the_interval() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;
    origin.commit("a.txt", "a\n", "more");
    origin.push();

    let report = discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.next_interval_secs, 150);
}

#[tokio::test]
#[serial]
async fn test_deleted_branch_is_recorded_without_scan() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.checkout_new("topic");
    let topic = origin.commit("topic.txt", "topic\n", "topic");
    origin.checkout("main");
    origin.push();
    let repo = baseline(&h, &origin).await;
    let scans_before = h.store.scans_for_repository(repo.id).unwrap().len();

    origin.delete_remote_branch("topic");
    let report = discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.changed_refs, 1);
    let fetches = h.store.fetches_for_repository(repo.id).unwrap();
    assert_eq!(fetches[0].path, "refs/heads/topic");
    assert_eq!(fetches[0].changes[0], topic);
    assert_eq!(fetches[0].changes[1], crate::git::ZERO_OID);
    assert_eq!(
        h.store.scans_for_repository(repo.id).unwrap().len(),
        scans_before
    );
}

#[tokio::test]
#[serial]
async fn test_new_branch_is_scanned_to_covered_history() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;

    origin.checkout_new("feature");
    let tip = origin.commit("feature.env", AWS_LINE, "feature");
    origin.push();

    let report = discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.credentials, 1);
    let scans = h.store.scans_for_repository(repo.id).unwrap();
    let feature = scans.iter().find(|s| s.branch == "feature").unwrap();
    assert_eq!(feature.start_sha, tip);
    assert_eq!(feature.stop_sha, None);
    assert_eq!(h.store.credentials_for_repository(repo.id).unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_catch_up_scans_history_missed_by_init() {
    let h = Harness::new();
    let origin = Origin::new();
    let tip = origin.commit("secrets.env", AWS_LINE, "leak");
    origin.push();
    let repo = h.cloned(&origin, "acme", "widgets").await;

    let report = discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.changed_refs, 0);
    assert_eq!(report.credentials, 1);
    let scans = h.store.scans_for_repository(repo.id).unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].start_sha, tip);
    let stored = h.store.repository(repo.id).unwrap().unwrap();
    assert_eq!(stored.rules_version, Some(RULES_VERSION));
}

#[tokio::test]
#[serial]
async fn test_repeated_fetch_failures_disable_repository() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;
    let missing = origin.scratch("gone.git");
    git(
        &repo.path,
        &["remote", "set-url", "origin", &missing.to_string_lossy()],
    );
    let changes = discoverer(&h, 2);

    let first = changes.fetch_repository(repo.id).await;
    assert!(matches!(first, Err(ChangeError::Fetch { .. })));
    let stored = h.store.repository(repo.id).unwrap().unwrap();
    assert_eq!(stored.failed_fetches, 1);
    assert!(!stored.disabled);
    assert_eq!(stored.fetch_interval_secs, 600);

    assert!(changes.fetch_repository(repo.id).await.is_err());
    let stored = h.store.repository(repo.id).unwrap().unwrap();
    assert!(stored.disabled);
    assert_eq!(h.metrics.counter_value(metrics::FETCH_FAILURES), 2);

    assert!(changes.fetch_repository(repo.id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_success_resets_failure_counter() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;
    h.store.register_failure(repo.id, 5).unwrap();

    discoverer(&h, 5).fetch_repository(repo.id).await.unwrap();

    let stored = h.store.repository(repo.id).unwrap().unwrap();
    assert_eq!(stored.failed_fetches, 0);
}

#[tokio::test]
#[serial]
async fn test_uncloned_repository_is_skipped() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = h.register(&origin, "acme", "widgets");

    assert!(discoverer(&h, 5)
        .fetch_repository(repo.id)
        .await
        .unwrap()
        .is_none());
    assert!(discoverer(&h, 5).fetch_repository(9999).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_requests_for_same_repository_are_coalesced() {
    let h = Harness::new();
    let origin = Origin::new();
    origin.commit("README.md", "# widgets\n", "initial");
    origin.push();
    let repo = baseline(&h, &origin).await;
    // Not due, so the ticker stays out of the way
    h.store
        .record_fetch_check(repo.id, h.clock_now(), 3600)
        .unwrap();
    h.clock.advance(Duration::from_secs(60));

    let shutdown = ShutdownCoordinator::new();
    let locks = Arc::new(RepoLocks::new());
    let (requests, task) = discoverer(&h, 5).spawn(
        2,
        16,
        Duration::from_secs(3600),
        locks.clone(),
        &shutdown,
    );

    let held = locks.lock(repo.id).await;
    assert_eq!(
        requests.request(repo.id, FetchReason::PushHint),
        RequestStatus::Queued
    );
    assert_eq!(
        requests.request(repo.id, FetchReason::Scheduled),
        RequestStatus::Coalesced
    );
    drop(held);

    tokio::time::timeout(Duration::from_secs(10), async {
        while requests.is_queued(repo.id)
            || h.store.repository(repo.id).unwrap().unwrap().last_fetched_at
                != Some(h.clock_now())
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    shutdown.trigger_shutdown();
    task.await.unwrap();
    assert_eq!(
        h.store.repository(repo.id).unwrap().unwrap().fetch_interval_secs,
        3600
    );
}
