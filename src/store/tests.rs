//! Repository Store Tests

use super::*;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::path::PathBuf;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn new_repo(owner: &str, name: &str) -> NewRepository {
    NewRepository {
        owner: owner.to_string(),
        name: name.to_string(),
        path: PathBuf::from(format!("/work/{}/{}", owner, name)),
        ssh_url: format!("git@github.com:{}/{}.git", owner, name),
        private: false,
        default_branch: "main".to_string(),
        fetch_interval_secs: 300,
    }
}

fn cloned_repo(store: &SqliteStore, owner: &str, name: &str) -> Repository {
    let (repo, _) = store.insert_repository(&new_repo(owner, name), t0()).unwrap();
    store.mark_cloned(repo.id).unwrap();
    store.repository(repo.id).unwrap().unwrap()
}

fn new_scan(repo: &Repository, start: &str, stop: Option<&str>, scan_type: ScanType) -> NewScan {
    NewScan {
        repository_id: repo.id,
        fetch_id: None,
        branch: "main".to_string(),
        scan_type,
        start_sha: start.to_string(),
        stop_sha: stop.map(str::to_string),
        rules_version: 1,
        scan_start: t0(),
        scan_end: t0() + ChronoDuration::seconds(3),
    }
}

fn credential(repo: &Repository, sha: &str, line: u32) -> NewCredential {
    NewCredential {
        owner: repo.owner.clone(),
        repository: repo.name.clone(),
        sha: sha.to_string(),
        path: "config/settings.py".to_string(),
        line_number: line,
        match_start: 4,
        match_end: 24,
        private: repo.private,
        method: ScanMethod::Diff,
        rules_version: 1,
    }
}

#[test]
fn test_insert_repository_is_idempotent() {
    let store = SqliteStore::in_memory().unwrap();

    let (first, created) = store.insert_repository(&new_repo("acme", "widgets"), t0()).unwrap();
    assert!(created);
    assert!(!first.cloned);
    assert!(!first.disabled);
    assert_eq!(first.failed_fetches, 0);
    assert_eq!(first.full_name(), "acme/widgets");

    let (second, created) = store.insert_repository(&new_repo("acme", "widgets"), t0()).unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(store.repositories().unwrap().len(), 1);
}

#[test]
fn test_find_repository_by_owner_and_name() {
    let store = SqliteStore::in_memory().unwrap();
    store.insert_repository(&new_repo("acme", "widgets"), t0()).unwrap();
    store.insert_repository(&new_repo("acme", "gadgets"), t0()).unwrap();

    let found = store.find_repository("acme", "gadgets").unwrap().unwrap();
    assert_eq!(found.name, "gadgets");
    assert!(store.find_repository("other", "gadgets").unwrap().is_none());
}

#[test]
fn test_mark_cloned_and_uncloned() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");
    assert!(repo.cloned);
    assert_eq!(store.cloned_repositories().unwrap().len(), 1);

    store.mark_uncloned(repo.id).unwrap();
    assert!(!store.repository(repo.id).unwrap().unwrap().cloned);
    assert!(store.cloned_repositories().unwrap().is_empty());
}

#[test]
fn test_updates_on_unknown_repository_fail() {
    let store = SqliteStore::in_memory().unwrap();
    assert!(matches!(
        store.mark_cloned(42),
        Err(StoreError::RepositoryNotFound { id: 42 })
    ));
}

#[test]
fn test_register_failure_disables_at_threshold() {
    let store = SqliteStore::in_memory().unwrap();
    let (repo, _) = store.insert_repository(&new_repo("acme", "broken"), t0()).unwrap();

    let first = store.register_failure(repo.id, 3).unwrap();
    assert_eq!(first, FailureOutcome { failures: 1, disabled: false });
    store.register_failure(repo.id, 3).unwrap();
    let third = store.register_failure(repo.id, 3).unwrap();
    assert_eq!(third, FailureOutcome { failures: 3, disabled: true });

    let stored = store.repository(repo.id).unwrap().unwrap();
    assert!(stored.disabled);

    // Further failures do not report a fresh transition
    let fourth = store.register_failure(repo.id, 3).unwrap();
    assert!(!fourth.disabled);
}

#[test]
fn test_reset_failures_clears_counter() {
    let store = SqliteStore::in_memory().unwrap();
    let (repo, _) = store.insert_repository(&new_repo("acme", "flaky"), t0()).unwrap();
    store.register_failure(repo.id, 5).unwrap();
    store.register_failure(repo.id, 5).unwrap();

    store.reset_failures(repo.id).unwrap();

    assert_eq!(store.repository(repo.id).unwrap().unwrap().failed_fetches, 0);
}

#[test]
fn test_repositories_due_for_fetch() {
    let store = SqliteStore::in_memory().unwrap();
    let never = cloned_repo(&store, "acme", "never-fetched");
    let recent = cloned_repo(&store, "acme", "recent");
    let stale = cloned_repo(&store, "acme", "stale");
    store.insert_repository(&new_repo("acme", "not-cloned"), t0()).unwrap();
    let disabled = cloned_repo(&store, "acme", "disabled");
    store.register_failure(disabled.id, 1).unwrap();

    let now = t0() + ChronoDuration::hours(1);
    store.record_fetch_check(recent.id, now - ChronoDuration::seconds(60), 300).unwrap();
    store.record_fetch_check(stale.id, now - ChronoDuration::seconds(600), 300).unwrap();

    let due: Vec<String> = store
        .repositories_due_for_fetch(now)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();

    assert_eq!(due, vec![never.name, stale.name]);
}

#[test]
fn test_record_fetch_check_updates_interval() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");

    store.record_fetch_check(repo.id, t0(), 1200).unwrap();

    let stored = store.repository(repo.id).unwrap().unwrap();
    assert_eq!(stored.fetch_interval_secs, 1200);
    assert_eq!(stored.last_fetched_at, Some(t0()));
}

#[test]
fn test_save_fetch_round_trips_changes() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");

    let fetch = store
        .save_fetch(repo.id, "refs/heads/main", ["aaa111", "bbb222"], t0())
        .unwrap();

    let stored = store.fetches_for_repository(repo.id).unwrap();
    assert_eq!(stored, vec![fetch]);
    assert_eq!(stored[0].changes, ["aaa111".to_string(), "bbb222".to_string()]);
}

#[test]
fn test_save_scan_persists_scan_credentials_and_commits() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");

    let scan = store
        .save_scan(
            &new_scan(&repo, "bbb222", Some("aaa111"), ScanType::Fetch),
            &[credential(&repo, "bbb222", 3), credential(&repo, "bbb222", 9)],
            &["bbb222".to_string()],
        )
        .unwrap();

    assert_eq!(store.scans_for_repository(repo.id).unwrap(), vec![scan.clone()]);
    let credentials = store.credentials_for_repository(repo.id).unwrap();
    assert_eq!(credentials.len(), 2);
    assert!(credentials.iter().all(|c| c.scan_id == scan.id));
    assert!(store.range_scanned(repo.id, "bbb222", Some("aaa111")).unwrap());
    assert!(!store.range_scanned(repo.id, "bbb222", None).unwrap());

    let covered = store
        .covered_commits(repo.id, &["bbb222".to_string(), "aaa111".to_string()])
        .unwrap();
    assert!(covered.contains("bbb222"));
    assert!(!covered.contains("aaa111"));
}

#[test]
fn test_save_scan_is_all_or_nothing() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");

    let mut invalid = credential(&repo, "bbb222", 5);
    invalid.match_end = 1;

    let result = store.save_scan(
        &new_scan(&repo, "bbb222", None, ScanType::Init),
        &[credential(&repo, "bbb222", 3), invalid],
        &["bbb222".to_string()],
    );

    assert!(result.is_err());
    assert!(store.scans_for_repository(repo.id).unwrap().is_empty());
    assert!(store.credentials_for_repository(repo.id).unwrap().is_empty());
    assert!(store
        .covered_commits(repo.id, &["bbb222".to_string()])
        .unwrap()
        .is_empty());
}

#[test]
fn test_empty_scan_still_recorded() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");

    store
        .save_scan(&new_scan(&repo, "ccc333", Some("ccc333"), ScanType::Fetch), &[], &[])
        .unwrap();

    assert!(store.range_scanned(repo.id, "ccc333", Some("ccc333")).unwrap());
    assert_eq!(store.counts().unwrap().scans, 1);
}

#[test]
fn test_tree_scan_exists_is_keyed_by_rules_version() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");
    let mut scan = new_scan(&repo, "ddd444", None, ScanType::Rescan);
    scan.rules_version = 2;
    store.save_scan(&scan, &[], &[]).unwrap();

    assert!(store.tree_scan_exists(repo.id, "main", "ddd444", 2).unwrap());
    assert!(!store.tree_scan_exists(repo.id, "main", "ddd444", 3).unwrap());
    assert!(!store.tree_scan_exists(repo.id, "dev", "ddd444", 2).unwrap());
    // A tree scan is not a history receipt
    assert!(!store.range_scanned(repo.id, "ddd444", None).unwrap());
}

#[test]
fn test_repositories_behind_rules_is_per_repository() {
    let store = SqliteStore::in_memory().unwrap();
    let alpha = cloned_repo(&store, "acme", "alpha");
    let beta = cloned_repo(&store, "acme", "beta");
    let never = cloned_repo(&store, "acme", "never");
    assert_eq!(never.rules_version, None);
    store.set_rules_version(alpha.id, 1).unwrap();
    store.set_rules_version(beta.id, 1).unwrap();

    // A newer scan elsewhere does not move beta's coverage
    let mut scan = new_scan(&alpha, "eee555", None, ScanType::Fetch);
    scan.rules_version = 2;
    store.save_scan(&scan, &[], &[]).unwrap();
    store.set_rules_version(alpha.id, 2).unwrap();

    let behind: Vec<String> = store
        .repositories_behind_rules(2)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(behind, ["beta"]);
    assert!(store.repositories_behind_rules(1).unwrap().is_empty());
    assert!(matches!(
        store.set_rules_version(999, 2),
        Err(StoreError::RepositoryNotFound { id: 999 })
    ));
}

#[test]
fn test_branch_upsert_and_prune() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");

    store.upsert_branch(repo.id, "main", 2).unwrap();
    store.upsert_branch(repo.id, "feature", 1).unwrap();
    store.upsert_branch(repo.id, "main", 5).unwrap();

    let branches = store.branches(repo.id).unwrap();
    assert_eq!(branches.len(), 2);
    assert_eq!(branches[1].name, "main");
    assert_eq!(branches[1].credential_count, 5);

    let removed = store.prune_branches(repo.id, &["main".to_string()]).unwrap();
    assert_eq!(removed, 1);
    let names: Vec<_> = store.branches(repo.id).unwrap().into_iter().map(|b| b.name).collect();
    assert_eq!(names, vec!["main".to_string()]);
}

#[test]
fn test_counts() {
    let store = SqliteStore::in_memory().unwrap();
    let repo = cloned_repo(&store, "acme", "widgets");
    let (broken, _) = store.insert_repository(&new_repo("acme", "broken"), t0()).unwrap();
    store.register_failure(broken.id, 1).unwrap();
    store.save_fetch(repo.id, "refs/heads/main", ["a", "b"], t0()).unwrap();
    store
        .save_scan(
            &new_scan(&repo, "b", Some("a"), ScanType::Fetch),
            &[credential(&repo, "b", 1)],
            &["b".to_string()],
        )
        .unwrap();
    store.upsert_branch(repo.id, "main", 4).unwrap();

    let counts = store.counts().unwrap();
    assert_eq!(counts.repositories, 2);
    assert_eq!(counts.cloned, 1);
    assert_eq!(counts.disabled, 1);
    assert_eq!(counts.fetches, 1);
    assert_eq!(counts.scans, 1);
    assert_eq!(counts.credentials, 1);
    assert_eq!(counts.head_credentials, 4);
}

#[test]
fn test_message_retry_counter() {
    let store = SqliteStore::in_memory().unwrap();

    assert_eq!(store.bump_message_retry("msg-1").unwrap(), 1);
    assert_eq!(store.bump_message_retry("msg-1").unwrap(), 2);
    assert_eq!(store.bump_message_retry("msg-2").unwrap(), 1);

    store.clear_message_retry("msg-1").unwrap();
    assert_eq!(store.bump_message_retry("msg-1").unwrap(), 1);
}

#[test]
fn test_open_file_database_and_migrate() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("repowatch.db");
    let clock = crate::core::time::SystemTimeProvider;
    let policy = crate::core::retry::RetryPolicy::default();

    let store = SqliteStore::open(&path, 2).unwrap();
    assert!(store.migrate(&policy, &clock).unwrap() > 0);
    store.insert_repository(&new_repo("acme", "widgets"), t0()).unwrap();
    drop(store);

    let reopened = SqliteStore::open(&path, 2).unwrap();
    assert_eq!(reopened.migrate(&policy, &clock).unwrap(), 0);
    assert_eq!(
        reopened.schema_version().unwrap() as usize,
        super::schema::MIGRATIONS.len()
    );
    assert!(reopened.find_repository("acme", "widgets").unwrap().is_some());
}
