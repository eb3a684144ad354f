//! Repository Store
//!
//! Durable records for repositories, branches, fetches, scans and
//! credentials. The store holds no policy: callers decide when to scan,
//! fetch or disable; the store answers "has this already been done" and
//! commits each scan together with its findings.
//!
//! Every read goes to the database. Components never cache records beyond
//! one operation.

pub mod error;
mod schema;
pub mod sqlite;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use types::*;

use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Data access used by every component.
///
/// Calls are synchronous and short; async callers invoke them from worker
/// tasks directly.
pub trait RepositoryStore: Send + Sync {
    /// Insert a repository first seen by discovery. Returns the stored row
    /// and whether it was created by this call.
    fn insert_repository(
        &self,
        repo: &NewRepository,
        now: DateTime<Utc>,
    ) -> StoreResult<(Repository, bool)>;

    fn find_repository(&self, owner: &str, name: &str) -> StoreResult<Option<Repository>>;

    fn repository(&self, id: RepoId) -> StoreResult<Option<Repository>>;

    fn repositories(&self) -> StoreResult<Vec<Repository>>;

    /// Cloned and enabled repositories
    fn cloned_repositories(&self) -> StoreResult<Vec<Repository>>;

    /// Cloned, enabled repositories whose last fetch plus interval has elapsed
    fn repositories_due_for_fetch(&self, now: DateTime<Utc>) -> StoreResult<Vec<Repository>>;

    fn mark_cloned(&self, id: RepoId) -> StoreResult<()>;

    fn mark_uncloned(&self, id: RepoId) -> StoreResult<()>;

    /// Count one more consecutive failure; disables the repository once
    /// `threshold` is reached.
    fn register_failure(&self, id: RepoId, threshold: u32) -> StoreResult<FailureOutcome>;

    fn reset_failures(&self, id: RepoId) -> StoreResult<()>;

    /// Record that a fetch ran, with the interval until the next one
    fn record_fetch_check(
        &self,
        id: RepoId,
        at: DateTime<Utc>,
        interval_secs: u64,
    ) -> StoreResult<()>;

    fn save_fetch(
        &self,
        id: RepoId,
        path: &str,
        changes: [&str; 2],
        at: DateTime<Utc>,
    ) -> StoreResult<Fetch>;

    /// Persist a scan, its credentials and the commits it covered in one
    /// transaction. On error nothing is written.
    fn save_scan(
        &self,
        scan: &NewScan,
        credentials: &[NewCredential],
        commits: &[String],
    ) -> StoreResult<Scan>;

    /// A history scan with exactly this range has already been recorded
    fn range_scanned(&self, id: RepoId, start: &str, stop: Option<&str>) -> StoreResult<bool>;

    /// The subset of `shas` already covered by a history scan
    fn covered_commits(&self, id: RepoId, shas: &[String]) -> StoreResult<HashSet<String>>;

    /// A tree scan of this tip under this rules version exists
    fn tree_scan_exists(
        &self,
        id: RepoId,
        branch: &str,
        sha: &str,
        rules_version: u32,
    ) -> StoreResult<bool>;

    /// Record that every branch tip of the repository is covered under
    /// `rules_version`
    fn set_rules_version(&self, id: RepoId, rules_version: u32) -> StoreResult<()>;

    /// Cloned, enabled repositories last fully covered under an older rules
    /// version. Repositories never fully scanned are left to catch-up.
    fn repositories_behind_rules(&self, rules_version: u32) -> StoreResult<Vec<Repository>>;

    fn upsert_branch(&self, id: RepoId, name: &str, credential_count: u64) -> StoreResult<()>;

    /// Delete branches not in `keep`; returns how many were removed
    fn prune_branches(&self, id: RepoId, keep: &[String]) -> StoreResult<usize>;

    fn branches(&self, id: RepoId) -> StoreResult<Vec<Branch>>;

    fn credentials_for_repository(&self, id: RepoId) -> StoreResult<Vec<Credential>>;

    fn scans_for_repository(&self, id: RepoId) -> StoreResult<Vec<Scan>>;

    fn fetches_for_repository(&self, id: RepoId) -> StoreResult<Vec<Fetch>>;

    fn counts(&self) -> StoreResult<StoreCounts>;

    /// Count one more delivery of a message; returns the new attempt count
    fn bump_message_retry(&self, message_id: &str) -> StoreResult<u32>;

    fn clear_message_retry(&self, message_id: &str) -> StoreResult<()>;
}
