//! Persisted records
//!
//! Timestamps are stored as unix seconds and surfaced as `DateTime<Utc>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

pub type RepoId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
    /// Working directory of the clone
    pub path: PathBuf,
    pub ssh_url: String,
    pub private: bool,
    pub default_branch: String,
    pub cloned: bool,
    pub disabled: bool,
    pub failed_fetches: u32,
    pub fetch_interval_secs: u64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Rules version every branch tip has been fully scanned under; unset
    /// until the first complete history scan
    pub rules_version: Option<u32>,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Repository as first seen by discovery
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub owner: String,
    pub name: String,
    pub path: PathBuf,
    pub ssh_url: String,
    pub private: bool,
    pub default_branch: String,
    pub fetch_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub id: i64,
    pub repository_id: RepoId,
    pub name: String,
    pub credential_count: u64,
}

/// One observed ref movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fetch {
    pub id: i64,
    pub repository_id: RepoId,
    /// Ref that moved, e.g. `refs/heads/main`
    pub path: String,
    /// `[old, new]`; the all-zero id marks a created or deleted ref
    pub changes: [String; 2],
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    /// Full history after the first clone
    Init,
    /// Commit range revealed by a fetch
    Fetch,
    /// Tip tree under a newer rules version
    Rescan,
}

/// How a credential was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanMethod {
    /// Added line in a commit diff
    Diff,
    /// Line of a file in a tip tree
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scan {
    pub id: i64,
    pub repository_id: Option<RepoId>,
    pub fetch_id: Option<i64>,
    pub branch: String,
    pub scan_type: ScanType,
    pub start_sha: String,
    pub stop_sha: Option<String>,
    pub rules_version: u32,
    pub scan_start: DateTime<Utc>,
    pub scan_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewScan {
    pub repository_id: RepoId,
    pub fetch_id: Option<i64>,
    pub branch: String,
    pub scan_type: ScanType,
    pub start_sha: String,
    pub stop_sha: Option<String>,
    pub rules_version: u32,
    pub scan_start: DateTime<Utc>,
    pub scan_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub id: i64,
    pub scan_id: i64,
    pub owner: String,
    pub repository: String,
    pub sha: String,
    pub path: String,
    pub line_number: u32,
    pub match_start: u32,
    pub match_end: u32,
    pub private: bool,
    pub method: ScanMethod,
    pub rules_version: u32,
}

/// Credential candidate before it is attributed to a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NewCredential {
    pub owner: String,
    pub repository: String,
    pub sha: String,
    pub path: String,
    pub line_number: u32,
    pub match_start: u32,
    pub match_end: u32,
    pub private: bool,
    pub method: ScanMethod,
    pub rules_version: u32,
}

/// Aggregate gauges for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub repositories: u64,
    pub cloned: u64,
    pub disabled: u64,
    pub failing: u64,
    pub fetches: u64,
    pub scans: u64,
    pub credentials: u64,
    pub head_credentials: u64,
}

/// Result of recording a clone or fetch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failures: u32,
    /// The failure pushed the repository over the threshold
    pub disabled: bool,
}
