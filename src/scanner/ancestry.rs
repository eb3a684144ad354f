//! History scanning
//!
//! Walks commit ancestry backward from a start commit, sniffs the lines each
//! commit added and commits one scan record with its findings.

use super::error::{ScanError, ScanResult};
use crate::core::time::TimeProvider;
use crate::git::patch::{added_lines, AddedLine};
use crate::git::{GitCapability, GitError};
use crate::metrics::{self, Emitter};
use crate::notify::Notifier;
use crate::sniff::Sniffer;
use crate::store::{
    NewCredential, NewScan, Repository, RepositoryStore, Scan, ScanMethod, ScanType, StoreError,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// One bounded piece of history to scan
#[derive(Debug, Clone, Copy)]
pub struct ScanUnit<'a> {
    pub branch: &'a str,
    pub start: &'a str,
    /// Exclusive lower boundary; `None` walks to the root commits
    pub stop: Option<&'a str>,
    pub scan_type: ScanType,
    pub fetch_id: Option<i64>,
}

#[derive(Debug)]
pub enum ScanOutcome {
    /// An identical range was already recorded
    AlreadyScanned,
    Scanned {
        scan: Scan,
        commits: usize,
        credentials: Vec<NewCredential>,
    },
}

impl ScanOutcome {
    pub fn credentials(&self) -> &[NewCredential] {
        match self {
            ScanOutcome::AlreadyScanned => &[],
            ScanOutcome::Scanned { credentials, .. } => credentials,
        }
    }
}

#[derive(Default)]
struct Walk {
    commits: Vec<String>,
    credentials: Vec<NewCredential>,
    violations: u64,
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

fn range_label(start: &str, stop: Option<&str>) -> String {
    format!("{}..{}", stop.map(short).unwrap_or("root"), short(start))
}

pub struct AncestryScanner {
    store: Arc<dyn RepositoryStore>,
    git: Arc<dyn GitCapability>,
    sniffer: Arc<dyn Sniffer>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Emitter>,
    clock: Arc<dyn TimeProvider>,
}

impl AncestryScanner {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        git: Arc<dyn GitCapability>,
        sniffer: Arc<dyn Sniffer>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn Emitter>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            git,
            sniffer,
            notifier,
            metrics,
            clock,
        }
    }

    pub fn rules_version(&self) -> u32 {
        self.sniffer.rules_version()
    }

    /// Scan one range. Nothing is persisted unless the whole range was
    /// walked; a failed scan can be retried from the same boundaries.
    pub async fn scan(&self, repo: &Repository, unit: ScanUnit<'_>) -> ScanResult<ScanOutcome> {
        let mut visited = HashSet::new();
        self.scan_with(repo, unit, &mut visited).await
    }

    /// Scan every branch tip to the root, default branch first.
    ///
    /// Commits reached from an earlier tip are not walked again, so each
    /// commit is attributed to exactly one scan. Stops at the first failure.
    pub async fn scan_multiple(
        &self,
        repo: &Repository,
        tips: &BTreeMap<String, String>,
        scan_type: ScanType,
    ) -> ScanResult<Vec<NewCredential>> {
        let mut ordered: Vec<(&String, &String)> = tips.iter().collect();
        ordered.sort_by_key(|(branch, _)| *branch != &repo.default_branch);

        let mut visited = HashSet::new();
        let mut found = Vec::new();
        for (branch, sha) in ordered {
            let unit = ScanUnit {
                branch,
                start: sha,
                stop: None,
                scan_type,
                fetch_id: None,
            };
            let outcome = self.scan_with(repo, unit, &mut visited).await?;
            found.extend_from_slice(outcome.credentials());
        }
        Ok(found)
    }

    /// Scan the tips whose commit no history scan has covered yet
    pub async fn scan_uncovered(
        &self,
        repo: &Repository,
        tips: &BTreeMap<String, String>,
        scan_type: ScanType,
    ) -> ScanResult<Vec<NewCredential>> {
        let shas: Vec<String> = tips.values().cloned().collect();
        let covered = self
            .store
            .covered_commits(repo.id, &shas)
            .map_err(|source| ScanError::Store {
                repository: repo.full_name(),
                range: "catch-up".to_string(),
                source,
            })?;
        let pending: BTreeMap<String, String> = tips
            .iter()
            .filter(|(_, sha)| !covered.contains(*sha))
            .map(|(branch, sha)| (branch.clone(), sha.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        log::info!(
            "Catching up {} uncovered branch tip(s) in {}",
            pending.len(),
            repo.full_name()
        );
        self.scan_multiple(repo, &pending, scan_type).await
    }

    async fn scan_with(
        &self,
        repo: &Repository,
        unit: ScanUnit<'_>,
        visited: &mut HashSet<String>,
    ) -> ScanResult<ScanOutcome> {
        let range = range_label(unit.start, unit.stop);
        let store_error = |source: StoreError| ScanError::Store {
            repository: repo.full_name(),
            range: range.clone(),
            source,
        };

        if self
            .store
            .range_scanned(repo.id, unit.start, unit.stop)
            .map_err(store_error)?
        {
            log::debug!(
                "{} {} {} already scanned",
                repo.full_name(),
                unit.branch,
                range
            );
            return Ok(ScanOutcome::AlreadyScanned);
        }

        let scan_start = self.clock.now();
        let walk = self.walk(repo, &unit, visited).await?;
        let record = NewScan {
            repository_id: repo.id,
            fetch_id: unit.fetch_id,
            branch: unit.branch.to_string(),
            scan_type: unit.scan_type,
            start_sha: unit.start.to_string(),
            stop_sha: unit.stop.map(str::to_string),
            rules_version: self.sniffer.rules_version(),
            scan_start,
            scan_end: self.clock.now(),
        };
        let scan = self
            .store
            .save_scan(&record, &walk.credentials, &walk.commits)
            .map_err(|source| {
                log::error!(
                    "Failed to record {} scan of {} {} {}: {}",
                    unit.scan_type,
                    repo.full_name(),
                    unit.branch,
                    range,
                    source
                );
                store_error(source)
            })?;

        log::info!(
            "Scanned {} {} {} ({}): {} commit(s), {} credential(s)",
            repo.full_name(),
            unit.branch,
            range,
            unit.scan_type,
            walk.commits.len(),
            walk.credentials.len()
        );
        self.report(repo, &walk).await;

        Ok(ScanOutcome::Scanned {
            scan,
            commits: walk.commits.len(),
            credentials: walk.credentials,
        })
    }

    async fn walk(
        &self,
        repo: &Repository,
        unit: &ScanUnit<'_>,
        visited: &mut HashSet<String>,
    ) -> ScanResult<Walk> {
        let git_error = |source: GitError| ScanError::Git {
            repository: repo.full_name(),
            source,
        };
        let mut walk = Walk::default();
        let mut seen = HashSet::new();
        let mut stack = vec![unit.start.to_string()];

        while let Some(sha) = stack.pop() {
            if unit.stop == Some(sha.as_str()) || !visited.insert(sha.clone()) {
                continue;
            }
            let covered = self
                .store
                .covered_commits(repo.id, std::slice::from_ref(&sha))
                .map_err(|source| ScanError::Store {
                    repository: repo.full_name(),
                    range: range_label(unit.start, unit.stop),
                    source,
                })?;
            if !covered.is_empty() {
                continue;
            }

            let parents = self
                .git
                .parents(&repo.path, &sha)
                .await
                .map_err(git_error)?;
            let lines = self
                .introduced_lines(repo, &sha, &parents)
                .await
                .map_err(git_error)?;

            for line in lines {
                for violation in self
                    .sniffer
                    .sniff(&line.path, line.line_number, &line.content)
                {
                    walk.violations += 1;
                    let credential = NewCredential {
                        owner: repo.owner.clone(),
                        repository: repo.name.clone(),
                        sha: sha.clone(),
                        path: violation.path,
                        line_number: violation.line_number,
                        match_start: violation.match_start,
                        match_end: violation.match_end,
                        private: repo.private,
                        method: ScanMethod::Diff,
                        rules_version: self.sniffer.rules_version(),
                    };
                    if seen.insert(credential.clone()) {
                        walk.credentials.push(credential);
                    }
                }
            }

            walk.commits.push(sha);
            stack.extend(parents.into_iter().rev().filter(|p| !visited.contains(p)));
        }
        Ok(walk)
    }

    /// Lines a commit added. For merges, only lines new relative to every
    /// parent count; lines carried in from a parent were scanned there.
    async fn introduced_lines(
        &self,
        repo: &Repository,
        sha: &str,
        parents: &[String],
    ) -> Result<Vec<AddedLine>, GitError> {
        let Some((first, rest)) = parents.split_first() else {
            return Ok(added_lines(&self.git.diff(&repo.path, None, sha).await?));
        };
        let mut lines = added_lines(&self.git.diff(&repo.path, Some(first), sha).await?);
        for parent in rest {
            if lines.is_empty() {
                break;
            }
            let other: HashSet<AddedLine> =
                added_lines(&self.git.diff(&repo.path, Some(parent), sha).await?)
                    .into_iter()
                    .collect();
            lines.retain(|line| other.contains(line));
        }
        Ok(lines)
    }

    async fn report(&self, repo: &Repository, walk: &Walk) {
        if walk.violations > 0 {
            self.metrics
                .counter(metrics::SCANNER_VIOLATIONS, walk.violations);
        }
        if walk.credentials.is_empty() {
            return;
        }
        self.metrics
            .counter(metrics::SCANNER_CREDENTIALS, walk.credentials.len() as u64);
        if let Err(e) = self
            .notifier
            .notify(&repo.full_name(), &walk.credentials, repo.private)
            .await
        {
            log::warn!(
                "Could not deliver {} finding(s) for {}: {}",
                walk.credentials.len(),
                repo.full_name(),
                e
            );
        }
    }
}
