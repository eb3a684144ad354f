//! Rescanner
//!
//! When the rule set changes, sniffs the current tree of every branch tip
//! under the new rules version. History is not walked again and findings
//! from earlier versions are left untouched.
//!
//! Progress is tracked per repository: a repository counts as rescanned
//! only once all of its tips are done, so an interrupted pass resumes with
//! the repositories it did not finish.

use crate::core::shutdown::ShutdownSignal;
use crate::core::time::TimeProvider;
use crate::git::GitCapability;
use crate::metrics::{self, Emitter};
use crate::notify::Notifier;
use crate::pool::RepoLocks;
use crate::scanner::{sniff_tree, ScanError, ScanResult};
use crate::sniff::Sniffer;
use crate::store::{
    NewCredential, NewScan, Repository, RepositoryStore, ScanMethod, ScanType, StoreResult,
};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RescanReport {
    pub repositories: usize,
    /// Tips scanned in this pass
    pub tips: usize,
    /// Tips already scanned under this rules version
    pub skipped: usize,
    pub credentials: usize,
    pub failures: usize,
}

impl RescanReport {
    fn absorb(&mut self, other: RescanReport) {
        self.repositories += other.repositories;
        self.tips += other.tips;
        self.skipped += other.skipped;
        self.credentials += other.credentials;
        self.failures += other.failures;
    }
}

pub struct Rescanner {
    store: Arc<dyn RepositoryStore>,
    git: Arc<dyn GitCapability>,
    sniffer: Arc<dyn Sniffer>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Emitter>,
    clock: Arc<dyn TimeProvider>,
    locks: Arc<RepoLocks>,
}

impl Rescanner {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        git: Arc<dyn GitCapability>,
        sniffer: Arc<dyn Sniffer>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn Emitter>,
        clock: Arc<dyn TimeProvider>,
        locks: Arc<RepoLocks>,
    ) -> Self {
        Self {
            store,
            git,
            sniffer,
            notifier,
            metrics,
            clock,
            locks,
        }
    }

    /// Some cloned repository is covered only under older rules.
    /// A fresh database needs no rescan.
    pub fn needed(&self) -> StoreResult<bool> {
        Ok(!self
            .store
            .repositories_behind_rules(self.sniffer.rules_version())?
            .is_empty())
    }

    /// Rescan every repository behind the current rules, stopping early on
    /// shutdown
    pub async fn rescan_all(&self, shutdown: &ShutdownSignal) -> StoreResult<RescanReport> {
        let version = self.sniffer.rules_version();
        let mut report = RescanReport::default();
        let pending = self.store.repositories_behind_rules(version)?;
        log::info!(
            "Rescanning branch tips of {} repositories under rules version {}",
            pending.len(),
            version
        );
        for repo in pending {
            if shutdown.is_requested() {
                log::info!("Rescan interrupted by shutdown");
                break;
            }
            let _guard = self.locks.lock(repo.id).await;
            match self.rescan_repository(&repo).await {
                Ok(done) => report.absorb(done),
                Err(e) => {
                    report.failures += 1;
                    log::error!("{}", e);
                }
            }
        }
        log::info!(
            "Rescan finished: {} repositories, {} tip(s), {} credential(s), {} failure(s)",
            report.repositories,
            report.tips,
            report.credentials,
            report.failures
        );
        Ok(report)
    }

    /// Tree-scan each branch tip of one repository and record it as covered
    /// under the current rules. The caller holds the repository's lock.
    pub async fn rescan_repository(&self, repo: &Repository) -> ScanResult<RescanReport> {
        let version = self.sniffer.rules_version();
        let git_error = |source| ScanError::Git {
            repository: repo.full_name(),
            source,
        };
        let tips = self.git.branch_tips(&repo.path).await.map_err(git_error)?;
        let mut report = RescanReport {
            repositories: 1,
            ..RescanReport::default()
        };
        let mut seen = HashSet::new();

        for (branch, sha) in &tips {
            let store_error = |source| ScanError::Store {
                repository: repo.full_name(),
                range: format!("{}@{}", branch, &sha[..sha.len().min(8)]),
                source,
            };
            if self
                .store
                .tree_scan_exists(repo.id, branch, sha, version)
                .map_err(store_error)?
            {
                report.skipped += 1;
                continue;
            }

            let scan_start = self.clock.now();
            // A tip shared with an earlier branch gets a receipt but no
            // second copy of its findings
            let credentials: Vec<NewCredential> = if seen.insert(sha.clone()) {
                sniff_tree(self.git.as_ref(), self.sniffer.as_ref(), &repo.path, sha)
                    .await
                    .map_err(git_error)?
                    .into_iter()
                    .map(|violation| NewCredential {
                        owner: repo.owner.clone(),
                        repository: repo.name.clone(),
                        sha: sha.clone(),
                        path: violation.path,
                        line_number: violation.line_number,
                        match_start: violation.match_start,
                        match_end: violation.match_end,
                        private: repo.private,
                        method: ScanMethod::Tree,
                        rules_version: version,
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let scan = NewScan {
                repository_id: repo.id,
                fetch_id: None,
                branch: branch.clone(),
                scan_type: ScanType::Rescan,
                start_sha: sha.clone(),
                stop_sha: None,
                rules_version: version,
                scan_start,
                scan_end: self.clock.now(),
            };
            self.store
                .save_scan(&scan, &credentials, &[])
                .map_err(store_error)?;
            report.tips += 1;
            report.credentials += credentials.len();

            if !credentials.is_empty() {
                self.metrics
                    .counter(metrics::SCANNER_CREDENTIALS, credentials.len() as u64);
                if let Err(e) = self
                    .notifier
                    .notify(&repo.full_name(), &credentials, repo.private)
                    .await
                {
                    log::warn!("Could not deliver rescan findings for {}: {}", repo.full_name(), e);
                }
            }
        }
        self.store
            .set_rules_version(repo.id, version)
            .map_err(|source| ScanError::Store {
                repository: repo.full_name(),
                range: format!("rules v{}", version),
                source,
            })?;
        log::debug!(
            "Rescanned {}: {} tip(s), {} skipped",
            repo.full_name(),
            report.tips,
            report.skipped
        );
        Ok(report)
    }
}
