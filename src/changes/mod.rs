//! Change Discoverer
//!
//! Fetches cloned repositories when their adaptive interval elapses or a
//! push hint arrives, records every ref movement as a fetch and scans only
//! the commits the fetch brought in.
//!
//! Requests go through a [`WorkerPool`] keyed by repository, so one
//! repository is never fetched twice at once. A request for a repository
//! that is already queued is coalesced into the queued one.

pub mod interval;

#[cfg(test)]
mod tests;

pub use interval::FetchIntervalPolicy;

use crate::core::shutdown::ShutdownCoordinator;
use crate::core::time::TimeProvider;
use crate::git::{branch_name, GitCapability, GitError};
use crate::metrics::{self, Emitter};
use crate::pool::{InFlightGuard, RepoJob, RepoLocks, RequestStatus, Requests, WorkerPool};
use crate::scanner::{AncestryScanner, ScanUnit};
use crate::store::{RepoId, Repository, RepositoryStore, ScanType, StoreError};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum ChangeError {
    #[error("Fetch of {repository} failed: {source}")]
    Fetch {
        repository: String,
        #[source]
        source: GitError,
    },

    #[error("Store error while fetching {repository}: {source}")]
    Store {
        repository: String,
        #[source]
        source: StoreError,
    },
}

pub type ChangeResult<T> = Result<T, ChangeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FetchReason {
    Scheduled,
    PushHint,
}

pub struct FetchJob {
    repository_id: RepoId,
    reason: FetchReason,
    claim: Option<InFlightGuard<RepoId>>,
}

impl RepoJob for FetchJob {
    fn repository_id(&self) -> RepoId {
        self.repository_id
    }
}

/// What one fetch did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Refs that moved, were created or were deleted
    pub changed_refs: usize,
    pub credentials: usize,
    /// Scan units that failed and are left for catch-up
    pub failed_scans: usize,
    pub next_interval_secs: u64,
}

/// Anything that can be asked to fetch a repository soon
pub trait FetchTrigger: Send + Sync {
    fn request(&self, repository_id: RepoId, reason: FetchReason) -> RequestStatus;
}

/// Cloneable producer side used by the ticker and the push processor
#[derive(Clone)]
pub struct FetchRequests {
    requests: Requests<FetchJob>,
}

impl FetchTrigger for FetchRequests {
    fn request(&self, repository_id: RepoId, reason: FetchReason) -> RequestStatus {
        let status = self.requests.request(repository_id, |claim| FetchJob {
            repository_id,
            reason,
            claim: Some(claim),
        });
        match &status {
            RequestStatus::Coalesced => log::debug!(
                "Fetch of repository {} already queued ({})",
                repository_id,
                reason
            ),
            RequestStatus::Rejected(e) => {
                log::warn!("Could not queue fetch of repository {}: {}", repository_id, e)
            }
            RequestStatus::Queued => {}
        }
        status
    }
}

impl FetchRequests {
    pub fn is_queued(&self, repository_id: RepoId) -> bool {
        self.requests.is_pending(repository_id)
    }
}

pub struct ChangeDiscoverer {
    store: Arc<dyn RepositoryStore>,
    git: Arc<dyn GitCapability>,
    scanner: Arc<AncestryScanner>,
    metrics: Arc<dyn Emitter>,
    clock: Arc<dyn TimeProvider>,
    policy: FetchIntervalPolicy,
    max_failures: u32,
}

impl ChangeDiscoverer {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        git: Arc<dyn GitCapability>,
        scanner: Arc<AncestryScanner>,
        metrics: Arc<dyn Emitter>,
        clock: Arc<dyn TimeProvider>,
        policy: FetchIntervalPolicy,
        max_failures: u32,
    ) -> Self {
        Self {
            store,
            git,
            scanner,
            metrics,
            clock,
            policy,
            max_failures,
        }
    }

    /// Start the fetch pool and the ticker that queues due repositories.
    ///
    /// The returned task ends after shutdown once every worker has drained.
    pub fn spawn(
        self: Arc<Self>,
        workers: usize,
        depth: usize,
        tick: Duration,
        locks: Arc<RepoLocks>,
        shutdown: &ShutdownCoordinator,
    ) -> (FetchRequests, JoinHandle<()>) {
        let handler = {
            let this = self.clone();
            move |job: FetchJob| {
                let this = this.clone();
                async move { this.handle(job).await }
            }
        };
        let pool = WorkerPool::start("fetch", workers, depth, locks, shutdown, handler);
        let requests = FetchRequests {
            requests: Requests::new(pool.submitter()),
        };

        let ticker_requests = requests.clone();
        let mut signal = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = signal.recv() => break,
                    _ = ticker.tick() => {
                        self.queue_due(&ticker_requests);
                    }
                }
            }
            pool.join().await;
            log::info!("Change discoverer stopped");
        });
        (requests, task)
    }

    /// Queue every repository whose fetch interval has elapsed
    pub fn queue_due(&self, requests: &FetchRequests) -> usize {
        let due = match self.store.repositories_due_for_fetch(self.clock.now()) {
            Ok(due) => due,
            Err(e) => {
                log::error!("Could not list repositories due for fetch: {}", e);
                return 0;
            }
        };
        due.iter()
            .filter(|repo| {
                requests.request(repo.id, FetchReason::Scheduled) == RequestStatus::Queued
            })
            .count()
    }

    async fn handle(&self, mut job: FetchJob) {
        // Requests arriving from here on queue a follow-up fetch
        drop(job.claim.take());
        log::debug!(
            "Fetching repository {} ({})",
            job.repository_id,
            job.reason
        );
        if let Err(e) = self.fetch_repository(job.repository_id).await {
            log::warn!("{}", e);
        }
    }

    /// Fetch one repository and scan what moved.
    ///
    /// The caller holds the repository's lock. Returns `None` when the
    /// repository is unknown, disabled or not cloned.
    pub async fn fetch_repository(&self, id: RepoId) -> ChangeResult<Option<FetchReport>> {
        let repo = match self.store.repository(id) {
            Ok(Some(repo)) => repo,
            Ok(None) => return Ok(None),
            Err(source) => {
                return Err(ChangeError::Store {
                    repository: format!("#{}", id),
                    source,
                })
            }
        };
        if repo.disabled || !repo.cloned {
            log::debug!("Skipping fetch of {}: not active", repo.full_name());
            return Ok(None);
        }
        if !repo.path.is_dir() {
            log::warn!(
                "Clone of {} is missing at {}; waiting for discovery to re-clone",
                repo.full_name(),
                repo.path.display()
            );
            return Ok(None);
        }

        let store_error = |source: StoreError| ChangeError::Store {
            repository: repo.full_name(),
            source,
        };

        let changes = match self.git.fetch(&repo.path).await {
            Ok(changes) => changes,
            Err(source) => {
                self.record_failure(&repo).map_err(store_error)?;
                return Err(ChangeError::Fetch {
                    repository: repo.full_name(),
                    source,
                });
            }
        };
        let now = self.clock.now();
        if repo.failed_fetches > 0 {
            self.store.reset_failures(repo.id).map_err(store_error)?;
        }

        let mut report = FetchReport {
            changed_refs: changes.len(),
            ..FetchReport::default()
        };
        for (reference, update) in &changes {
            let fetch = self
                .store
                .save_fetch(repo.id, reference, [update.old.as_str(), update.new.as_str()], now)
                .map_err(store_error)?;
            if update.is_deleted() {
                log::info!("{} deleted {}", repo.full_name(), reference);
                continue;
            }
            let unit = ScanUnit {
                branch: branch_name(reference),
                start: &update.new,
                stop: (!update.is_created()).then_some(update.old.as_str()),
                scan_type: ScanType::Fetch,
                fetch_id: Some(fetch.id),
            };
            match self.scanner.scan(&repo, unit).await {
                Ok(outcome) => report.credentials += outcome.credentials().len(),
                Err(e) => {
                    report.failed_scans += 1;
                    log::error!("{}", e);
                }
            }
        }

        match self.git.branch_tips(&repo.path).await {
            Ok(tips) => {
                match self
                    .scanner
                    .scan_uncovered(&repo, &tips, ScanType::Fetch)
                    .await
                {
                    Ok(found) => {
                        report.credentials += found.len();
                        if repo.rules_version.is_none() {
                            self.store
                                .set_rules_version(repo.id, self.scanner.rules_version())
                                .map_err(store_error)?;
                        }
                    }
                    Err(e) => {
                        report.failed_scans += 1;
                        log::error!("Catch-up scan failed: {}", e);
                    }
                }
                if let Some(tip) = tips.get(&repo.default_branch) {
                    if let Err(e) = self.git.hard_reset(&repo.path, tip).await {
                        log::warn!(
                            "Could not reset {} to {}: {}",
                            repo.full_name(),
                            repo.default_branch,
                            e
                        );
                    }
                }
            }
            Err(e) => log::warn!("Could not read branches of {}: {}", repo.full_name(), e),
        }

        report.next_interval_secs = self
            .policy
            .next_secs(repo.fetch_interval_secs, !changes.is_empty());
        self.store
            .record_fetch_check(repo.id, now, report.next_interval_secs)
            .map_err(store_error)?;

        if report.changed_refs > 0 {
            log::info!(
                "Fetched {}: {} ref(s) moved, {} credential(s), next fetch in {}s",
                repo.full_name(),
                report.changed_refs,
                report.credentials,
                report.next_interval_secs
            );
        }
        Ok(Some(report))
    }

    fn record_failure(&self, repo: &Repository) -> Result<(), StoreError> {
        self.metrics.counter(metrics::FETCH_FAILURES, 1);
        let outcome = self.store.register_failure(repo.id, self.max_failures)?;
        if outcome.disabled {
            log::error!(
                "Disabled {} after {} consecutive failures",
                repo.full_name(),
                outcome.failures
            );
        }
        // Failed fetches back off like no-op fetches
        let interval = self.policy.next_secs(repo.fetch_interval_secs, false);
        self.store
            .record_fetch_check(repo.id, self.clock.now(), interval)
    }
}
