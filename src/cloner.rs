//! Cloner
//!
//! Clones newly discovered repositories into the workspace and baseline
//! scans their full history before they join the fetch cycle.

use crate::core::shutdown::ShutdownCoordinator;
use crate::git::{GitCapability, GitError};
use crate::metrics::{self, Emitter};
use crate::pool::{InFlightGuard, RepoJob, RepoLocks, RequestStatus, Requests, WorkerPool};
use crate::scanner::AncestryScanner;
use crate::store::{RepoId, Repository, RepositoryStore, ScanType, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("Clone of {repository} failed: {source}")]
    Git {
        repository: String,
        #[source]
        source: GitError,
    },

    #[error("Cannot prepare {path} for {repository}: {source}")]
    Workspace {
        repository: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error while cloning {repository}: {source}")]
    Store {
        repository: String,
        #[source]
        source: StoreError,
    },
}

pub type CloneResult<T> = Result<T, CloneError>;

/// Working directory of `owner/name` under the workspace root, or `None`
/// for names that would escape it
pub fn clone_path(root: &Path, owner: &str, name: &str) -> Option<PathBuf> {
    let safe = |part: &str| {
        !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\'])
    };
    (safe(owner) && safe(name)).then(|| root.join(owner).join(name))
}

/// Holds the repository's claim until the clone and its init scan finish
pub struct CloneJob {
    repository_id: RepoId,
    _claim: InFlightGuard<RepoId>,
}

impl RepoJob for CloneJob {
    fn repository_id(&self) -> RepoId {
        self.repository_id
    }
}

#[derive(Clone)]
pub struct CloneRequests {
    requests: Requests<CloneJob>,
}

impl CloneRequests {
    pub fn request(&self, repository_id: RepoId) -> RequestStatus {
        let status = self.requests.request(repository_id, |claim| CloneJob {
            repository_id,
            _claim: claim,
        });
        if let RequestStatus::Rejected(e) = &status {
            log::warn!("Could not queue clone of repository {}: {}", repository_id, e);
        }
        status
    }

    /// A clone is queued or running
    pub fn in_flight(&self, repository_id: RepoId) -> bool {
        self.requests.is_pending(repository_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    pub branches: usize,
    pub credentials: usize,
    /// The init scan failed; catch-up on the next fetch retries it
    pub scan_failed: bool,
}

pub struct Cloner {
    store: Arc<dyn RepositoryStore>,
    git: Arc<dyn GitCapability>,
    scanner: Arc<AncestryScanner>,
    metrics: Arc<dyn Emitter>,
    max_failures: u32,
}

impl Cloner {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        git: Arc<dyn GitCapability>,
        scanner: Arc<AncestryScanner>,
        metrics: Arc<dyn Emitter>,
        max_failures: u32,
    ) -> Self {
        Self {
            store,
            git,
            scanner,
            metrics,
            max_failures,
        }
    }

    /// Start the clone pool. The task ends after shutdown once the workers
    /// have drained.
    pub fn spawn(
        self: Arc<Self>,
        workers: usize,
        depth: usize,
        locks: Arc<RepoLocks>,
        shutdown: &ShutdownCoordinator,
    ) -> (CloneRequests, JoinHandle<()>) {
        let this = self.clone();
        let pool = WorkerPool::start("clone", workers, depth, locks, shutdown, move |job: CloneJob| {
            let this = this.clone();
            async move {
                if let Err(e) = this.clone_repository(job.repository_id).await {
                    log::warn!("{}", e);
                }
                drop(job);
            }
        });
        let requests = CloneRequests {
            requests: Requests::new(pool.submitter()),
        };
        let mut signal = shutdown.subscribe();
        let task = tokio::spawn(async move {
            signal.recv().await;
            pool.join().await;
            log::info!("Cloner stopped");
        });
        (requests, task)
    }

    /// Clone one repository and run its init scan.
    ///
    /// Returns `None` when there is nothing to do: unknown, disabled or
    /// already on disk.
    pub async fn clone_repository(&self, id: RepoId) -> CloneResult<Option<CloneReport>> {
        let repo = match self.store.repository(id) {
            Ok(Some(repo)) => repo,
            Ok(None) => return Ok(None),
            Err(source) => {
                return Err(CloneError::Store {
                    repository: format!("#{}", id),
                    source,
                })
            }
        };
        if repo.disabled || (repo.cloned && repo.path.is_dir()) {
            return Ok(None);
        }
        let store_error = |source: StoreError| CloneError::Store {
            repository: repo.full_name(),
            source,
        };

        log::info!("Cloning {} into {}", repo.full_name(), repo.path.display());
        if let Err(e) = self.checkout(&repo).await {
            self.metrics.counter(metrics::CLONER_FAILURES, 1);
            let outcome = self
                .store
                .register_failure(repo.id, self.max_failures)
                .map_err(store_error)?;
            if outcome.disabled {
                log::error!(
                    "Disabled {} after {} consecutive clone failures",
                    repo.full_name(),
                    outcome.failures
                );
            }
            return Err(e);
        }
        self.store.mark_cloned(repo.id).map_err(store_error)?;
        self.store.reset_failures(repo.id).map_err(store_error)?;

        let tips = match self.git.branch_tips(&repo.path).await {
            Ok(tips) => tips,
            Err(e) => {
                log::error!("Cloned {} but cannot list branches: {}", repo.full_name(), e);
                return Ok(Some(CloneReport {
                    branches: 0,
                    credentials: 0,
                    scan_failed: true,
                }));
            }
        };
        let (credentials, scan_failed) =
            match self.scanner.scan_multiple(&repo, &tips, ScanType::Init).await {
                Ok(found) => {
                    self.store
                        .set_rules_version(repo.id, self.scanner.rules_version())
                        .map_err(store_error)?;
                    (found.len(), false)
                }
                Err(e) => {
                    log::error!("Init scan failed: {}", e);
                    (0, true)
                }
            };
        log::info!(
            "Cloned {}: {} branch(es), {} credential(s)",
            repo.full_name(),
            tips.len(),
            credentials
        );
        Ok(Some(CloneReport {
            branches: tips.len(),
            credentials,
            scan_failed,
        }))
    }

    async fn checkout(&self, repo: &Repository) -> CloneResult<()> {
        let workspace_error = |source: std::io::Error| CloneError::Workspace {
            repository: repo.full_name(),
            path: repo.path.clone(),
            source,
        };
        if tokio::fs::try_exists(&repo.path)
            .await
            .map_err(workspace_error)?
        {
            log::warn!(
                "Removing stale directory {} before cloning {}",
                repo.path.display(),
                repo.full_name()
            );
            tokio::fs::remove_dir_all(&repo.path)
                .await
                .map_err(workspace_error)?;
        }
        if let Some(parent) = repo.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(workspace_error)?;
        }

        if let Err(source) = self.git.clone_repo(&repo.ssh_url, &repo.path).await {
            if let Err(e) = tokio::fs::remove_dir_all(&repo.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Could not clean up {}: {}", repo.path.display(), e);
                }
            }
            return Err(CloneError::Git {
                repository: repo.full_name(),
                source,
            });
        }
        Ok(())
    }
}
