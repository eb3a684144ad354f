//! Repository Discoverer
//!
//! Reconciles the remote repository list against the store and the
//! workspace on a fixed interval, queueing clones for repositories that are
//! new, whose earlier clone failed, or whose working directory vanished.

use crate::cloner::{clone_path, CloneRequests};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::time::TimeProvider;
use crate::github::{GitHubResult, RemoteRepository, RepositoryLister};
use crate::pool::RequestStatus;
use crate::store::{NewRepository, Repository, RepositoryStore, StoreResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub listed: usize,
    pub inserted: usize,
    pub queued: usize,
    /// Clone already queued or running
    pub in_flight: usize,
    pub disabled: usize,
}

pub struct Discoverer {
    store: Arc<dyn RepositoryStore>,
    lister: Arc<dyn RepositoryLister>,
    clones: CloneRequests,
    clock: Arc<dyn TimeProvider>,
    workspace: PathBuf,
    initial_interval_secs: u64,
}

impl Discoverer {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        lister: Arc<dyn RepositoryLister>,
        clones: CloneRequests,
        clock: Arc<dyn TimeProvider>,
        workspace: PathBuf,
        initial_interval: Duration,
    ) -> Self {
        Self {
            store,
            lister,
            clones,
            clock,
            workspace,
            initial_interval_secs: initial_interval.as_secs(),
        }
    }

    pub fn spawn(self: Arc<Self>, period: Duration, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
        let mut signal = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = signal.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.discover().await {
                            log::warn!("Skipping discovery tick: {}", e);
                        }
                    }
                }
            }
            log::info!("Discoverer stopped");
        })
    }

    /// One reconciliation pass. A listing failure skips the whole pass.
    pub async fn discover(&self) -> GitHubResult<DiscoveryReport> {
        let remotes = self.lister.list_repositories().await?;
        let mut report = DiscoveryReport {
            listed: remotes.len(),
            ..DiscoveryReport::default()
        };

        for remote in &remotes {
            if let Err(e) = self.reconcile(remote, &mut report) {
                log::error!("Could not reconcile {}: {}", remote.full_name(), e);
            }
        }

        if report.inserted > 0 || report.queued > 0 {
            log::info!(
                "Discovery: {} listed, {} new, {} clone(s) queued",
                report.listed,
                report.inserted,
                report.queued
            );
        }
        Ok(report)
    }

    fn reconcile(&self, remote: &RemoteRepository, report: &mut DiscoveryReport) -> StoreResult<()> {
        let Some(path) = clone_path(&self.workspace, &remote.owner, &remote.name) else {
            log::warn!("Ignoring repository with unusable name {}", remote.full_name());
            return Ok(());
        };
        let new = NewRepository {
            owner: remote.owner.clone(),
            name: remote.name.clone(),
            path,
            ssh_url: remote.ssh_url.clone(),
            private: remote.private,
            default_branch: remote.default_branch.clone(),
            fetch_interval_secs: self.initial_interval_secs,
        };
        let (repo, created) = self.store.insert_repository(&new, self.clock.now())?;
        if created {
            log::info!("Discovered {}", repo.full_name());
            report.inserted += 1;
        }
        if repo.disabled {
            report.disabled += 1;
            return Ok(());
        }
        if repo.cloned {
            if repo.path.is_dir() {
                return Ok(());
            }
            if self.clones.in_flight(repo.id) {
                report.in_flight += 1;
                return Ok(());
            }
            log::warn!(
                "{} is marked cloned but {} is missing; cloning again",
                repo.full_name(),
                repo.path.display()
            );
            self.store.mark_uncloned(repo.id)?;
        }
        self.queue_clone(&repo, report);
        Ok(())
    }

    fn queue_clone(&self, repo: &Repository, report: &mut DiscoveryReport) {
        match self.clones.request(repo.id) {
            RequestStatus::Queued => report.queued += 1,
            RequestStatus::Coalesced => report.in_flight += 1,
            RequestStatus::Rejected(_) => {}
        }
    }
}
