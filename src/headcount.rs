//! Head Credential Counter
//!
//! Counts the credentials present right now in each branch tip and keeps
//! the branch table in step with the remote: branches that disappeared are
//! pruned. Historical findings are never consulted.

use crate::core::shutdown::ShutdownCoordinator;
use crate::git::{GitCapability, GitResult};
use crate::metrics::{self, Emitter};
use crate::pool::RepoLocks;
use crate::scanner::sniff_tree;
use crate::sniff::Sniffer;
use crate::store::{Repository, RepositoryStore, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct HeadCounter {
    store: Arc<dyn RepositoryStore>,
    git: Arc<dyn GitCapability>,
    sniffer: Arc<dyn Sniffer>,
    metrics: Arc<dyn Emitter>,
    locks: Arc<RepoLocks>,
}

impl HeadCounter {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        git: Arc<dyn GitCapability>,
        sniffer: Arc<dyn Sniffer>,
        metrics: Arc<dyn Emitter>,
        locks: Arc<RepoLocks>,
    ) -> Self {
        Self {
            store,
            git,
            sniffer,
            metrics,
            locks,
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
                        if let Err(e) = self.count_all().await {
                            log::error!("Head credential count failed: {}", e);
                        }
                    }
                }
            }
            log::info!("Head credential counter stopped");
        })
    }

    /// Recount every cloned repository; returns the fleet-wide total
    pub async fn count_all(&self) -> StoreResult<u64> {
        let mut total = 0;
        for repo in self.store.cloned_repositories()? {
            let _guard = self.locks.lock(repo.id).await;
            match self.count_repository(&repo).await {
                Ok(Ok(count)) => total += count,
                Ok(Err(e)) => log::warn!("Cannot count credentials in {}: {}", repo.full_name(), e),
                Err(e) => log::error!("Cannot store branch counts for {}: {}", repo.full_name(), e),
            }
        }
        self.metrics.gauge(metrics::GAUGE_HEAD_CREDENTIALS, total);
        Ok(total)
    }

    /// Count one repository's tips. The outer result is the store, the
    /// inner one git; on a git failure no branch rows are touched.
    pub async fn count_repository(&self, repo: &Repository) -> StoreResult<GitResult<u64>> {
        let tips = match self.git.branch_tips(&repo.path).await {
            Ok(tips) => tips,
            Err(e) => return Ok(Err(e)),
        };
        let mut counts = Vec::with_capacity(tips.len());
        for (branch, sha) in &tips {
            match sniff_tree(self.git.as_ref(), self.sniffer.as_ref(), &repo.path, sha).await {
                Ok(violations) => counts.push((branch.clone(), violations.len() as u64)),
                Err(e) => return Ok(Err(e)),
            }
        }

        let mut total = 0;
        for (branch, count) in &counts {
            self.store.upsert_branch(repo.id, branch, *count)?;
            total += count;
        }
        let keep: Vec<String> = tips.into_keys().collect();
        let pruned = self.store.prune_branches(repo.id, &keep)?;
        log::debug!(
            "{}: {} live credential(s) across {} branch(es), {} pruned",
            repo.full_name(),
            total,
            keep.len(),
            pruned
        );
        Ok(Ok(total))
    }
}
