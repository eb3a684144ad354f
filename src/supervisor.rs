//! Supervisor
//!
//! Owns the long-lived components, starts each on its own task and waits
//! for all of them to drain after shutdown is requested.

use crate::changes::{ChangeDiscoverer, FetchIntervalPolicy, FetchTrigger};
use crate::cloner::Cloner;
use crate::config::Config;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::time::TimeProvider;
use crate::discovery::Discoverer;
use crate::git::GitCapability;
use crate::github::RepositoryLister;
use crate::headcount::HeadCounter;
use crate::metrics::Emitter;
use crate::notify::Notifier;
use crate::pool::RepoLocks;
use crate::push::PushProcessor;
use crate::queue::HintSource;
use crate::rescanner::Rescanner;
use crate::scanner::AncestryScanner;
use crate::sniff::Sniffer;
use crate::stats::StatsReporter;
use crate::store::RepositoryStore;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything the components talk to outside the process
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RepositoryStore>,
    pub git: Arc<dyn GitCapability>,
    pub lister: Arc<dyn RepositoryLister>,
    pub hints: Arc<dyn HintSource>,
    pub sniffer: Arc<dyn Sniffer>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn Emitter>,
    pub clock: Arc<dyn TimeProvider>,
}

pub struct Supervisor {
    config: Config,
    services: Services,
    shutdown: ShutdownCoordinator,
}

impl Supervisor {
    pub fn new(config: Config, services: Services, shutdown: ShutdownCoordinator) -> Self {
        Self {
            config,
            services,
            shutdown,
        }
    }

    /// Run every component until shutdown, then wait for them to drain
    pub async fn run(self) {
        let handles = self.start();
        log::info!("Supervising {} component task(s)", handles.len());

        for (name, result) in futures::future::join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.await) }),
        )
        .await
        {
            if let Err(e) = result {
                log::error!("{} task ended abnormally: {}", name, e);
            }
        }
        log::info!("All components stopped");
    }

    fn start(&self) -> Vec<(&'static str, JoinHandle<()>)> {
        let s = &self.services;
        let config = &self.config;
        let locks = Arc::new(RepoLocks::new());
        let scanner = Arc::new(AncestryScanner::new(
            s.store.clone(),
            s.git.clone(),
            s.sniffer.clone(),
            s.notifier.clone(),
            s.metrics.clone(),
            s.clock.clone(),
        ));
        let policy =
            FetchIntervalPolicy::new(config.intervals.min_fetch(), config.intervals.max_fetch());
        let mut handles = Vec::new();

        let cloner = Arc::new(Cloner::new(
            s.store.clone(),
            s.git.clone(),
            scanner.clone(),
            s.metrics.clone(),
            config.limits.max_consecutive_failures,
        ));
        let (clones, task) = cloner.spawn(
            config.workers.clone_workers,
            config.workers.queue_depth,
            locks.clone(),
            &self.shutdown,
        );
        handles.push(("cloner", task));

        let discoverer = Arc::new(Discoverer::new(
            s.store.clone(),
            s.lister.clone(),
            clones,
            s.clock.clone(),
            config.workspace.root.clone(),
            policy.initial(),
        ));
        handles.push((
            "discoverer",
            discoverer.spawn(config.intervals.discovery(), &self.shutdown),
        ));

        let changes = Arc::new(ChangeDiscoverer::new(
            s.store.clone(),
            s.git.clone(),
            scanner,
            s.metrics.clone(),
            s.clock.clone(),
            policy,
            config.limits.max_consecutive_failures,
        ));
        let (fetches, task) = changes.spawn(
            config.workers.fetch_workers,
            config.workers.queue_depth,
            config.intervals.fetch_tick(),
            locks.clone(),
            &self.shutdown,
        );
        handles.push(("change discoverer", task));

        let fetches: Arc<dyn FetchTrigger> = Arc::new(fetches);
        let push = Arc::new(PushProcessor::new(
            s.hints.clone(),
            s.store.clone(),
            fetches,
            s.metrics.clone(),
            config.limits.push_hint_max_retries,
        ));
        handles.push(("push processor", push.spawn(&self.shutdown)));

        let rescanner = Rescanner::new(
            s.store.clone(),
            s.git.clone(),
            s.sniffer.clone(),
            s.notifier.clone(),
            s.metrics.clone(),
            s.clock.clone(),
            locks.clone(),
        );
        let signal = self.shutdown.subscribe();
        handles.push((
            "rescanner",
            tokio::spawn(async move {
                match rescanner.needed() {
                    Ok(true) => {
                        if let Err(e) = rescanner.rescan_all(&signal).await {
                            log::error!("Rescan aborted: {}", e);
                        }
                    }
                    Ok(false) => log::debug!("Rules unchanged; no rescan needed"),
                    Err(e) => log::error!("Cannot tell whether a rescan is needed: {}", e),
                }
            }),
        ));

        let counter = Arc::new(HeadCounter::new(
            s.store.clone(),
            s.git.clone(),
            s.sniffer.clone(),
            s.metrics.clone(),
            locks,
        ));
        handles.push((
            "head counter",
            counter.spawn(config.intervals.head_count(), &self.shutdown),
        ));

        let stats = Arc::new(StatsReporter::new(s.store.clone(), s.metrics.clone()));
        handles.push(("stats", stats.spawn(config.intervals.stats(), &self.shutdown)));

        handles
    }
}
