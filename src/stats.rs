//! Stats Reporter: periodic aggregate gauges

use crate::core::shutdown::ShutdownCoordinator;
use crate::metrics::{self, Emitter};
use crate::store::{RepositoryStore, StoreCounts, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct StatsReporter {
    store: Arc<dyn RepositoryStore>,
    metrics: Arc<dyn Emitter>,
}

impl StatsReporter {
    pub fn new(store: Arc<dyn RepositoryStore>, metrics: Arc<dyn Emitter>) -> Self {
        Self { store, metrics }
    }

    pub fn spawn(self: Arc<Self>, period: Duration, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
        let mut signal = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = signal.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.report() {
                            log::warn!("Cannot read stats: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn report(&self) -> StoreResult<StoreCounts> {
        let counts = self.store.counts()?;
        self.metrics.gauge(metrics::GAUGE_REPOSITORIES, counts.repositories);
        self.metrics.gauge(metrics::GAUGE_DISABLED, counts.disabled);
        self.metrics.gauge(metrics::GAUGE_FAILING, counts.failing);
        self.metrics.gauge(metrics::GAUGE_FETCHES, counts.fetches);
        self.metrics.gauge(metrics::GAUGE_CREDENTIALS, counts.credentials);
        self.metrics
            .gauge(metrics::GAUGE_HEAD_CREDENTIALS, counts.head_credentials);
        Ok(counts)
    }
}
