//! Push Event Processor
//!
//! Turns "repository changed" hints from the bus into fetch requests.
//! Every delivery bumps a persisted retry counter keyed by message id; a
//! message that still cannot be handled after the configured number of
//! deliveries is dead-lettered.

use crate::changes::{FetchReason, FetchTrigger};
use crate::core::shutdown::ShutdownCoordinator;
use crate::metrics::{self, Emitter};
use crate::pool::RequestStatus;
use crate::queue::{HintSource, Message, PushHint, QueueResult};
use crate::store::{RepoId, RepositoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Requested(RepoId),
    /// Not in the store yet; discovery will pick it up
    Unknown,
    Retried { attempts: u32 },
    DeadLettered { reason: String },
}

pub struct PushProcessor {
    source: Arc<dyn HintSource>,
    store: Arc<dyn RepositoryStore>,
    fetches: Arc<dyn FetchTrigger>,
    metrics: Arc<dyn Emitter>,
    max_retries: u32,
}

impl PushProcessor {
    pub fn new(
        source: Arc<dyn HintSource>,
        store: Arc<dyn RepositoryStore>,
        fetches: Arc<dyn FetchTrigger>,
        metrics: Arc<dyn Emitter>,
        max_retries: u32,
    ) -> Self {
        Self {
            source,
            store,
            fetches,
            metrics,
            max_retries: max_retries.max(1),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
        let mut signal = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = signal.recv() => break,
                    received = self.source.receive() => received,
                };
                let result = match message {
                    Ok(message) => self.process(message).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    log::error!("Push hint consumer error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            log::info!("Push event processor stopped");
        })
    }

    /// Handle one delivery; the message is always acked, retried or
    /// dead-lettered before this returns `Ok`
    pub async fn process(&self, message: Message) -> QueueResult<PushOutcome> {
        let id = message.id();
        let attempts = match self.store.bump_message_retry(&id) {
            Ok(attempts) => attempts,
            Err(e) => {
                log::error!("Cannot track retries of message {}: {}", id, e);
                message.header.deliveries
            }
        };

        let failure = match PushHint::parse(&message.data) {
            Err(e) => format!("unparseable push hint: {}", e),
            Ok(hint) => match self.store.find_repository(&hint.owner, &hint.name) {
                Ok(Some(repo)) => match self.fetches.request(repo.id, FetchReason::PushHint) {
                    RequestStatus::Queued | RequestStatus::Coalesced => {
                        log::debug!("Push hint for {} queued a fetch", repo.full_name());
                        self.finish(&message).await?;
                        return Ok(PushOutcome::Requested(repo.id));
                    }
                    RequestStatus::Rejected(reason) => {
                        format!("fetch of {} not queued: {}", repo.full_name(), reason)
                    }
                },
                Ok(None) => {
                    log::info!(
                        "Push hint for unknown repository {}/{}",
                        hint.owner,
                        hint.name
                    );
                    self.finish(&message).await?;
                    return Ok(PushOutcome::Unknown);
                }
                Err(e) => format!("store lookup failed: {}", e),
            },
        };

        if attempts >= self.max_retries {
            self.metrics.counter(metrics::PUSH_DEAD_LETTERED, 1);
            self.source.dead_letter(message, &failure).await?;
            self.clear(&id);
            return Ok(PushOutcome::DeadLettered { reason: failure });
        }
        log::warn!(
            "Message {} failed (attempt {}/{}): {}",
            id,
            attempts,
            self.max_retries,
            failure
        );
        self.source.retry(message).await?;
        Ok(PushOutcome::Retried { attempts })
    }

    async fn finish(&self, message: &Message) -> QueueResult<()> {
        self.source.ack(message).await?;
        self.clear(&message.id());
        Ok(())
    }

    fn clear(&self, id: &str) {
        if let Err(e) = self.store.clear_message_retry(id) {
            log::warn!("Cannot clear retry counter of message {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::metrics::MemoryEmitter;
    use crate::queue::MemoryHintQueue;
    use crate::store::{NewRepository, SqliteStore};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records requests; rejects them while `reject` is set
    #[derive(Default)]
    struct RecordingTrigger {
        requests: Mutex<Vec<(RepoId, FetchReason)>>,
        reject: bool,
    }

    impl FetchTrigger for RecordingTrigger {
        fn request(&self, repository_id: RepoId, reason: FetchReason) -> RequestStatus {
            if self.reject {
                return RequestStatus::Rejected("queue full".to_string());
            }
            self.requests.lock().unwrap().push((repository_id, reason));
            RequestStatus::Queued
        }
    }

    struct Fixture {
        queue: Arc<MemoryHintQueue>,
        store: Arc<SqliteStore>,
        trigger: Arc<RecordingTrigger>,
        metrics: Arc<MemoryEmitter>,
        processor: PushProcessor,
    }

    fn fixture(trigger: RecordingTrigger) -> Fixture {
        let queue = Arc::new(MemoryHintQueue::new(16, Arc::new(ManualClock::new())));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let trigger = Arc::new(trigger);
        let metrics = Arc::new(MemoryEmitter::new());
        let processor = PushProcessor::new(
            queue.clone(),
            store.clone(),
            trigger.clone(),
            metrics.clone(),
            3,
        );
        Fixture {
            queue,
            store,
            trigger,
            metrics,
            processor,
        }
    }

    fn widgets(store: &SqliteStore) -> RepoId {
        let (repo, _) = store
            .insert_repository(
                &NewRepository {
                    owner: "acme".to_string(),
                    name: "widgets".to_string(),
                    path: PathBuf::from("/work/acme/widgets"),
                    ssh_url: "git@github.com:acme/widgets.git".to_string(),
                    private: false,
                    default_branch: "main".to_string(),
                    fetch_interval_secs: 300,
                },
                Utc::now(),
            )
            .unwrap();
        repo.id
    }

    fn hint() -> String {
        PushHint {
            owner: "acme".to_string(),
            name: "widgets".to_string(),
        }
        .to_json()
    }

    #[tokio::test]
    async fn test_hint_for_known_repository_requests_fetch() {
        let f = fixture(RecordingTrigger::default());
        let id = widgets(&f.store);
        f.queue.publish(hint()).unwrap();

        let message = f.queue.receive().await.unwrap();
        let message_id = message.id();
        let outcome = f.processor.process(message).await.unwrap();

        assert_eq!(outcome, PushOutcome::Requested(id));
        assert_eq!(
            *f.trigger.requests.lock().unwrap(),
            vec![(id, FetchReason::PushHint)]
        );
        assert_eq!(f.queue.unacked_len(), 0);
        assert_eq!(f.queue.pending_len(), 0);
        // Counter was cleared, so the next bump starts over
        assert_eq!(f.store.bump_message_retry(&message_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_repository_is_acked() {
        let f = fixture(RecordingTrigger::default());
        f.queue.publish(hint()).unwrap();

        let message = f.queue.receive().await.unwrap();
        assert_eq!(f.processor.process(message).await.unwrap(), PushOutcome::Unknown);
        assert_eq!(f.queue.unacked_len(), 0);
        assert!(f.trigger.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_hint_is_dead_lettered_after_bounded_retries() {
        let f = fixture(RecordingTrigger::default());
        f.queue.publish("{not json").unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let message = f.queue.receive().await.unwrap();
            outcomes.push(f.processor.process(message).await.unwrap());
        }

        assert_eq!(outcomes[0], PushOutcome::Retried { attempts: 1 });
        assert_eq!(outcomes[1], PushOutcome::Retried { attempts: 2 });
        assert!(matches!(outcomes[2], PushOutcome::DeadLettered { .. }));
        let dead = f.queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("unparseable"));
        assert_eq!(f.queue.pending_len(), 0);
        assert_eq!(f.metrics.counter_value(metrics::PUSH_DEAD_LETTERED), 1);
    }

    #[tokio::test]
    async fn test_rejected_fetch_is_retried() {
        let f = fixture(RecordingTrigger {
            reject: true,
            ..RecordingTrigger::default()
        });
        widgets(&f.store);
        f.queue.publish(hint()).unwrap();

        let message = f.queue.receive().await.unwrap();
        let outcome = f.processor.process(message).await.unwrap();

        assert_eq!(outcome, PushOutcome::Retried { attempts: 1 });
        assert_eq!(f.queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_restarted_queue_starts_with_fresh_retry_counts() {
        let f = fixture(RecordingTrigger {
            reject: true,
            ..RecordingTrigger::default()
        });
        widgets(&f.store);
        f.queue.publish(hint()).unwrap();
        let message = f.queue.receive().await.unwrap();
        assert_eq!(
            f.processor.process(message).await.unwrap(),
            PushOutcome::Retried { attempts: 1 }
        );

        // Same database, new queue: the leftover counter must not apply
        let restarted = Arc::new(MemoryHintQueue::new(16, Arc::new(ManualClock::new())));
        let processor = PushProcessor::new(
            restarted.clone(),
            f.store.clone(),
            f.trigger.clone(),
            f.metrics.clone(),
            3,
        );
        restarted.publish(hint()).unwrap();
        let message = restarted.receive().await.unwrap();
        assert_eq!(
            processor.process(message).await.unwrap(),
            PushOutcome::Retried { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_consumer_loop_drains_until_shutdown() {
        let f = fixture(RecordingTrigger::default());
        let id = widgets(&f.store);
        let shutdown = ShutdownCoordinator::new();
        let Fixture {
            queue,
            trigger,
            processor,
            ..
        } = f;
        let task = Arc::new(processor).spawn(&shutdown);

        queue.publish(hint()).unwrap();
        queue.publish(hint()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while trigger.requests.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.trigger_shutdown();
        task.await.unwrap();
        assert_eq!(trigger.requests.lock().unwrap()[0].0, id);
    }
}
