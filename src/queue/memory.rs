//! In-process hint queue
//!
//! Sequence-numbered FIFO with an unacknowledged set and a dead-letter list.
//! Consumers block on a `Notify` until a message is published or returned.
//!
//! Message ids carry a per-instance tag (process id, creation time, instance
//! counter) so retry counters persisted under one queue never match messages
//! of another.

use super::error::{QueueError, QueueResult};
use super::message::{Message, MessageHeader};
use super::traits::HintSource;
use crate::core::sync::handle_mutex_poison;
use crate::core::time::TimeProvider;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

static INSTANCES: AtomicU64 = AtomicU64::new(0);

fn instance_tag(clock: &dyn TimeProvider) -> String {
    format!(
        "{}-{:x}-{}",
        std::process::id(),
        clock.now().timestamp_millis(),
        INSTANCES.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Debug, Default)]
struct State {
    next_sequence: u64,
    pending: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    dead: Vec<(Message, String)>,
}

pub struct MemoryHintQueue {
    instance: String,
    state: Mutex<State>,
    available: Notify,
    max_size: usize,
    clock: Arc<dyn TimeProvider>,
}

impl MemoryHintQueue {
    pub fn new(max_size: usize, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            instance: instance_tag(clock.as_ref()),
            state: Mutex::new(State {
                next_sequence: 1,
                ..State::default()
            }),
            available: Notify::new(),
            max_size: max_size.max(1),
            clock,
        }
    }

    fn state(&self) -> QueueResult<MutexGuard<'_, State>> {
        handle_mutex_poison(self.state.lock(), |message| QueueError::OperationFailed {
            message,
        })
    }

    /// Publish a payload; returns its sequence number
    pub fn publish(&self, data: impl Into<String>) -> QueueResult<u64> {
        let sequence = {
            let mut state = self.state()?;
            if state.pending.len() >= self.max_size {
                return Err(QueueError::QueueFull {
                    max_size: self.max_size,
                });
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.pending.push_back(Message {
                header: MessageHeader {
                    id: format!("{}-{}", self.instance, sequence),
                    sequence,
                    published_at: self.clock.now(),
                    deliveries: 0,
                },
                data: data.into(),
            });
            sequence
        };
        self.available.notify_one();
        Ok(sequence)
    }

    pub fn pending_len(&self) -> usize {
        self.state().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn unacked_len(&self) -> usize {
        self.state().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Dead-lettered messages with their reasons
    pub fn dead_letters(&self) -> Vec<(Message, String)> {
        self.state().map(|s| s.dead.clone()).unwrap_or_default()
    }

    fn take_unacked(&self, message: &Message) -> QueueResult<Message> {
        self.state()?
            .unacked
            .remove(&message.header.sequence)
            .ok_or_else(|| QueueError::UnknownMessage { id: message.id() })
    }
}

#[async_trait]
impl HintSource for MemoryHintQueue {
    async fn receive(&self) -> QueueResult<Message> {
        loop {
            {
                let mut state = self.state()?;
                if let Some(mut message) = state.pending.pop_front() {
                    message.header.deliveries += 1;
                    state
                        .unacked
                        .insert(message.header.sequence, message.clone());
                    if !state.pending.is_empty() {
                        self.available.notify_one();
                    }
                    return Ok(message);
                }
            }
            self.available.notified().await;
        }
    }

    async fn ack(&self, message: &Message) -> QueueResult<()> {
        self.take_unacked(message)?;
        Ok(())
    }

    async fn retry(&self, message: Message) -> QueueResult<()> {
        let stored = self.take_unacked(&message)?;
        self.state()?.pending.push_back(stored);
        self.available.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, message: Message, reason: &str) -> QueueResult<()> {
        let stored = self.take_unacked(&message)?;
        log::warn!(
            "Dead-lettering message {} after {} deliveries: {}",
            stored.id(),
            stored.header.deliveries,
            reason
        );
        self.state()?.dead.push((stored, reason.to_string()));
        Ok(())
    }
}
