//! Push-hint bus contract

use super::error::QueueResult;
use super::message::Message;
use async_trait::async_trait;

/// At-least-once source of push hints.
///
/// Every received message must end in exactly one of `ack`, `retry` or
/// `dead_letter`.
#[async_trait]
pub trait HintSource: Send + Sync {
    /// Wait for the next message
    async fn receive(&self) -> QueueResult<Message>;

    async fn ack(&self, message: &Message) -> QueueResult<()>;

    /// Return the message for another delivery
    async fn retry(&self, message: Message) -> QueueResult<()>;

    /// Remove the message from circulation
    async fn dead_letter(&self, message: Message, reason: &str) -> QueueResult<()>;
}
