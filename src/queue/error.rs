//! Queue Error Types

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (max size: {max_size})")]
    QueueFull { max_size: usize },

    #[error("Message {id} is not awaiting acknowledgement")]
    UnknownMessage { id: String },

    #[error("Queue is closed")]
    Closed,

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },
}

pub type QueueResult<T> = Result<T, QueueError>;
