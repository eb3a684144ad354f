//! Push-hint bus
//!
//! External "repository changed" notifications arrive through a
//! [`HintSource`]. Delivery is at-least-once: a consumer acknowledges,
//! returns or dead-letters every message it receives.
//!
//! [`MemoryHintQueue`] is the in-process implementation used when hints are
//! produced inside the same process (and in tests).

pub mod error;
pub mod memory;
pub mod message;
pub mod traits;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryHintQueue;
pub use message::{Message, MessageHeader, PushHint};
pub use traits::HintSource;
