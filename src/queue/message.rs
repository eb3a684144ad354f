//! Push-hint messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata assigned by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Unique across queue instances and process restarts
    pub id: String,
    /// Monotonic within one queue instance
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    /// How many times the message has been handed to a consumer
    pub deliveries: u32,
}

/// A message with an opaque payload as delivered by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub data: String,
}

impl Message {
    /// Stable id used for retry bookkeeping
    pub fn id(&self) -> String {
        self.header.id.clone()
    }
}

/// "This repository changed" payload: `{"owner": "acme", "name": "widgets"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushHint {
    pub owner: String,
    pub name: String,
}

impl PushHint {
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        let hint: PushHint = serde_json::from_str(data)?;
        Ok(hint)
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "owner": self.owner, "name": self.name }).to_string()
    }
}
