//! Cross-context sync messages

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    /// Background asks a foreground context to run the queue
    RequestQueueFlush,
    /// Foreground reports how the flush went
    QueueFlushResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Message plus the id that pairs a reply with its request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Uuid,
    /// Unix ms
    pub sent_at: i64,
    #[serde(flatten)]
    pub body: SyncMessage,
}

impl Envelope {
    pub fn flush_request(now: i64) -> Self {
        Self {
            correlation_id: Uuid::now_v7(),
            sent_at: now,
            body: SyncMessage::RequestQueueFlush,
        }
    }

    /// Result message answering this envelope
    pub fn reply(&self, success: bool, error: Option<String>, now: i64) -> Self {
        Self {
            correlation_id: self.correlation_id,
            sent_at: now,
            body: SyncMessage::QueueFlushResult { success, error },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
