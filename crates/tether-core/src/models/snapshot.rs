//! Observable status snapshots

use serde::{Deserialize, Serialize};

use crate::error::RecordedError;

/// Connectivity as seen by the network monitor. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkStatusSnapshot {
    pub is_online: bool,
    /// The last successful probe exceeded the slow threshold
    pub is_slow_connection: bool,
    /// Unix ms of the last probe that succeeded
    pub last_online_at: Option<i64>,
    /// A re-check is running after the monitor was offline
    pub is_retrying: bool,
}

/// Read-only view of the operation queue
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Pending operations
    pub length: usize,
    pub last_enqueue_at: Option<i64>,
    pub last_enqueue_error: Option<RecordedError>,
    pub background_sync_available: bool,
    pub is_processing: bool,
    /// Dead-letter records awaiting acknowledgement
    pub failed_count: usize,
    /// Earliest scheduled retry (Unix ms)
    pub next_retry_at: Option<i64>,
}

impl QueueSnapshot {
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}
