//! Cached session identity

use serde::{Deserialize, Serialize};

/// Account and user a mutation is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub account_id: String,
    pub user_id: String,
}

impl Identity {
    pub fn new(account_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Identity persisted locally so offline enqueues never need the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub account_id: String,
    pub user_id: String,
    /// Unix ms
    pub cached_at: i64,
}

impl SessionContext {
    pub fn identity(&self) -> Identity {
        Identity::new(self.account_id.clone(), self.user_id.clone())
    }
}
