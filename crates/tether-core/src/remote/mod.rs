//! Remote backend seam.
//!
//! The engine talks to the authoritative backend only through
//! [`RemoteBackend`]. Field maps crossing this boundary use the backend's
//! column names; callers translate with [`crate::config::EntitySchema`].

mod http;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EntitySchema;
use crate::error::OperationErrorKind;
use crate::models::{CachedEntity, EntityId, EntityKind, Fields, Identity};

pub use http::HttpBackend;
pub use memory::{Fault, InMemoryBackend, RemoteCall};

/// Failure talking to the backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The backend refused the payload; retrying will not help
    #[error("Rejected by server: {message} ({status})")]
    Rejected { status: u16, message: String },
    /// The row moved past the version the request was made against
    #[error("Version conflict (server at {server_version:?})")]
    Conflict { server_version: Option<i64> },
    #[error("Not found")]
    NotFound,
    /// Credentials missing or expired; retried once the session refreshes
    #[error("Unauthorized ({0})")]
    Unauthorized(u16),
    #[error("Server error: {message} ({status})")]
    Server { status: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub const fn kind(&self) -> OperationErrorKind {
        match self {
            Self::Network(_)
            | Self::Timeout(_)
            | Self::Unauthorized(_)
            | Self::Server { .. }
            | Self::InvalidResponse(_) => OperationErrorKind::TransientNetwork,
            Self::Rejected { .. } | Self::NotFound => OperationErrorKind::PermanentValidation,
            Self::Conflict { .. } => OperationErrorKind::ConflictDetected,
        }
    }

    pub const fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Authoritative copy of a row as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EntityId,
    pub scope_id: String,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    pub fields: Fields,
    pub version: i64,
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Unix ms
    pub updated_at: i64,
}

impl RemoteRecord {
    /// Rename backend columns to local field names
    #[must_use]
    pub fn localized(mut self, schema: &EntitySchema) -> Self {
        self.fields = schema.from_remote(&self.fields);
        self
    }

    /// Cache entry for this record, confirmed at `now`
    pub fn into_cached(self, kind: &EntityKind, now: i64) -> CachedEntity {
        CachedEntity {
            id: self.id,
            kind: kind.clone(),
            scope_id: self.scope_id,
            parent_id: self.parent_id,
            fields: self.fields,
            version: self.version,
            updated_by: self.updated_by,
            updated_at: self.updated_at,
            last_synced_at: Some(now),
            is_deleted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Replays with the same key return the originally created row
    #[serde(skip)]
    pub idempotency_key: String,
    pub scope_id: String,
    pub parent_id: Option<EntityId>,
    pub fields: Fields,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub fields: Fields,
    /// Expected current version; `None` writes unconditionally
    pub version: Option<i64>,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub version: Option<i64>,
    pub updated_by: String,
}

/// Operations the engine needs from the authoritative backend
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn create(&self, kind: &EntityKind, request: CreateRequest) -> Result<RemoteRecord, RemoteError>;

    /// `Ok(None)` when the row does not exist (or was deleted)
    async fn fetch(&self, kind: &EntityKind, id: &EntityId) -> Result<Option<RemoteRecord>, RemoteError>;

    async fn update(
        &self,
        kind: &EntityKind,
        id: &EntityId,
        request: UpdateRequest,
    ) -> Result<RemoteRecord, RemoteError>;

    async fn delete(&self, kind: &EntityKind, id: &EntityId, request: DeleteRequest) -> Result<(), RemoteError>;

    /// Identity of the signed-in session
    async fn current_identity(&self) -> Result<Identity, RemoteError>;
}
