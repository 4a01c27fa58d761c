//! Error types for tether-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;
use crate::util::truncate_utf8;

/// Result type alias using tether-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required identity could not be resolved from the cached session
    #[error("Missing session context: {0}")]
    MissingContext(String),

    /// The durable store rejected a write because it is out of space
    #[error("Storage quota exceeded: {0}")]
    StorageQuota(String),

    /// A background task the call depends on has stopped
    #[error("Sync engine is not running: {0}")]
    NotRunning(String),

    /// Remote backend failure
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        if is_disk_full(&error) {
            Self::StorageQuota(error.to_string())
        } else {
            Self::Sqlite(error)
        }
    }
}

fn is_disk_full(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::DiskFull
    )
}

impl Error {
    /// Classification of this error in the sync error taxonomy, if it has one.
    pub fn kind(&self) -> Option<OperationErrorKind> {
        match self {
            Self::MissingContext(_) => Some(OperationErrorKind::MissingContext),
            Self::StorageQuota(_) => Some(OperationErrorKind::StorageQuota),
            Self::Remote(remote) => Some(remote.kind()),
            _ => None,
        }
    }

    /// Specific, actionable message suitable for showing to a user.
    ///
    /// Transport details stay in logs; this never echoes a raw socket error.
    pub fn user_message(&self) -> String {
        match self.kind() {
            Some(kind) => kind.user_message().to_string(),
            None => match self {
                Self::InvalidInput(message) => format!("The change is not valid: {message}"),
                Self::NotFound(what) => format!("Could not find {what}."),
                Self::Config(message) => format!("Sync is misconfigured: {message}"),
                _ => "Something went wrong while saving locally. Please try again.".to_string(),
            },
        }
    }
}

/// Sync error taxonomy shared by operations and the queue snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    /// Identity not cached while offline. Fatal for that enqueue, never retried.
    MissingContext,
    /// Timeout or connection failure. Retried with backoff up to a cap.
    TransientNetwork,
    /// Backend rejected the payload. Not retried.
    PermanentValidation,
    /// Routed to the conflict pipeline rather than failing outright.
    ConflictDetected,
    /// Durable store write rejected. Nothing was queued.
    StorageQuota,
}

impl OperationErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingContext => "missing_context",
            Self::TransientNetwork => "transient_network",
            Self::PermanentValidation => "permanent_validation",
            Self::ConflictDetected => "conflict_detected",
            Self::StorageQuota => "storage_quota",
        }
    }

    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork)
    }

    pub const fn user_message(self) -> &'static str {
        match self {
            Self::MissingContext => {
                "You appear to be offline and your account details are not cached yet. Reconnect once so they can be saved, then try again."
            }
            Self::TransientNetwork => {
                "Could not reach the server. Your change is saved and will be sent automatically when the connection recovers."
            }
            Self::PermanentValidation => {
                "The server rejected this change. Review the highlighted values and save again."
            }
            Self::ConflictDetected => {
                "This item was changed elsewhere. Choose which version to keep."
            }
            Self::StorageQuota => {
                "Device storage is full, so the change was not saved. Free up space and try again."
            }
        }
    }
}

/// An error captured on an operation or on the queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: OperationErrorKind,
    pub message: String,
    /// Unix ms
    pub at: i64,
}

impl RecordedError {
    const MAX_MESSAGE_BYTES: usize = 512;

    pub fn new(kind: OperationErrorKind, message: impl Into<String>, at: i64) -> Self {
        let mut message = message.into();
        truncate_utf8(&mut message, Self::MAX_MESSAGE_BYTES);
        Self { kind, message, at }
    }

    /// Record `error`, falling back to `fallback` when it has no classification.
    pub fn from_error(error: &Error, fallback: OperationErrorKind, at: i64) -> Self {
        Self::new(error.kind().unwrap_or(fallback), error.to_string(), at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_maps_to_storage_quota() {
        let error = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            Some("database or disk is full".to_string()),
        );
        let error = Error::from(error);
        assert!(matches!(error, Error::StorageQuota(_)));
        assert_eq!(error.kind(), Some(OperationErrorKind::StorageQuota));
    }

    #[test]
    fn other_sqlite_errors_stay_sqlite() {
        let error = Error::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(error, Error::Sqlite(_)));
        assert_eq!(error.kind(), None);
    }

    #[test]
    fn user_message_never_echoes_transport_details() {
        let error = Error::Remote(RemoteError::Network(
            "tcp connect error: Connection refused (os error 111)".to_string(),
        ));
        let message = error.user_message();
        assert!(!message.contains("os error"));
        assert!(message.contains("saved"));
    }

    #[test]
    fn recorded_error_truncates_long_messages() {
        let long = "é".repeat(600);
        let recorded = RecordedError::new(OperationErrorKind::TransientNetwork, long, 1);
        assert!(recorded.message.len() <= 512);
        assert!(recorded.message.chars().all(|c| c == 'é'));
    }
}
