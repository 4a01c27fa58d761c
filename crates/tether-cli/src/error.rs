use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tether_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid JSON object for --{flag}: {message}")]
    InvalidFields { flag: &'static str, message: String },
    #[error("Operation ID is not valid: {0}")]
    InvalidOperationId(String),
    #[error("No pending operation with id {0}")]
    OperationNotFound(String),
    #[error("No failed operation with id {0}")]
    FailedOperationNotFound(String),
    #[error("{0}")]
    MissingArgument(&'static str),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set remote.base_url in the config file, pass --base-url, or set TETHER_BASE_URL."
    )]
    SyncNotConfigured,
}

impl CliError {
    /// Message shown to the user; core errors use their friendly form
    pub fn display_message(&self) -> String {
        match self {
            Self::Core(error) => error.user_message(),
            other => other.to_string(),
        }
    }
}
