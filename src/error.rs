//! Unified error type for the sync core
//!
//! Every component reports failures through [`SyncError`]. The variants map
//! onto how the protocol engine reacts to them:
//! - `Configuration` / `UnhandledEvent`: design defects, fatal
//! - `TransientNetwork`: retried under comm-health backoff
//! - `AuthenticationRequired`: engine waits for the owner to supply credentials
//! - `HardProtocol`: engine stops and notifies the owner
//! - `Cancelled`: not a failure, reported separately

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unhandled event: {0}")]
    UnhandledEvent(String),

    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Hard protocol failure: {0}")]
    HardProtocol(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    #[error("Pending operation {0} is already dispatched")]
    AlreadyDispatched(i64),

    #[error("Target {0} already has a dispatched operation")]
    TargetBusy(String),

    #[error("Invalid pending state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl SyncError {
    /// True for failures that should be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(err: r2d2::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // Timeouts and connection drops are worth retrying; a malformed
        // request is not going to fix itself.
        if err.is_builder() {
            SyncError::HardProtocol(err.to_string())
        } else {
            SyncError::TransientNetwork(err.to_string())
        }
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
