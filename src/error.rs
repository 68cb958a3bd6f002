//! Error types for agentloop
//!
//! Centralized error handling using thiserror. Only store failures are fatal;
//! malformed worker output and quality signals degrade to defaults elsewhere
//! and never surface here.

use thiserror::Error;

/// All error types that can occur in agentloop
#[derive(Debug, Error)]
pub enum LoopError {
    /// Read of a project id the store has never seen
    #[error("Project not found: {0}")]
    NotFound(String),

    /// Persistence layer failed; aborts the current operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Static configuration is inconsistent
    #[error("Config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LoopError {
    fn from(err: std::io::Error) -> Self {
        LoopError::StoreUnavailable(format!("io: {}", err))
    }
}

impl From<serde_json::Error> for LoopError {
    fn from(err: serde_json::Error) -> Self {
        LoopError::StoreUnavailable(format!("json: {}", err))
    }
}

impl From<rusqlite::Error> for LoopError {
    fn from(err: rusqlite::Error) -> Self {
        LoopError::StoreUnavailable(format!("sqlite: {}", err))
    }
}

impl LoopError {
    /// Whether this error must abort a tick outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoopError::StoreUnavailable(_))
    }
}

/// Result type alias for agentloop operations
pub type Result<T> = std::result::Result<T, LoopError>;
