//! Error types for evalbridge.
//!
//! Errors fall into two groups. Per-call errors (`DuplicateId`, `Timeout`,
//! `Cancelled`, `NoActiveSession`) are returned to a single `submit` caller
//! and never touch the session. Connection-level errors (`ReadFailure`,
//! `WriteFailure`, `SessionClosed`) end the session that produced them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for evalbridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Per-call errors
    #[error("Correlation id already pending: {id}")]
    DuplicateId { id: String },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Call cancelled by caller")]
    Cancelled,

    #[error("No active session")]
    NoActiveSession,

    // Connection-level errors
    #[error("Session closed")]
    SessionClosed,

    #[error("Connection read failed: {message}")]
    ReadFailure { message: String },

    #[error("Connection write failed: {message}")]
    WriteFailure { message: String },

    // Inbound data errors
    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File watcher error: {message}")]
    Watch {
        message: String,
        #[source]
        source: Option<notify::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for evalbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<notify::Error> for BridgeError {
    fn from(err: notify::Error) -> Self {
        BridgeError::Watch {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<glob::PatternError> for BridgeError {
    fn from(err: glob::PatternError) -> Self {
        BridgeError::Config {
            message: format!("invalid file pattern: {}", err),
        }
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error ends the session it was raised in.
    ///
    /// `MalformedEnvelope` is deliberately not fatal: the inbound loop logs
    /// and drops the frame while the transport itself is still healthy.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::SessionClosed
                | BridgeError::ReadFailure { .. }
                | BridgeError::WriteFailure { .. }
        )
    }

    /// Whether this error is scoped to a single call.
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            BridgeError::DuplicateId { .. }
                | BridgeError::Timeout(_)
                | BridgeError::Cancelled
                | BridgeError::NoActiveSession
        )
    }

    /// Map to the HTTP status code the eval endpoint answers with.
    ///
    /// - 503: nobody is connected to evaluate the code
    /// - 504: the peer did not answer in time
    /// - 500: everything else
    pub fn http_status_code(&self) -> u16 {
        match self {
            BridgeError::NoActiveSession => 503,
            BridgeError::Timeout(_) | BridgeError::Cancelled => 504,
            _ => 500,
        }
    }
}
