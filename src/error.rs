//! WolfKeeper Error Types

use thiserror::Error;

/// Result type alias for WolfKeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfKeeper error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination errors
    #[error("Coordination unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Session {0:#x} expired")]
    SessionExpired(u64),

    /// A node seen in a listing was gone by the follow-up read.
    /// Absorbed by the election and registry loops, never returned to callers.
    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Node not found: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion { path: String, expected: u32, actual: u32 },

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // Election errors
    #[error("Election not started: self_nominate must run first")]
    NotNominated,

    #[error("Already nominated as {0}")]
    AlreadyNominated(String),

    // Network errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::StaleReference(_)
        )
    }

    /// Check if this error means the coordinator session is gone.
    ///
    /// Every ephemeral node of the session has been (or will be) removed,
    /// so the process has to reconnect, re-nominate and re-register.
    pub fn ends_epoch(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_)
                | Error::SessionExpired(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }
}
