//! Error types for taskroot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using taskroot's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for taskroot operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The dataset's schema version cannot be bridged to this build's version.
    /// Fatal at startup, never retried.
    #[error("Schema version error: dataset is at version {found}, expected {expected}")]
    SchemaVersion { found: i64, expected: i64 },

    /// Storage operation failed (wraps sqlx::Error)
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// File or socket I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// RPC request carried a missing or wrong auth token
    #[error("Authentication failed")]
    AuthFailed,

    /// RPC frame declared a payload larger than the configured maximum
    #[error("Frame too large: {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// RPC request did not complete within the client timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// RPC connection was closed by the peer
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Error raised on the far side of an RPC connection
    #[error("Remote {kind} error: {message}")]
    Remote { kind: ErrorKind, message: String },

    /// A supervised component's process could not be started
    #[error("Failed to spawn component '{component}': {source}")]
    ProcessSpawn {
        component: String,
        #[source]
        source: std::io::Error,
    },

    /// A supervised component outlived its grace period and was killed
    #[error("Component '{component}' did not exit within {grace:?}")]
    ChildTerminationTimeout { component: String, grace: Duration },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire-stable discriminator for [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaVersion,
    Storage,
    Io,
    Serialization,
    Config,
    InvalidInput,
    NotFound,
    AuthFailed,
    FrameTooLarge,
    Timeout,
    ConnectionClosed,
    ProcessSpawn,
    ChildTerminationTimeout,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SchemaVersion => "schema_version",
            Self::Storage => "storage",
            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Config => "config",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::AuthFailed => "auth_failed",
            Self::FrameTooLarge => "frame_too_large",
            Self::Timeout => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::ProcessSpawn => "process_spawn",
            Self::ChildTerminationTimeout => "child_termination_timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Discriminator used when the error crosses an RPC boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SchemaVersion { .. } => ErrorKind::SchemaVersion,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AuthFailed => ErrorKind::AuthFailed,
            Error::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            Error::Remote { kind, .. } => *kind,
            Error::ProcessSpawn { .. } => ErrorKind::ProcessSpawn,
            Error::ChildTerminationTimeout { .. } => ErrorKind::ChildTerminationTimeout,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a consumer should treat this as "data temporarily unavailable"
    /// and try again later rather than give up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Storage | ErrorKind::Io | ErrorKind::Timeout | ErrorKind::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
