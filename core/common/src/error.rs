//! Common error types for harborsync.

use thiserror::Error;

/// How the sync engine must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network unreachable, timeout, 5xx. Retried with backoff.
    Transient,
    /// The backend reports a version mismatch.
    Conflict,
    /// Rejected by the backend (4xx). Never retried.
    Permanent,
    /// Local storage is corrupt or unavailable.
    Fatal,
}

/// Top-level error type for harborsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// Request to the backend timed out.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Backend answered with a server-side failure (5xx).
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Backend refused the request (4xx other than a version conflict).
    #[error("Rejected with {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Resource changed on the backend since the revision the client knew.
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Local storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Operation requires connectivity.
    #[error("Offline: {0}")]
    Offline(String),

    /// Local storage is degraded to read-only mode.
    #[error("Storage is read-only: {0}")]
    ReadOnly(String),

    /// Another sync pass already holds the sync flag.
    #[error("A sync pass is already in progress")]
    SyncInProgress,
}

impl Error {
    /// Classify this error for retry and escalation decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_)
            | Error::Timeout(_)
            | Error::Server { .. }
            | Error::Offline(_)
            | Error::SyncInProgress => ErrorClass::Transient,
            Error::VersionConflict(_) => ErrorClass::Conflict,
            Error::Storage(_) | Error::Io(_) => ErrorClass::Fatal,
            Error::Rejected { .. }
            | Error::Serialization(_)
            | Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::NotPermitted(_)
            | Error::ReadOnly(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map an HTTP status code from the backend to an error.
    ///
    /// `409` and `412` are version conflicts, other 4xx are permanent, 5xx are
    /// transient. Returns `None` for success codes.
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match status {
            200..=399 => None,
            409 | 412 => Some(Error::VersionConflict(message)),
            408 | 429 => Some(Error::Server { status, message }),
            400..=499 => Some(Error::Rejected { status, message }),
            _ => Some(Error::Server { status, message }),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
