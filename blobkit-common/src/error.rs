//! Error taxonomy shared by every backend.
//!
//! Callers decide what to do with a failure by looking at [`Error::kind`]:
//! only [`ErrorKind::Transient`] is worth retrying, everything else is
//! terminal for the operation that produced it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::blob::BlobId;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Authentication,
    InvalidConfiguration,
    InvalidRequest,
    InvalidRange,
    Transient,
    Cancelled,
    Closed,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Authentication => "authentication failure",
            ErrorKind::InvalidConfiguration => "invalid configuration",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::InvalidRange => "invalid range",
            ErrorKind::Transient => "transient",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Closed => "closed",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Main error type for blob backends.
#[derive(Error, Debug)]
pub enum Error {
    /// The blob does not exist under the configured prefix
    #[error("Blob not found: {0}")]
    NotFound(BlobId),

    /// Credentials were rejected or lack the required capability
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The backend cannot be addressed as configured (unknown bucket, bad path, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The service rejected the request as malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A read asked for bytes outside the blob
    #[error("Invalid range for blob {id}: offset {offset}, length {length:?}, blob size {size}")]
    InvalidRange {
        id: BlobId,
        offset: u64,
        length: Option<u64>,
        size: u64,
    },

    /// Network failure, timeout, rate limiting or a 5xx-class service error
    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The operation context was cancelled or its deadline passed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The backend was used after `close`
    #[error("Backend is closed")]
    Closed,

    /// Anything that does not fit the categories above
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::InvalidRange { .. } => ErrorKind::InvalidRange,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Closed => ErrorKind::Closed,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Server-suggested minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a local I/O failure.
    ///
    /// `context` names what was being done; it ends up in the message.
    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind as Io;

        let message = format!("{}: {}", context, err);
        match err.kind() {
            Io::PermissionDenied => Error::Authentication(message),
            Io::TimedOut | Io::Interrupted | Io::WouldBlock => Error::transient(message),
            Io::InvalidInput | Io::InvalidData => Error::InvalidRequest(message),
            _ => Error::Unknown(message),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Unknown(format!("Serialization error: {}", err))
    }
}
