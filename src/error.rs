//! Error types for the table cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for table cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Highest error code that belongs to the RPC framework rather than to the
/// storage backend itself. Backend answers carrying a code at or below this
/// value are treated as transport failures and retried once.
pub const MAX_FRAMEWORK_ERROR_CODE: i64 = 29_999;

/// Main error type for the table cache.
#[derive(Error, Debug)]
pub enum Error {
    /// The metadata service does not know the table, or it is misconfigured.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The request is malformed or touches columns it may not touch.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The storage backend could not be reached, even after a retry.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The storage backend answered with its own error.
    #[error("backend error {code} from {raiser}: {message}")]
    BackendReported {
        code: i64,
        message: String,
        raiser: String,
    },

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Error returned by a remote cache node.
    #[error("remote error: {0}")]
    Remote(RemoteError),
}

/// Failure of a single call against the storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The call could not be dispatched or the connection failed.
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    /// No answer arrived before the call timeout.
    #[error("backend call timed out")]
    Timeout,

    /// The backend answered with an error of its own.
    #[error("backend error {code} from {raiser}: {message}")]
    Reported {
        code: i64,
        message: String,
        raiser: String,
    },
}

impl BackendError {
    /// Whether the failure is worth a single retry.
    ///
    /// Application errors raised by the backend are deterministic and are
    /// forwarded to the caller as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_) | BackendError::Timeout => true,
            BackendError::Reported { code, .. } => *code <= MAX_FRAMEWORK_ERROR_CODE,
        }
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Reported {
                code,
                message,
                raiser,
            } => Error::BackendReported {
                code,
                message,
                raiser,
            },
            BackendError::Timeout => Error::BackendUnavailable("backend call timed out".to_string()),
            BackendError::Unavailable(reason) => Error::BackendUnavailable(reason),
        }
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Category of an error carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    TableNotFound,
    InvalidRequest,
    BackendUnavailable,
    BackendReported,
    Internal,
}

/// Serializable form of [`Error`] sent back to RPC callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub code: i64,
    pub raiser: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}) from {}: {}", self.kind, self.code, self.raiser, self.message)
    }
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        let local = |kind| RemoteError {
            kind,
            message: e.to_string(),
            code: 0,
            raiser: "tablecache".to_string(),
        };

        match e {
            Error::TableNotFound(_) => local(RemoteErrorKind::TableNotFound),
            Error::InvalidRequest(_) => local(RemoteErrorKind::InvalidRequest),
            Error::BackendUnavailable(_) => local(RemoteErrorKind::BackendUnavailable),
            Error::BackendReported {
                code,
                message,
                raiser,
            } => RemoteError {
                kind: RemoteErrorKind::BackendReported,
                message: message.clone(),
                code: *code,
                raiser: raiser.clone(),
            },
            Error::Remote(remote) => remote.clone(),
            _ => local(RemoteErrorKind::Internal),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Remote(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
