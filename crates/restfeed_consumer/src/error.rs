//! Error types for the feed consumer.

use restfeed_protocol::{ProtocolError, Revision};
use thiserror::Error;

/// Result type for consumer operations.
pub type ConsumeResult<T> = Result<T, ConsumeError>;

/// Errors that can occur while following a change feed.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with something other than 200.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The feed body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A change carried data that does not fit the applier's record type.
    #[error("cannot materialize '{key}' at revision {revision}: {source}")]
    Materialize {
        /// Object key.
        key: String,
        /// Revision of the change.
        revision: Revision,
        /// Deserialization failure.
        source: serde_json::Error,
    },

    /// The applier rejected a change.
    #[error("failed to apply '{key}': {message}")]
    Apply {
        /// Object key.
        key: String,
        /// Message reported by the applier.
        message: String,
    },

    /// The checkpoint store failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// The collection is already being followed or fetched.
    #[error("collection {0} is already being followed")]
    AlreadyFollowing(String),

    /// The operation is not allowed while a listener is active.
    #[error("collection {0} has an active listener")]
    ActiveListener(String),

    /// The listener was stopped.
    #[error("listener cancelled")]
    Cancelled,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsumeError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an apply error for `key`.
    pub fn apply(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Apply {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error is transient infrastructure trouble.
    ///
    /// The listener retries every failure regardless; this classifies
    /// errors for callers of one-shot fetches.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumeError::Transport { retryable, .. } => *retryable,
            ConsumeError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ConsumeError::Protocol(ProtocolError::Io(_)) | ConsumeError::Io(_) => true,
            _ => false,
        }
    }
}
