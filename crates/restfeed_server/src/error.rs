//! Error types for the publishing server.

use http::StatusCode;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a published collection.
///
/// Every variant maps to one HTTP status through [`ServerError::status`].
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request or a key collision outside the visible scope.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The object exists but is outside the caller's visible scope, or the
    /// caller lacks the service's role.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// No such object or endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is disabled for this service.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The caller's version tag does not match the current one.
    #[error("update conflict detected, expected change based on version '{current}', but found '{supplied}'")]
    Conflict {
        /// Tag of the current representation.
        current: String,
        /// Tag supplied by the caller.
        supplied: String,
    },

    /// A service definition or callback is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The source collection or object state store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A callback rejected its input.
    #[error("callback '{callback}' failed: {message}")]
    Callback {
        /// Callback identifier.
        callback: String,
        /// Message reported by the callback.
        message: String,
    },

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] restfeed_protocol::ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns the HTTP status reported for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) | ServerError::Callback { .. } => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::Conflict { .. } => StatusCode::CONFLICT,
            ServerError::Configuration(_)
            | ServerError::Storage(_)
            | ServerError::Json(_)
            | ServerError::Protocol(_)
            | ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::BadRequest("bad".into()).is_client_error());
        assert!(ServerError::Storage("disk".into()).is_server_error());
        assert!(!ServerError::NotFound("k".into()).is_server_error());
        assert_eq!(
            ServerError::MethodNotAllowed("create".into()).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            ServerError::Unauthorized("k".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn conflict_names_both_tags() {
        let err = ServerError::Conflict {
            current: "abc".into(),
            supplied: "def".into(),
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("def"));
    }
}
