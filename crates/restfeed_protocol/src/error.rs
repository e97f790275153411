//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON or did not match the expected shape.
    #[error("malformed change record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A non-deleted change arrived without a `data` object.
    #[error("change #{revision} for '{key}' carries no data")]
    MissingData {
        /// Revision of the offending record.
        revision: u64,
        /// Key of the offending record.
        key: String,
    },

    /// A URL could not be parsed or extended.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// I/O error while reading a stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_display() {
        let err = ProtocolError::MissingData {
            revision: 7,
            key: "abc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("#7"));
        assert!(msg.contains("abc"));
    }
}
