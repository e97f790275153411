//! Version tags and key validation.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes the version tag of a serialized representation.
///
/// The tag is the lowercase hex SHA-256 of the exact bytes served, so two
/// representations share a tag only if they are byte-identical.
pub fn compute_etag(json: &str) -> String {
    hex::encode(Sha256::digest(json.as_bytes()))
}

/// Returns true if `key` can be used as the last segment of an object URL.
///
/// Keys must be non-blank, at most 255 bytes, and free of path, query, and
/// control characters.
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
        && key.len() <= 255
        && !key
            .chars()
            .any(|c| c == '/' || c == '?' || c == '#' || c.is_control())
}

/// Extracts a key from an attribute value.
///
/// Strings are used verbatim, numbers and booleans in their JSON text form.
/// Null, arrays and objects have no key.
pub fn key_from_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
