//! Request parameter names and URL helpers for the change endpoints.

use crate::change::Revision;
use crate::error::{ProtocolError, ProtocolResult};
use url::Url;

/// Query parameter selecting full objects instead of URLs in listings.
pub const PARAM_DATA: &str = "data";
/// Query parameter carrying the last revision a client has seen.
pub const PARAM_SINCE: &str = "since";
/// Query parameter carrying the feed timeout in milliseconds.
pub const PARAM_TIMEOUT: &str = "timeout";
/// Query parameter requesting the service description.
pub const PARAM_ABOUT: &str = "about";

/// Placeholder in service constraints replaced by the requesting user's id.
pub const CURRENT_USER_TOKEN: &str = "[%CurrentUser%]";

/// Feed timeout used when a request does not specify one.
///
/// Kept below common proxy idle limits; clients reconnect afterwards.
pub const DEFAULT_FEED_TIMEOUT_MS: i64 = 50_000;

/// Bytes written on an idle feed connection to detect dropped clients.
pub const FEED_HEARTBEAT: &[u8] = b"\r\n";

/// Builds the URL of a collection's change endpoint.
///
/// `feed` selects `changes/feed` (long-poll) over `changes/list` (one-shot).
/// A trailing slash is added to the collection URL when missing.
pub fn changes_url(
    collection_url: &str,
    feed: bool,
    since: Revision,
    timeout_ms: Option<i64>,
) -> ProtocolResult<String> {
    let base = if collection_url.ends_with('/') {
        collection_url.to_string()
    } else {
        format!("{collection_url}/")
    };

    let endpoint = if feed { "changes/feed" } else { "changes/list" };
    let mut url = Url::parse(&base)
        .and_then(|u| u.join(endpoint))
        .map_err(|e| ProtocolError::InvalidUrl {
            url: collection_url.to_string(),
            reason: e.to_string(),
        })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair(PARAM_SINCE, &since.to_string());
        if let Some(timeout) = timeout_ms {
            query.append_pair(PARAM_TIMEOUT, &timeout.to_string());
        }
    }

    Ok(url.into())
}

/// Interprets a boolean query parameter (`true`/`false`, `1`/`0`, `yes`/`no`).
pub fn parse_bool_param(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_url_appends_params() {
        let url = changes_url("http://host/rest/tasks", true, 12, Some(-1)).unwrap();
        assert_eq!(url, "http://host/rest/tasks/changes/feed?since=12&timeout=-1");
    }

    #[test]
    fn list_url_keeps_trailing_slash() {
        let url = changes_url("http://host/rest/tasks/", false, 0, None).unwrap();
        assert_eq!(url, "http://host/rest/tasks/changes/list?since=0");
    }

    #[test]
    fn relative_url_is_rejected() {
        let err = changes_url("rest/tasks", false, 0, None).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUrl { .. }));
    }

    #[test]
    fn bool_params() {
        assert!(parse_bool_param(Some("true"), false));
        assert!(parse_bool_param(Some("1"), false));
        assert!(!parse_bool_param(Some("FALSE"), true));
        assert!(parse_bool_param(Some("maybe"), true));
        assert!(!parse_bool_param(None, false));
    }
}
