//! HTTP request handling for one published service.

use crate::access::Principal;
use crate::describe::describe;
use crate::error::{ServerError, ServerResult};
use crate::service::{Fetched, PublishedService, PutOutcome};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH, LOCATION};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use restfeed_protocol::{
    encode_change_list, parse_bool_param, ResponseSink, Revision, PARAM_ABOUT, PARAM_DATA,
    PARAM_SINCE, PARAM_TIMEOUT,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use tracing::{error, warn};

const JSON: &str = "application/json; charset=utf-8";
const TEXT: &str = "text/plain; charset=utf-8";

/// Parsed query string. Later duplicates win.
pub(crate) type Query = HashMap<String, String>;

pub(crate) fn parse_query(query: Option<&str>) -> Query {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Percent-decodes one path segment. `+` is kept literally.
pub(crate) fn decode_segment(segment: &str) -> String {
    let escaped = segment.replace('+', "%2B");
    url::form_urlencoded::parse(format!("k={escaped}").as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

fn header<'a>(headers: &'a HeaderMap, name: http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_headers(content_type: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers
}

fn etag_header(headers: &mut HeaderMap, etag: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        headers.insert(ETAG, value);
    }
}

fn location_header(headers: &mut HeaderMap, url: &str) {
    if let Ok(value) = HeaderValue::from_str(url) {
        headers.insert(LOCATION, value);
    }
}

/// Writes a complete JSON response.
pub(crate) fn write_json<T: Serialize + ?Sized>(
    sink: &mut dyn ResponseSink,
    status: StatusCode,
    body: &T,
) -> ServerResult<()> {
    let bytes = serde_json::to_vec(body)?;
    sink.begin(status, &content_headers(JSON))?;
    sink.write_all(&bytes)?;
    Ok(())
}

fn write_empty(
    sink: &mut dyn ResponseSink,
    status: StatusCode,
    headers: HeaderMap,
) -> ServerResult<()> {
    sink.begin(status, &headers)?;
    Ok(())
}

/// Reports `err` to the client, or only logs it once the response has
/// already started.
pub(crate) fn write_error(sink: &mut dyn ResponseSink, err: &ServerError) {
    let status = err.status();
    if status.is_server_error() {
        error!(status = status.as_u16(), error = %err, "request failed");
    }

    if sink.has_begun() {
        warn!(error = %err, "error after response started");
        return;
    }

    let body = json!({ "error": status.as_u16(), "message": err.to_string() });
    if let Err(write_err) = write_json(sink, status, &body) {
        warn!(error = %write_err, "failed to send error response");
    }
}

fn parse_since(query: &Query) -> ServerResult<Revision> {
    match query.get(PARAM_SINCE).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(since) => since
            .parse()
            .map_err(|_| ServerError::BadRequest(format!("invalid {PARAM_SINCE} '{since}'"))),
        None => Ok(0),
    }
}

fn parse_timeout(query: &Query, default: i64) -> ServerResult<i64> {
    match query.get(PARAM_TIMEOUT).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(timeout) => timeout
            .parse()
            .map_err(|_| ServerError::BadRequest(format!("invalid {PARAM_TIMEOUT} '{timeout}'"))),
        None => Ok(default),
    }
}

fn parse_payload(body: &[u8]) -> ServerResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| ServerError::BadRequest(format!("request body is not valid JSON: {e}")))
}

/// Handles a request addressed to `service`.
///
/// `route` is the path below the service root, without a leading slash
/// and still percent-encoded.
pub(crate) fn handle_service(
    service: &PublishedService,
    request: &Request<Vec<u8>>,
    route: &str,
    sink: &mut dyn ResponseSink,
) -> ServerResult<()> {
    let principal = Principal::from_request(request);
    let query = parse_query(request.uri().query());
    let headers = request.headers();
    let method = request.method();

    if route.is_empty() {
        return match *method {
            Method::GET if query.contains_key(PARAM_ABOUT) => {
                write_json(sink, StatusCode::OK, &describe(service))
            }
            Method::GET => {
                let include_data =
                    parse_bool_param(query.get(PARAM_DATA).map(String::as_str), false);
                let listed = service.list(&principal, include_data)?;
                write_json(sink, StatusCode::OK, &listed)
            }
            Method::POST => {
                let payload = parse_payload(request.body())?;
                let key = service.post(&principal, &payload)?;
                let mut out = content_headers(TEXT);
                location_header(&mut out, &format!("{}{key}", service.url()));
                sink.begin(StatusCode::CREATED, &out)?;
                sink.write_all(key.as_bytes())?;
                Ok(())
            }
            _ => Err(method_not_allowed(method, route)),
        };
    }

    if service.is_tracking() {
        match route {
            "changes/list" => {
                expect_get(method, route)?;
                let since = parse_since(&query)?;
                let changes = service.changes_list(&principal, since)?;
                sink.begin(StatusCode::OK, &content_headers(JSON))?;
                sink.write_all(&encode_change_list(&changes)?)?;
                return Ok(());
            }
            "changes/feed" => {
                expect_get(method, route)?;
                service.authorize_feed(&principal)?;
                let since = parse_since(&query)?;
                let timeout = parse_timeout(&query, service.default_feed_timeout_ms())?;
                return serve_feed(service, since, timeout, sink);
            }
            _ => {}
        }
    }

    let key = decode_segment(route);
    // Tags may arrive in either header.
    let supplied_tag = header(headers, IF_MATCH).or_else(|| header(headers, IF_NONE_MATCH));

    match *method {
        Method::GET => match service.get(&principal, &key, header(headers, IF_NONE_MATCH))? {
            Fetched::NotModified { etag } => {
                let mut out = HeaderMap::new();
                etag_header(&mut out, &etag);
                write_empty(sink, StatusCode::NOT_MODIFIED, out)
            }
            Fetched::Found { json, etag } => {
                let mut out = content_headers(JSON);
                etag_header(&mut out, &etag);
                sink.begin(StatusCode::OK, &out)?;
                sink.write_all(json.as_bytes())?;
                Ok(())
            }
        },
        Method::PUT => {
            let payload = parse_payload(request.body())?;
            match service.put(&principal, &key, &payload, supplied_tag)? {
                PutOutcome::Created => {
                    let mut out = HeaderMap::new();
                    location_header(&mut out, &format!("{}{route}", service.url()));
                    write_empty(sink, StatusCode::CREATED, out)
                }
                PutOutcome::Updated => write_empty(sink, StatusCode::NO_CONTENT, HeaderMap::new()),
            }
        }
        Method::DELETE => {
            service.delete(&principal, &key, supplied_tag)?;
            write_empty(sink, StatusCode::NO_CONTENT, HeaderMap::new())
        }
        _ => Err(method_not_allowed(method, route)),
    }
}

fn serve_feed(
    service: &PublishedService,
    since: Revision,
    timeout_ms: i64,
    sink: &mut dyn ResponseSink,
) -> ServerResult<()> {
    let mut out = content_headers(JSON);
    out.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    sink.begin(StatusCode::OK, &out)?;

    match service.serve_feed(since, timeout_ms, sink) {
        Err(ServerError::Io(err)) => {
            warn!(service = %service.name(), since, error = %err, "feed client disconnected");
            Ok(())
        }
        other => other,
    }
}

fn expect_get(method: &Method, route: &str) -> ServerResult<()> {
    if *method == Method::GET {
        Ok(())
    } else {
        Err(method_not_allowed(method, route))
    }
}

fn method_not_allowed(method: &Method, route: &str) -> ServerError {
    ServerError::MethodNotAllowed(format!("{method} is not supported on '/{route}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use restfeed_protocol::BufferedResponse;

    #[test]
    fn query_parsing() {
        let query = parse_query(Some("since=5&data=true&about"));
        assert_eq!(query["since"], "5");
        assert_eq!(query["data"], "true");
        assert!(query.contains_key("about"));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn segment_decoding() {
        assert_eq!(decode_segment("a%20b"), "a b");
        assert_eq!(decode_segment("a+b"), "a+b");
        assert_eq!(decode_segment("plain"), "plain");
        assert_eq!(decode_segment("%2F"), "/");
    }

    #[test]
    fn since_and_timeout_params() {
        assert_eq!(parse_since(&parse_query(Some("since=12"))).unwrap(), 12);
        assert_eq!(parse_since(&parse_query(None)).unwrap(), 0);
        assert!(parse_since(&parse_query(Some("since=-1"))).is_err());

        assert_eq!(parse_timeout(&parse_query(Some("timeout=-1")), 50).unwrap(), -1);
        assert_eq!(parse_timeout(&parse_query(None), 50).unwrap(), 50);
        assert!(parse_timeout(&parse_query(Some("timeout=soon")), 50).is_err());
    }

    #[test]
    fn error_body_carries_status() {
        let mut sink = BufferedResponse::new();
        write_error(&mut sink, &ServerError::NotFound("object 'k' not found".into()));

        let response = sink.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], 404);
        assert!(body["message"].as_str().unwrap().contains("'k'"));
    }

    #[test]
    fn error_after_begin_is_not_written() {
        let mut sink = BufferedResponse::new();
        sink.begin(StatusCode::OK, &HeaderMap::new()).unwrap();
        write_error(&mut sink, &ServerError::Storage("disk".into()));
        assert_eq!(sink.status(), Some(StatusCode::OK));
        assert!(sink.body().is_empty());
    }
}
