//! Response sinks for streamed HTTP responses.
//!
//! Feed responses are written incrementally, so request handlers write
//! into a [`ResponseSink`] instead of returning a finished response.

use http::{HeaderMap, Response, StatusCode};
use std::io::{self, Write};

/// Destination of one HTTP response.
///
/// `begin` must be called exactly once before any body bytes are written.
/// A write error means the client went away.
pub trait ResponseSink: Write {
    /// Sends the status line and headers.
    fn begin(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()>;

    /// Returns true once `begin` has been called.
    fn has_begun(&self) -> bool;
}

/// A sink that collects the whole response in memory.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the status, if the response has begun.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Returns the body written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Converts the buffer into an `http::Response`.
    ///
    /// A response that never began is reported as `500`.
    pub fn into_response(self) -> Response<Vec<u8>> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = self.headers;
        response
    }
}

impl Write for BufferedResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "response body written before status",
            ));
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseSink for BufferedResponse {
    fn begin(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        if self.status.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "response already started",
            ));
        }
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    fn has_begun(&self) -> bool {
        self.status.is_some()
    }
}
