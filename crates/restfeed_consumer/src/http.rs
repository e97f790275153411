//! HTTP client abstraction.
//!
//! The consumer issues streaming GET requests for feeds and change lists
//! and POST requests for new objects. The actual client is abstracted via
//! [`HttpClient`] so that applications can plug in the HTTP library they
//! already use. [`LoopbackClient`] routes requests to an in-process server
//! and is used by tests.

use crate::error::{ConsumeError, ConsumeResult};
use http::{HeaderMap, Method, Request, StatusCode};
use parking_lot::Mutex;
use restfeed_protocol::ResponseSink;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// A request issued by the consumer.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body; empty for GET.
    pub body: Vec<u8>,
    /// Longest silence tolerated while waiting for data.
    pub read_timeout: Option<Duration>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url, Vec::new())
    }

    /// Creates a POST request with the given body.
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(Method::POST, url, body)
    }

    fn new(method: Method, url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body,
            read_timeout: None,
        }
    }

    /// Adds `headers`, replacing values of the same name.
    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name, value.clone());
        }
        self
    }

    /// Sets the read timeout.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// A response whose body is read incrementally.
pub struct HttpResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

type AbortAction = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    actions: Mutex<Vec<AbortAction>>,
}

/// Cancels a request from another thread.
///
/// The caller creates the handle before sending, so a request can be
/// aborted while it still waits for the response head. Clients register
/// what aborting means for them with [`AbortHandle::on_abort`].
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    /// Creates a handle that has not been aborted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action to run when the handle is aborted.
    ///
    /// Runs `action` immediately if the handle is already aborted.
    pub fn on_abort(&self, action: impl FnOnce() + Send + 'static) {
        let mut actions = self.inner.actions.lock();
        if self.is_aborted() {
            drop(actions);
            action();
            return;
        }
        actions.push(Box::new(action));
    }

    /// Aborts the request. Later calls do nothing.
    pub fn abort(&self) {
        let actions = {
            let mut actions = self.inner.actions.lock();
            self.inner.aborted.store(true, Ordering::SeqCst);
            std::mem::take(&mut *actions)
        };
        for action in actions {
            action();
        }
    }

    /// Returns true once aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// HTTP client abstraction.
///
/// Implementations return as soon as the status line and headers have
/// arrived; the body is streamed through [`HttpResponse::body`]. Aborting
/// `abort` must make a pending `send` and any later body read fail
/// promptly.
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    ///
    /// # Errors
    ///
    /// Returns a transport error if no response could be obtained or the
    /// request was aborted.
    fn send(&self, request: &HttpRequest, abort: &AbortHandle) -> ConsumeResult<HttpResponse>;
}

/// An in-process server reachable through [`LoopbackClient`].
pub trait LoopbackServer: Send + Sync + 'static {
    /// Serves one request, writing the response into `sink`.
    fn serve(&self, request: &Request<Vec<u8>>, sink: &mut dyn ResponseSink);
}

impl<F> LoopbackServer for F
where
    F: Fn(&Request<Vec<u8>>, &mut dyn ResponseSink) + Send + Sync + 'static,
{
    fn serve(&self, request: &Request<Vec<u8>>, sink: &mut dyn ResponseSink) {
        self(request, sink)
    }
}

enum Event {
    Head(StatusCode, HeaderMap),
    Body(Vec<u8>),
    Aborted,
}

/// An HTTP client that routes requests directly to an in-process server.
///
/// Each request is served on its own thread and streamed back over a
/// channel, so long-poll feeds behave as they would over a socket.
pub struct LoopbackClient<S: LoopbackServer> {
    server: Arc<S>,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client connected to `server`.
    pub fn new(server: S) -> Self {
        Self {
            server: Arc::new(server),
        }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn send(&self, request: &HttpRequest, abort: &AbortHandle) -> ConsumeResult<HttpResponse> {
        if abort.is_aborted() {
            return Err(ConsumeError::transport_retryable("request aborted"));
        }

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let http_request = builder
            .body(request.body.clone())
            .map_err(|e| ConsumeError::transport_fatal(format!("invalid request: {e}")))?;

        let (tx, rx) = mpsc::channel();
        let tx = Arc::new(tx);
        {
            // The body must still end once the server drops its sender.
            let tx: Weak<Sender<Event>> = Arc::downgrade(&tx);
            abort.on_abort(move || {
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Event::Aborted);
                }
            });
        }

        let server = Arc::clone(&self.server);
        let mut sink = ChannelSink {
            tx,
            abort: abort.clone(),
            begun: false,
        };
        thread::Builder::new()
            .name("restfeed-loopback".into())
            .spawn(move || server.serve(&http_request, &mut sink))
            .map_err(|e| ConsumeError::transport_retryable(format!("cannot spawn server: {e}")))?;

        let mut reader = ChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
            read_timeout: request.read_timeout,
        };
        let (status, headers) = reader.head()?;

        Ok(HttpResponse {
            status,
            headers,
            body: Box::new(reader),
        })
    }
}

struct ChannelSink {
    tx: Arc<Sender<Event>>,
    abort: AbortHandle,
    begun: bool,
}

impl ChannelSink {
    fn send(&self, event: Event) -> io::Result<()> {
        if self.abort.is_aborted() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client aborted"));
        }
        self.tx
            .send(event)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Event::Body(buf.to_vec()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseSink for ChannelSink {
    fn begin(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        self.begun = true;
        self.send(Event::Head(status, headers.clone()))
    }

    fn has_begun(&self) -> bool {
        self.begun
    }
}

struct ChannelReader {
    rx: Receiver<Event>,
    pending: Vec<u8>,
    offset: usize,
    read_timeout: Option<Duration>,
}

impl ChannelReader {
    fn next_event(&self) -> io::Result<Option<Event>> {
        let event = match self.read_timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Disconnected) => None,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }
            },
            None => self.rx.recv().ok(),
        };
        match event {
            Some(Event::Aborted) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "request aborted",
            )),
            other => Ok(other),
        }
    }

    fn head(&mut self) -> ConsumeResult<(StatusCode, HeaderMap)> {
        match self.next_event() {
            Ok(Some(Event::Head(status, headers))) => Ok((status, headers)),
            Ok(_) => Err(ConsumeError::transport_retryable(
                "server closed the connection without a response",
            )),
            Err(e) => Err(ConsumeError::transport_retryable(e.to_string())),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.pending.len() {
            match self.next_event()? {
                Some(Event::Body(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Some(Event::Head(..)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "response started twice",
                    ))
                }
                Some(Event::Aborted) | None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
