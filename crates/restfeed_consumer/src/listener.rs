//! The background worker that follows one change feed.

use crate::applier::ChangeApplier;
use crate::checkpoint::{FollowState, FollowStateStore};
use crate::config::{Backoff, ListenerConfig};
use crate::error::{ConsumeError, ConsumeResult};
use crate::http::{AbortHandle, HttpClient, HttpRequest};
use crate::processor::apply_record;
use http::StatusCode;
use parking_lot::{Condvar, Mutex};
use restfeed_protocol::{changes_url, ChangeStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a listener.
///
/// ```text
/// Idle → Connecting → Streaming → (Backoff → Connecting) → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No listener is running for the collection.
    Idle,
    /// Waiting for the feed request to be answered.
    Connecting,
    /// Receiving and applying changes.
    Streaming,
    /// Waiting before the next connection attempt.
    Backoff,
    /// The listener has been stopped.
    Stopped,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ListenerState::Idle => "idle",
            ListenerState::Connecting => "connecting",
            ListenerState::Streaming => "streaming",
            ListenerState::Backoff => "backoff",
            ListenerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A cancellation flag whose waiters wake up when it is set.
#[derive(Debug, Default)]
pub(crate) struct CancelToken {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleeps for `duration` or until cancelled. Returns true if cancelled.
    pub(crate) fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

struct Shared {
    url: String,
    state: Mutex<ListenerState>,
    cancel: CancelToken,
    in_flight: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }
}

/// Everything the worker thread owns.
struct Worker<A> {
    shared: Arc<Shared>,
    client: Arc<dyn HttpClient>,
    store: Arc<dyn FollowStateStore>,
    config: ListenerConfig,
    timeout_ms: i64,
    applier: A,
    checkpoint: FollowState,
    backoff: Backoff,
}

/// Handle to a running listener.
pub(crate) struct Listener {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Starts following the feed of `checkpoint.collection_url`.
    pub(crate) fn spawn<A>(
        applier: A,
        checkpoint: FollowState,
        client: Arc<dyn HttpClient>,
        store: Arc<dyn FollowStateStore>,
        config: ListenerConfig,
        timeout_ms: i64,
    ) -> ConsumeResult<Self>
    where
        A: ChangeApplier + Send + 'static,
    {
        let shared = Arc::new(Shared {
            url: checkpoint.collection_url.clone(),
            state: Mutex::new(ListenerState::Idle),
            cancel: CancelToken::new(),
            in_flight: Mutex::new(None),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            client,
            store,
            backoff: Backoff::new(config.backoff),
            config,
            timeout_ms,
            applier,
            checkpoint,
        };
        let handle = thread::Builder::new()
            .name("restfeed-follow".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn state(&self) -> ListenerState {
        *self.shared.state.lock()
    }

    /// Cancels the worker, aborts its request and waits for it to exit.
    pub(crate) fn stop(mut self) {
        self.shared.cancel.cancel();
        if let Some(abort) = self.shared.in_flight.lock().take() {
            abort.abort();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(url = %self.shared.url, "listener thread panicked");
            }
        }
        self.shared.set_state(ListenerState::Stopped);
    }
}

impl<A: ChangeApplier> Worker<A> {
    fn run(mut self) {
        info!(url = %self.shared.url, since = self.checkpoint.revision, "listener started");

        while !self.shared.cancel.is_cancelled() {
            self.shared.set_state(ListenerState::Connecting);
            match self.connect() {
                Ok(()) => {
                    self.backoff.reset();
                    debug!(url = %self.shared.url, "feed closed, reconnecting");
                }
                Err(_) if self.shared.cancel.is_cancelled() => break,
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    error!(
                        url = %self.shared.url,
                        error = %err,
                        failures = self.backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "feed connection failed"
                    );
                    if self.backoff.failures() > 1
                        && matches!(
                            err,
                            ConsumeError::Apply { .. } | ConsumeError::Materialize { .. }
                        )
                    {
                        warn!(
                            url = %self.shared.url,
                            after = self.checkpoint.revision,
                            failures = self.backoff.failures(),
                            "change keeps failing to apply"
                        );
                    }
                    self.shared.set_state(ListenerState::Backoff);
                    if self.shared.cancel.wait(delay) {
                        break;
                    }
                }
            }
        }

        self.shared.set_state(ListenerState::Stopped);
        info!(url = %self.shared.url, revision = self.checkpoint.revision, "listener stopped");
    }

    /// Runs one feed request until the stream ends or fails.
    fn connect(&mut self) -> ConsumeResult<()> {
        let url = changes_url(
            &self.shared.url,
            true,
            self.checkpoint.revision,
            Some(self.timeout_ms),
        )?;
        let request = HttpRequest::get(url)
            .with_headers(&self.config.headers)
            .with_read_timeout(self.config.read_timeout);

        let abort = AbortHandle::new();
        *self.shared.in_flight.lock() = Some(abort.clone());
        // stop() may have taken the previous handle before this one was published.
        if self.shared.cancel.is_cancelled() {
            abort.abort();
        }

        debug!(url = %request.url, "requesting feed");
        let result = match self.client.send(&request, &abort) {
            Ok(response) => self.stream(response.status, response.body, &request.url),
            Err(err) => Err(err),
        };
        self.shared.in_flight.lock().take();
        result
    }

    /// Applies the records of one feed response.
    ///
    /// The backoff is reset once a record has been applied, so a change
    /// that keeps failing backs off like any other failure.
    fn stream(
        &mut self,
        status: StatusCode,
        body: Box<dyn std::io::Read + Send>,
        url: &str,
    ) -> ConsumeResult<()> {
        if status != StatusCode::OK {
            return Err(ConsumeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        self.shared.set_state(ListenerState::Streaming);

        for record in ChangeStream::new(body) {
            if self.shared.cancel.is_cancelled() {
                return Err(ConsumeError::Cancelled);
            }
            apply_record(
                &mut self.applier,
                record?,
                &mut self.checkpoint,
                self.store.as_ref(),
            )?;
            self.backoff.reset();
        }
        Ok(())
    }
}
