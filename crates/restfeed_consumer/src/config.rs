//! Configuration for feed listeners.

use http::{HeaderMap, HeaderName, HeaderValue};
use restfeed_protocol::DEFAULT_FEED_TIMEOUT_MS;
use std::time::Duration;

/// Retry delays after failed feed connections.
///
/// The delay after `n` earlier consecutive failures is
/// `min(initial * multiplier^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Returns the delay after `failures` earlier consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max.as_secs_f64();
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 1.3, Duration::from_secs(60 * 60))
    }
}

/// Tracks consecutive failures of one listener.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    /// Creates a tracker with no failures recorded.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forgets earlier failures after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Returns the number of consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Configuration shared by the listeners of one registry.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Retry delays.
    pub backoff: BackoffConfig,
    /// Headers sent with every request (e.g. authorization).
    pub headers: HeaderMap,
    /// Feed timeout requested when `follow` is not given one.
    pub feed_timeout_ms: i64,
    /// Longest silence tolerated on an open connection. Heartbeats keep
    /// idle feeds below this.
    pub read_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            headers: HeaderMap::new(),
            feed_timeout_ms: DEFAULT_FEED_TIMEOUT_MS,
            read_timeout: Some(Duration::from_secs(90)),
        }
    }

    /// Sets the retry delays.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the default feed timeout.
    pub fn with_feed_timeout(mut self, timeout_ms: i64) -> Self {
        self.feed_timeout_ms = timeout_ms;
        self
    }

    /// Sets the read timeout; `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new()
    }
}
