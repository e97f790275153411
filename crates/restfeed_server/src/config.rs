//! Server configuration.

use restfeed_protocol::DEFAULT_FEED_TIMEOUT_MS;
use std::path::PathBuf;
use std::time::Duration;

/// Path segment under which services are mounted.
pub const REST_PATH: &str = "rest";

/// Configuration for the publishing server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application root URL, e.g. `http://localhost:8080/`.
    pub base_url: String,
    /// Number of rows read per batch when listing or paging the change log.
    pub batch_size: usize,
    /// Feed timeout used when a request omits the `timeout` parameter.
    pub default_feed_timeout_ms: i64,
    /// Idle interval after which a heartbeat is written to open feeds.
    pub heartbeat_interval: Duration,
    /// Directory for object state journals. In-memory when `None`.
    pub data_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Creates a configuration for the given root URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Self {
            base_url,
            batch_size: 1000,
            default_feed_timeout_ms: DEFAULT_FEED_TIMEOUT_MS,
            heartbeat_interval: Duration::from_secs(30),
            data_dir: None,
        }
    }

    /// Sets the listing batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the default feed timeout.
    pub fn with_default_feed_timeout(mut self, timeout_ms: i64) -> Self {
        self.default_feed_timeout_ms = timeout_ms;
        self
    }

    /// Sets the heartbeat interval for idle feeds.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Persists object state journals under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Returns the URL of the service overview.
    pub fn rest_url(&self) -> String {
        format!("{}{}/", self.base_url, REST_PATH)
    }

    /// Returns the root URL of a service, ending in a slash.
    pub fn service_url(&self, service: &str) -> String {
        format!("{}{}/", self.rest_url(), service)
    }

    /// Returns the journal path of a service, if journals are enabled.
    pub fn journal_path(&self, service: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{service}.objectstate.jsonl")))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.default_feed_timeout_ms, 50_000);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn urls() {
        let config = ServerConfig::new("http://example.com");
        assert_eq!(config.rest_url(), "http://example.com/rest/");
        assert_eq!(config.service_url("tasks"), "http://example.com/rest/tasks/");
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::default()
            .with_batch_size(0)
            .with_default_feed_timeout(-1)
            .with_data_dir("/tmp/restfeed");

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.default_feed_timeout_ms, -1);
        assert_eq!(
            config.journal_path("tasks"),
            Some(PathBuf::from("/tmp/restfeed/tasks.objectstate.jsonl"))
        );
    }
}
