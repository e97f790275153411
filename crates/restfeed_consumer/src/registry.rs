//! The registry of followed collections.

use crate::applier::ChangeApplier;
use crate::checkpoint::FollowStateStore;
use crate::config::ListenerConfig;
use crate::error::{ConsumeError, ConsumeResult};
use crate::http::{AbortHandle, HttpClient, HttpRequest};
use crate::listener::{Listener, ListenerState};
use crate::processor::{apply_record, load_or_create};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use parking_lot::Mutex;
use restfeed_protocol::{changes_url, ChangeRecord, ProtocolError, Revision};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Keeps at most one listener per collection URL.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use restfeed_consumer::{
///     FileFollowStore, FollowRegistry, HttpClient, ListenerConfig, MemoryApplier,
/// };
///
/// fn start(client: Arc<dyn HttpClient>) -> restfeed_consumer::ConsumeResult<FollowRegistry> {
///     let store = Arc::new(FileFollowStore::open("follows.json")?);
///     let registry = FollowRegistry::new(client, store, ListenerConfig::default());
///     let tasks = MemoryApplier::<serde_json::Value>::new();
///     registry.follow("http://example.com/rest/tasks/", tasks, None)?;
///     Ok(registry)
/// }
/// ```
pub struct FollowRegistry {
    client: Arc<dyn HttpClient>,
    store: Arc<dyn FollowStateStore>,
    config: ListenerConfig,
    listeners: Mutex<BTreeMap<String, Listener>>,
    fetching: Mutex<BTreeSet<String>>,
}

/// Removes a URL from the in-progress fetches when dropped.
struct FetchGuard<'a> {
    fetching: &'a Mutex<BTreeSet<String>>,
    url: String,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.fetching.lock().remove(&self.url);
    }
}

impl FollowRegistry {
    /// Creates an empty registry.
    pub fn new(
        client: Arc<dyn HttpClient>,
        store: Arc<dyn FollowStateStore>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
            listeners: Mutex::new(BTreeMap::new()),
            fetching: Mutex::new(BTreeSet::new()),
        }
    }

    /// Normalizes a collection URL: parsed, without query or fragment, and
    /// ending in a slash.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the URL cannot be parsed.
    pub fn normalize_url(collection_url: &str) -> ConsumeResult<String> {
        let mut url = Url::parse(collection_url).map_err(|e| ProtocolError::InvalidUrl {
            url: collection_url.to_string(),
            reason: e.to_string(),
        })?;
        url.set_query(None);
        url.set_fragment(None);
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url.into())
    }

    /// Starts a background listener for `collection_url`.
    ///
    /// Changes are applied from the stored checkpoint onwards. `timeout_ms`
    /// overrides the configured feed timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::AlreadyFollowing`] if the collection is
    /// followed or being fetched, or a checkpoint error.
    pub fn follow<A>(
        &self,
        collection_url: &str,
        applier: A,
        timeout_ms: Option<i64>,
    ) -> ConsumeResult<()>
    where
        A: ChangeApplier + Send + 'static,
    {
        let url = Self::normalize_url(collection_url)?;
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&url) || self.fetching.lock().contains(&url) {
            return Err(ConsumeError::AlreadyFollowing(url));
        }

        let checkpoint = load_or_create(self.store.as_ref(), &url)?;
        let since = checkpoint.revision;
        let listener = Listener::spawn(
            applier,
            checkpoint,
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            self.config.clone(),
            timeout_ms.unwrap_or(self.config.feed_timeout_ms),
        )?;
        listeners.insert(url.clone(), listener);

        info!(url = %url, since, "following collection");
        Ok(())
    }

    /// Stops the listener of `collection_url` and waits for it to exit.
    ///
    /// Returns false if the collection was not followed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the URL cannot be parsed.
    pub fn unfollow(&self, collection_url: &str) -> ConsumeResult<bool> {
        let url = Self::normalize_url(collection_url)?;
        let Some(listener) = self.listeners.lock().remove(&url) else {
            return Ok(false);
        };
        listener.stop();
        info!(url = %url, "stopped following collection");
        Ok(true)
    }

    /// Applies all changes after the checkpoint once, without following.
    ///
    /// Returns the number of changes applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::AlreadyFollowing`] while a listener runs for
    /// the collection, or the first request, decoding or apply failure.
    /// Changes applied before a failure stay checkpointed.
    pub fn fetch<A: ChangeApplier>(
        &self,
        collection_url: &str,
        applier: &mut A,
    ) -> ConsumeResult<usize> {
        let url = Self::normalize_url(collection_url)?;
        let _guard = {
            let listeners = self.listeners.lock();
            let mut fetching = self.fetching.lock();
            if listeners.contains_key(&url) || !fetching.insert(url.clone()) {
                return Err(ConsumeError::AlreadyFollowing(url));
            }
            FetchGuard {
                fetching: &self.fetching,
                url: url.clone(),
            }
        };

        let mut checkpoint = load_or_create(self.store.as_ref(), &url)?;
        let request = HttpRequest::get(changes_url(&url, false, checkpoint.revision, None)?)
            .with_headers(&self.config.headers)
            .with_read_timeout(self.config.read_timeout);
        debug!(url = %request.url, "fetching changes");

        let response = self.client.send(&request, &AbortHandle::new())?;
        if response.status != StatusCode::OK {
            return Err(ConsumeError::Status {
                url: request.url,
                status: response.status.as_u16(),
            });
        }
        let records: Vec<ChangeRecord> =
            serde_json::from_reader(response.body).map_err(ProtocolError::from)?;

        let count = records.len();
        for record in records {
            apply_record(applier, record, &mut checkpoint, self.store.as_ref())?;
        }
        info!(url = %url, count, revision = checkpoint.revision, "fetched changes");
        Ok(count)
    }

    /// Creates an object in the remote collection at `collection_url`.
    ///
    /// The object is sent as a JSON body. Returns the key the server
    /// assigned, taken from the `201 Created` response body.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Status`] for any other status, or a
    /// transport error if the response carries no key.
    pub fn post_object<T>(&self, collection_url: &str, object: &T) -> ConsumeResult<String>
    where
        T: Serialize + ?Sized,
    {
        let url = Self::normalize_url(collection_url)?;
        let body = serde_json::to_vec(object).map_err(ProtocolError::from)?;
        let mut request = HttpRequest::post(url.clone(), body)
            .with_headers(&self.config.headers)
            .with_read_timeout(self.config.read_timeout);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        debug!(url = %url, "posting object");

        let mut response = self.client.send(&request, &AbortHandle::new())?;
        if response.status != StatusCode::CREATED {
            return Err(ConsumeError::Status {
                url,
                status: response.status.as_u16(),
            });
        }
        let mut key = String::new();
        response.body.read_to_string(&mut key)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConsumeError::transport_fatal(format!(
                "{url} created an object without returning its key"
            )));
        }

        info!(url = %url, key, "posted object");
        Ok(key.to_string())
    }

    /// Deletes the checkpoint so the next follow or fetch starts from
    /// revision 0.
    ///
    /// Returns false if there was no checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::ActiveListener`] while the collection is
    /// followed or fetched.
    pub fn reset_state(&self, collection_url: &str) -> ConsumeResult<bool> {
        let url = Self::normalize_url(collection_url)?;
        let listeners = self.listeners.lock();
        if listeners.contains_key(&url) || self.fetching.lock().contains(&url) {
            return Err(ConsumeError::ActiveListener(url));
        }
        let removed = self.store.remove(&url)?;
        if removed {
            info!(url = %url, "reset follow state");
        }
        Ok(removed)
    }

    /// Returns the state of the listener for `collection_url`.
    pub fn state(&self, collection_url: &str) -> ListenerState {
        let Ok(url) = Self::normalize_url(collection_url) else {
            return ListenerState::Idle;
        };
        self.listeners
            .lock()
            .get(&url)
            .map_or(ListenerState::Idle, Listener::state)
    }

    /// Returns true if a listener runs for `collection_url`.
    pub fn is_following(&self, collection_url: &str) -> bool {
        Self::normalize_url(collection_url)
            .map(|url| self.listeners.lock().contains_key(&url))
            .unwrap_or(false)
    }

    /// Returns the followed collection URLs, sorted.
    pub fn following(&self) -> Vec<String> {
        self.listeners.lock().keys().cloned().collect()
    }

    /// Returns the stored checkpoint of `collection_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the store fails.
    pub fn checkpoint(&self, collection_url: &str) -> ConsumeResult<Option<Revision>> {
        let url = Self::normalize_url(collection_url)?;
        Ok(self.store.load(&url)?.map(|state| state.revision))
    }

    /// Stops every listener.
    pub fn shutdown(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (url, listener) in listeners {
            listener.stop();
            debug!(url = %url, "listener shut down");
        }
    }
}

impl Drop for FollowRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FollowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowRegistry")
            .field("following", &self.following())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_normalized() {
        assert_eq!(
            FollowRegistry::normalize_url("http://example.com/rest/tasks").unwrap(),
            "http://example.com/rest/tasks/"
        );
        assert_eq!(
            FollowRegistry::normalize_url("http://example.com/rest/tasks/?about#x").unwrap(),
            "http://example.com/rest/tasks/"
        );
        assert!(FollowRegistry::normalize_url("not a url").is_err());
    }
}
