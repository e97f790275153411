//! A published collection.
//!
//! [`PublishedService`] maps the REST verbs onto a source collection and,
//! when change tracking is enabled, onto the service's [`ChangeManager`].
//!
//! # Write path
//!
//! Every write runs inside one source transaction while holding the
//! write lock of its key. Version tags are checked under that lock, so of
//! two writers that read the same tag only the first to commit succeeds.
//! After the commit the key is re-read and its new representation (or its
//! deletion) is recorded as a change.

use crate::access::{authorize, scoped_constraint, Principal};
use crate::callbacks::{CallbackRegistry, ServiceCallbacks};
use crate::change_manager::ChangeManager;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::source::{Record, SourceCollection, SourceTransaction};
use crate::state_store::ObjectStateStore;
use parking_lot::{Mutex, MutexGuard};
use restfeed_protocol::{
    compute_etag, is_valid_key, key_from_value, write_feed_entry, ChangeRecord, Revision,
    ServiceDefinition, CURRENT_USER_TOKEN, FEED_HEARTBEAT,
};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const KEY_LOCK_STRIPES: usize = 64;

/// Result of a single-object read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// The caller's tag is current; no body is sent.
    NotModified {
        /// Current version tag.
        etag: String,
    },
    /// The current representation.
    Found {
        /// Serialized representation.
        json: String,
        /// Version tag of `json`.
        etag: String,
    },
}

/// Result of a PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new object was created (201).
    Created,
    /// An existing object was updated (204).
    Updated,
}

/// Striped per-key write locks.
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new() -> Self {
        Self {
            stripes: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe].lock()
    }
}

/// One published collection.
pub struct PublishedService {
    definition: ServiceDefinition,
    url: String,
    source: Arc<dyn SourceCollection>,
    callbacks: ServiceCallbacks,
    changes: Option<ChangeManager>,
    locks: KeyLocks,
    batch_size: usize,
    default_feed_timeout_ms: i64,
    heartbeat_interval: Duration,
}

impl PublishedService {
    /// Creates a service, resolving its callbacks and opening its index.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid name, unknown callbacks,
    /// or a tracked service whose constraint depends on the current user;
    /// returns a storage error if the index journal cannot be opened.
    pub fn new(
        definition: ServiceDefinition,
        source: Arc<dyn SourceCollection>,
        callbacks: &CallbackRegistry,
        config: &ServerConfig,
    ) -> ServerResult<Self> {
        if !is_valid_key(&definition.name) {
            return Err(ServerError::Configuration(format!(
                "invalid service name '{}'",
                definition.name
            )));
        }
        if definition.key_attribute.trim().is_empty() {
            return Err(ServerError::Configuration(format!(
                "service '{}' has no key attribute",
                definition.name
            )));
        }

        let resolved = callbacks.resolve(&definition)?;

        let changes = if definition.flags.change_tracking {
            let per_user = definition
                .constraint
                .as_deref()
                .is_some_and(|c| c.contains(CURRENT_USER_TOKEN));
            if per_user {
                return Err(ServerError::Configuration(format!(
                    "service '{}' tracks changes but its constraint depends on the current user",
                    definition.name
                )));
            }

            let store = match config.journal_path(&definition.name) {
                Some(path) => ObjectStateStore::open(definition.name.clone(), &path)?,
                None => ObjectStateStore::in_memory(definition.name.clone()),
            };
            Some(ChangeManager::new(store))
        } else {
            None
        };

        Ok(Self {
            url: config.service_url(&definition.name),
            definition,
            source,
            callbacks: resolved,
            changes,
            locks: KeyLocks::new(),
            batch_size: config.batch_size,
            default_feed_timeout_ms: config.default_feed_timeout_ms,
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    /// Returns the service definition.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Returns the service name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Returns the service root URL, ending in a slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns true if change tracking is enabled.
    pub fn is_tracking(&self) -> bool {
        self.changes.is_some()
    }

    /// Returns the change manager of a tracked service.
    pub fn change_manager(&self) -> Option<&ChangeManager> {
        self.changes.as_ref()
    }

    pub(crate) fn default_feed_timeout_ms(&self) -> i64 {
        self.default_feed_timeout_ms
    }

    fn tracked(&self) -> ServerResult<&ChangeManager> {
        self.changes.as_ref().ok_or_else(|| {
            ServerError::NotFound(format!(
                "service '{}' does not track changes",
                self.definition.name
            ))
        })
    }

    fn require(&self, enabled: bool, operation: &str) -> ServerResult<()> {
        if enabled {
            Ok(())
        } else {
            Err(ServerError::MethodNotAllowed(format!(
                "{operation} is not enabled for service '{}'",
                self.definition.name
            )))
        }
    }

    fn key_attribute(&self) -> &str {
        &self.definition.key_attribute
    }

    fn record_key(&self, record: &Record) -> Option<String> {
        key_from_value(record.get(self.key_attribute())).filter(|k| is_valid_key(k))
    }

    fn publish(&self, record: &Record) -> ServerResult<(String, String)> {
        let view = self.callbacks.publish(record)?;
        let json = serde_json::to_string(&view)?;
        let etag = compute_etag(&json);
        Ok((json, etag))
    }

    /// Explains why `key` is not visible: 401 if it exists outside the
    /// caller's scope, 404 otherwise.
    fn invisible(&self, key: &str, exists: bool) -> ServerError {
        if exists {
            ServerError::Unauthorized(format!("object '{key}' is not accessible"))
        } else {
            ServerError::NotFound(format!("object '{key}' not found"))
        }
    }

    // ----- read path -----

    /// Lists the service: object URLs, or full objects with `include_data`.
    ///
    /// # Errors
    ///
    /// Fails if listing is disabled, the caller lacks the role, or the
    /// source or a publish transform fails.
    pub fn list(&self, principal: &Principal, include_data: bool) -> ServerResult<Vec<Value>> {
        self.require(self.definition.flags.listing, "listing")?;
        authorize(&self.definition, principal)?;

        let mut out = Vec::new();

        if let Some(changes) = &self.changes {
            let mut after: Option<String> = None;
            loop {
                let rows = changes.list_live(after.as_deref(), self.batch_size);
                let Some(last) = rows.last() else {
                    break;
                };
                after = Some(last.key.clone());

                for row in rows {
                    if include_data {
                        out.push(serde_json::from_str(&row.json)?);
                    } else {
                        out.push(Value::String(format!("{}{}", self.url, row.key)));
                    }
                }
            }
            return Ok(out);
        }

        let constraint = scoped_constraint(&self.definition, principal);
        let mut offset = 0;
        loop {
            let batch = self.source.scan(
                self.key_attribute(),
                constraint.as_deref(),
                offset,
                self.batch_size,
            )?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();

            for record in &batch {
                let Some(key) = self.record_key(record) else {
                    debug!(service = %self.definition.name, "skipping record with invalid key");
                    continue;
                };
                if include_data {
                    out.push(self.callbacks.publish(record)?);
                } else {
                    out.push(Value::String(format!("{}{key}", self.url)));
                }
            }
        }
        Ok(out)
    }

    /// Reads one object.
    ///
    /// Returns [`Fetched::NotModified`] when `if_none_match` equals the
    /// current tag.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or deleted keys, `Unauthorized` for keys
    /// outside the caller's scope.
    pub fn get(
        &self,
        principal: &Principal,
        key: &str,
        if_none_match: Option<&str>,
    ) -> ServerResult<Fetched> {
        self.require(self.definition.flags.get, "get")?;
        authorize(&self.definition, principal)?;
        if !is_valid_key(key) {
            return Err(ServerError::NotFound(format!("invalid key '{key}'")));
        }

        let (json, etag) = match &self.changes {
            Some(changes) => {
                let row = changes
                    .state(key)
                    .filter(|row| !row.deleted)
                    .ok_or_else(|| self.invisible(key, false))?;
                (row.json, row.etag)
            }
            None => {
                let constraint = scoped_constraint(&self.definition, principal);
                match self
                    .source
                    .find(self.key_attribute(), key, constraint.as_deref())?
                {
                    Some(record) => self.publish(&record)?,
                    None => {
                        let exists = constraint.is_some()
                            && self.source.find(self.key_attribute(), key, None)?.is_some();
                        return Err(self.invisible(key, exists));
                    }
                }
            }
        };

        if if_none_match.is_some_and(|tag| tags_match(tag, &etag)) {
            Ok(Fetched::NotModified { etag })
        } else {
            Ok(Fetched::Found { json, etag })
        }
    }

    // ----- write path -----

    /// Creates an object from `payload`. Returns the new key.
    ///
    /// # Errors
    ///
    /// `MethodNotAllowed` if create is disabled, `BadRequest` if the key
    /// already exists, `Configuration` if the update callback assigned no
    /// valid key.
    pub fn post(&self, principal: &Principal, payload: &Value) -> ServerResult<String> {
        self.require(self.definition.flags.create, "create")?;
        authorize(&self.definition, principal)?;

        let mut record = Record::new();
        self.callbacks.update(&mut record, payload)?;
        let key = self.record_key(&record).ok_or_else(|| {
            ServerError::Configuration(format!(
                "update callback of service '{}' did not assign a valid key",
                self.definition.name
            ))
        })?;

        let _guard = self.locks.lock(&key);
        let mut tx = self.source.begin()?;
        if tx.find(self.key_attribute(), &key, None)?.is_some() {
            return Err(ServerError::BadRequest(format!(
                "object '{key}' already exists"
            )));
        }
        tx.save(self.key_attribute(), record)?;
        tx.commit()?;

        debug!(service = %self.definition.name, key = %key, "created object");
        self.publish_key(&key)?;
        Ok(key)
    }

    /// Creates or updates the object at `key`.
    ///
    /// `supplied_tag` is the caller's `If-Match` (or `If-None-Match`) tag,
    /// checked against the current one under strict versioning.
    ///
    /// # Errors
    ///
    /// `NotFound` for an invalid key, `BadRequest` for a key outside the
    /// caller's scope, `MethodNotAllowed` for a disabled operation, and
    /// `Conflict` for a stale tag.
    pub fn put(
        &self,
        principal: &Principal,
        key: &str,
        payload: &Value,
        supplied_tag: Option<&str>,
    ) -> ServerResult<PutOutcome> {
        if !is_valid_key(key) {
            return Err(ServerError::NotFound(format!("invalid key '{key}'")));
        }
        authorize(&self.definition, principal)?;
        let constraint = scoped_constraint(&self.definition, principal);

        let _guard = self.locks.lock(key);
        let mut tx = self.source.begin()?;

        let outcome = match tx.find(self.key_attribute(), key, constraint.as_deref())? {
            None => {
                if constraint.is_some() && tx.find(self.key_attribute(), key, None)?.is_some() {
                    return Err(ServerError::BadRequest(format!(
                        "object '{key}' exists outside the visible scope"
                    )));
                }
                self.require(self.definition.flags.create, "create")?;

                let mut record = Record::new();
                record.insert(
                    self.key_attribute().to_string(),
                    Value::String(key.to_string()),
                );
                self.apply_payload(&mut record, key, payload)?;
                tx.save(self.key_attribute(), record)?;
                PutOutcome::Created
            }
            Some(mut record) => {
                self.require(self.definition.flags.update, "update")?;
                self.verify_etag(key, &record, supplied_tag)?;
                self.apply_payload(&mut record, key, payload)?;
                tx.save(self.key_attribute(), record)?;
                PutOutcome::Updated
            }
        };
        tx.commit()?;

        debug!(service = %self.definition.name, key, ?outcome, "stored object");
        self.publish_key(key)?;
        Ok(outcome)
    }

    /// Deletes the object at `key`.
    ///
    /// # Errors
    ///
    /// `MethodNotAllowed` if delete is disabled, `Unauthorized`/`NotFound`
    /// for invisible keys, and `Conflict` for a stale tag.
    pub fn delete(
        &self,
        principal: &Principal,
        key: &str,
        supplied_tag: Option<&str>,
    ) -> ServerResult<()> {
        self.require(self.definition.flags.delete, "delete")?;
        authorize(&self.definition, principal)?;
        if !is_valid_key(key) {
            return Err(ServerError::NotFound(format!("invalid key '{key}'")));
        }
        let constraint = scoped_constraint(&self.definition, principal);

        let _guard = self.locks.lock(key);
        let mut tx = self.source.begin()?;

        let Some(record) = tx.find(self.key_attribute(), key, constraint.as_deref())? else {
            let exists =
                constraint.is_some() && tx.find(self.key_attribute(), key, None)?.is_some();
            return Err(self.invisible(key, exists));
        };

        self.verify_etag(key, &record, supplied_tag)?;
        if !self.callbacks.delete(&mut *tx, &record)? {
            tx.delete(self.key_attribute(), key)?;
        }
        tx.commit()?;

        debug!(service = %self.definition.name, key, "deleted object");
        self.publish_key(key)?;
        Ok(())
    }

    fn apply_payload(&self, record: &mut Record, key: &str, payload: &Value) -> ServerResult<()> {
        self.callbacks.update(record, payload)?;
        match self.record_key(record) {
            Some(assigned) if assigned == key => Ok(()),
            _ => Err(ServerError::BadRequest(format!(
                "update may not change the key of object '{key}'"
            ))),
        }
    }

    /// Checks the caller's tag against the current one.
    ///
    /// Passes unconditionally unless strict versioning is enabled.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` carrying both tags on mismatch, including when the
    /// caller supplied no tag.
    pub fn verify_etag(
        &self,
        key: &str,
        record: &Record,
        supplied_tag: Option<&str>,
    ) -> ServerResult<()> {
        if !self.definition.flags.strict_versioning {
            return Ok(());
        }

        let tracked = self
            .changes
            .as_ref()
            .and_then(|changes| changes.state(key))
            .filter(|row| !row.deleted)
            .map(|row| row.etag);
        let current = match tracked {
            Some(etag) => etag,
            None => self.publish(record)?.1,
        };

        match supplied_tag {
            Some(tag) if tags_match(tag, &current) => Ok(()),
            supplied => Err(ServerError::Conflict {
                current,
                supplied: supplied.map(normalize_tag).unwrap_or_default().to_string(),
            }),
        }
    }

    // ----- change tracking -----

    /// Re-reads `key` from the source and records its current state.
    ///
    /// Domain code that changes the collection outside of HTTP requests
    /// calls this to keep the change feed complete. Returns the assigned
    /// revision, or `None` when nothing changed or tracking is off.
    ///
    /// # Errors
    ///
    /// Fails if the source, the publish transform, or the index fails.
    pub fn publish_key(&self, key: &str) -> ServerResult<Option<Revision>> {
        let Some(changes) = &self.changes else {
            return Ok(None);
        };
        if !is_valid_key(key) {
            return Err(ServerError::BadRequest(format!("invalid key '{key}'")));
        }

        match self.source.find(
            self.key_attribute(),
            key,
            self.definition.constraint.as_deref(),
        )? {
            Some(record) => {
                let view = self.callbacks.publish(&record)?;
                changes.record_change(key, Some(&view))
            }
            None => changes.record_change(key, None),
        }
    }

    /// Records the deletion of `key` without consulting the source.
    ///
    /// # Errors
    ///
    /// Fails if the index cannot be written.
    pub fn publish_deleted(&self, key: &str) -> ServerResult<Option<Revision>> {
        match &self.changes {
            Some(changes) => changes.record_change(key, None),
            None => Ok(None),
        }
    }

    /// Rebuilds the object state index from the source collection.
    ///
    /// # Errors
    ///
    /// `NotFound` if tracking is off; otherwise the first source, publish,
    /// or index failure.
    pub fn rebuild_index(&self) -> ServerResult<usize> {
        let changes = self.tracked()?;
        changes.rebuild_index(
            self.source.as_ref(),
            self.key_attribute(),
            self.definition.constraint.as_deref(),
            self.batch_size,
            |record| match self.record_key(record) {
                Some(key) => Ok(Some((key, self.callbacks.publish(record)?))),
                None => Ok(None),
            },
        )
    }

    /// Returns every change after `since`, ascending by revision.
    ///
    /// # Errors
    ///
    /// `NotFound` if tracking is off, `Unauthorized` without the role.
    pub fn changes_list(
        &self,
        principal: &Principal,
        since: Revision,
    ) -> ServerResult<Vec<ChangeRecord>> {
        let changes = self.tracked()?;
        authorize(&self.definition, principal)?;

        let mut out = Vec::new();
        let mut cursor = since;
        loop {
            let batch = changes.changes_since(cursor, self.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.revision;
            out.extend(batch);
        }
        Ok(out)
    }

    /// Checks that `principal` may read the change feed.
    ///
    /// # Errors
    ///
    /// `NotFound` if tracking is off, `Unauthorized` without the role.
    pub fn authorize_feed(&self, principal: &Principal) -> ServerResult<()> {
        self.tracked()?;
        authorize(&self.definition, principal)
    }

    /// Streams changes after `since` to `out`, one JSON object per line.
    ///
    /// The feed stays open until `timeout_ms` elapses. A timeout of 0 never
    /// expires; a negative timeout also ends the feed after the first batch
    /// of changes. Idle connections receive a blank-line heartbeat every
    /// heartbeat interval so that vanished clients surface as write errors.
    ///
    /// # Errors
    ///
    /// `Io` when the client goes away; `NotFound` if tracking is off.
    pub fn serve_feed<W: Write + ?Sized>(
        &self,
        since: Revision,
        timeout_ms: i64,
        out: &mut W,
    ) -> ServerResult<()> {
        let changes = self.tracked()?;

        let started = Instant::now();
        let deadline =
            (timeout_ms != 0).then(|| started + Duration::from_millis(timeout_ms.unsigned_abs()));
        let close_after_batch = timeout_ms < 0;
        let mut cursor = since;
        let mut sent = 0usize;

        loop {
            let batch = changes.changes_since(cursor, self.batch_size)?;
            if !batch.is_empty() {
                for record in &batch {
                    write_feed_entry(out, record)?;
                    cursor = record.revision;
                }
                out.flush()?;
                sent += batch.len();
                if close_after_batch {
                    break;
                }
                continue;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    remaining.min(self.heartbeat_interval)
                }
                None => self.heartbeat_interval,
            };

            if !changes.wait_for_change(cursor, wait) {
                let expired = deadline.is_some_and(|d| Instant::now() >= d);
                if !expired {
                    out.write_all(FEED_HEARTBEAT)?;
                    out.flush()?;
                }
            }
        }

        info!(
            service = %self.definition.name,
            since,
            sent,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "feed closed"
        );
        Ok(())
    }
}

/// Strips weak-tag markers and quotes from a header tag.
pub(crate) fn normalize_tag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(tag)
}

fn tags_match(supplied: &str, current: &str) -> bool {
    supplied
        .split(',')
        .any(|tag| tag.trim() == "*" || normalize_tag(tag) == current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryCollection;
    use restfeed_protocol::ServiceFlags;
    use serde_json::json;
    use std::thread;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn callbacks() -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        registry.register_update("merge", |r, payload| {
            let fields = payload.as_object().ok_or("payload must be an object")?;
            r.extend(fields.clone());
            Ok(())
        });
        registry
    }

    fn service(flags: ServiceFlags, source: Arc<MemoryCollection>) -> PublishedService {
        let def = ServiceDefinition::new("tasks", "Task", "code")
            .with_flags(flags)
            .with_update("merge");
        PublishedService::new(def, source, &callbacks(), &ServerConfig::default()).unwrap()
    }

    fn tracked_service() -> PublishedService {
        service(ServiceFlags::all(), Arc::new(MemoryCollection::new()))
    }

    fn anyone() -> Principal {
        Principal::anonymous()
    }

    fn found(fetched: Fetched) -> (String, String) {
        match fetched {
            Fetched::Found { json, etag } => (json, etag),
            other => panic!("expected body, got {other:?}"),
        }
    }

    #[test]
    fn tag_normalization() {
        assert_eq!(normalize_tag("\"abc\""), "abc");
        assert_eq!(normalize_tag("W/\"abc\""), "abc");
        assert_eq!(normalize_tag(" abc "), "abc");
        assert!(tags_match("\"x\", \"abc\"", "abc"));
        assert!(tags_match("*", "abc"));
        assert!(!tags_match("\"abd\"", "abc"));
    }

    #[test]
    fn put_creates_then_updates() {
        let svc = tracked_service();
        let (_, etag) = {
            let outcome = svc.put(&anyone(), "k1", &json!({"title": "a"}), None).unwrap();
            assert_eq!(outcome, PutOutcome::Created);
            found(svc.get(&anyone(), "k1", None).unwrap())
        };

        let outcome = svc
            .put(&anyone(), "k1", &json!({"title": "b"}), Some(format!("\"{etag}\"").as_str()))
            .unwrap();
        assert_eq!(outcome, PutOutcome::Updated);

        let (json, _) = found(svc.get(&anyone(), "k1", None).unwrap());
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"code": "k1", "title": "b"}));
    }

    #[test]
    fn conditional_get() {
        let svc = tracked_service();
        svc.put(&anyone(), "k1", &json!({"title": "a"}), None).unwrap();
        let (_, etag) = found(svc.get(&anyone(), "k1", None).unwrap());

        let fetched = svc.get(&anyone(), "k1", Some(format!("\"{etag}\"").as_str())).unwrap();
        assert_eq!(fetched, Fetched::NotModified { etag: etag.clone() });

        svc.put(&anyone(), "k1", &json!({"title": "b"}), Some(etag.as_str())).unwrap();
        let (_, newer) = found(svc.get(&anyone(), "k1", Some(etag.as_str())).unwrap());
        assert_ne!(newer, etag);
    }

    #[test]
    fn stale_tag_conflicts() {
        let svc = tracked_service();
        svc.put(&anyone(), "k1", &json!({"title": "a"}), None).unwrap();
        let (_, etag) = found(svc.get(&anyone(), "k1", None).unwrap());

        svc.put(&anyone(), "k1", &json!({"title": "b"}), Some(etag.as_str())).unwrap();
        let err = svc
            .put(&anyone(), "k1", &json!({"title": "c"}), Some(etag.as_str()))
            .unwrap_err();
        match err {
            ServerError::Conflict { current, supplied } => {
                assert_ne!(current, etag);
                assert_eq!(supplied, etag);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let err = svc.put(&anyone(), "k1", &json!({"title": "c"}), None).unwrap_err();
        assert!(matches!(err, ServerError::Conflict { .. }));
    }

    #[test]
    fn concurrent_writers_with_same_tag() {
        let svc = Arc::new(tracked_service());
        svc.put(&anyone(), "k1", &json!({"n": 0}), None).unwrap();
        let (_, etag) = found(svc.get(&anyone(), "k1", None).unwrap());

        let handles: Vec<_> = (1..=4)
            .map(|n| {
                let svc = Arc::clone(&svc);
                let etag = etag.clone();
                thread::spawn(move || svc.put(&anyone(), "k1", &json!({ "n": n }), Some(etag.as_str())))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ServerError::Conflict { .. })));
    }

    #[test]
    fn delete_leaves_tombstone() {
        let svc = tracked_service();
        svc.put(&anyone(), "k1", &json!({"title": "a"}), None).unwrap();
        let (_, etag) = found(svc.get(&anyone(), "k1", None).unwrap());

        svc.delete(&anyone(), "k1", Some(etag.as_str())).unwrap();
        let err = svc.get(&anyone(), "k1", None).unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let changes = svc.changes_list(&anyone(), 0).unwrap();
        let last = changes.last().unwrap();
        assert!(last.deleted);
        assert_eq!(last.key, "k1");
        assert_eq!(last.revision, 2);
    }

    #[test]
    fn post_assigns_key_from_payload() {
        let svc = tracked_service();
        let key = svc.post(&anyone(), &json!({"code": "new", "title": "x"})).unwrap();
        assert_eq!(key, "new");

        let err = svc.post(&anyone(), &json!({"code": "new"})).unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        let err = svc.post(&anyone(), &json!({"title": "no key"})).unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
    }

    #[test]
    fn disabled_operations_are_rejected() {
        let source = Arc::new(MemoryCollection::new());
        source.insert(record(json!({"code": "a"})));
        let svc = service(
            ServiceFlags {
                create: false,
                update: true,
                ..ServiceFlags::read_only()
            },
            source,
        );

        let err = svc.put(&anyone(), "new", &json!({}), None).unwrap_err();
        assert!(matches!(err, ServerError::MethodNotAllowed(_)));
        let err = svc.delete(&anyone(), "a", None).unwrap_err();
        assert!(matches!(err, ServerError::MethodNotAllowed(_)));
        assert!(svc.put(&anyone(), "a", &json!({"x": 1}), None).is_ok());
    }

    #[test]
    fn key_change_is_rejected() {
        let svc = tracked_service();
        svc.put(&anyone(), "k1", &json!({}), None).unwrap();
        let (_, etag) = found(svc.get(&anyone(), "k1", None).unwrap());
        let err = svc
            .put(&anyone(), "k1", &json!({"code": "k2"}), Some(etag.as_str()))
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[test]
    fn scope_distinguishes_unauthorized_from_missing() {
        let source = Arc::new(MemoryCollection::new());
        source.insert(record(json!({"code": "mine", "owner": "u1"})));
        source.insert(record(json!({"code": "theirs", "owner": "u2"})));

        let def = ServiceDefinition::new("tasks", "Task", "code")
            .with_constraint("owner = '[%CurrentUser%]'")
            .with_flags(ServiceFlags {
                change_tracking: false,
                ..ServiceFlags::all()
            })
            .with_update("merge");
        let svc = PublishedService::new(def, source, &callbacks(), &ServerConfig::default()).unwrap();
        let u1 = Principal::user("u1");

        assert!(svc.get(&u1, "mine", None).is_ok());
        assert!(matches!(
            svc.get(&u1, "theirs", None).unwrap_err(),
            ServerError::Unauthorized(_)
        ));
        assert!(matches!(
            svc.get(&u1, "nobody", None).unwrap_err(),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            svc.put(&u1, "theirs", &json!({}), None).unwrap_err(),
            ServerError::BadRequest(_)
        ));
        assert!(matches!(
            svc.delete(&u1, "theirs", None).unwrap_err(),
            ServerError::Unauthorized(_)
        ));

        let listed = svc.list(&u1, false).unwrap();
        assert_eq!(listed, vec![json!("http://localhost:8080/rest/tasks/mine")]);
    }

    #[test]
    fn per_user_constraint_cannot_be_tracked() {
        let def = ServiceDefinition::new("tasks", "Task", "code")
            .with_constraint("owner = '[%CurrentUser%]'")
            .with_flags(ServiceFlags::all())
            .with_update("merge");
        let result = PublishedService::new(
            def,
            Arc::new(MemoryCollection::new()),
            &callbacks(),
            &ServerConfig::default(),
        );
        assert!(matches!(result, Err(ServerError::Configuration(_))));
    }

    #[test]
    fn list_in_key_order_with_small_batches() {
        let source = Arc::new(MemoryCollection::new());
        for code in ["c", "a", "b"] {
            source.insert(record(json!({ "code": code })));
        }
        let def = ServiceDefinition::new("tasks", "Task", "code");
        let config = ServerConfig::default().with_batch_size(2);
        let svc = PublishedService::new(def, source, &callbacks(), &config).unwrap();

        let listed = svc.list(&anyone(), true).unwrap();
        assert_eq!(
            listed,
            vec![json!({"code": "a"}), json!({"code": "b"}), json!({"code": "c"})]
        );
    }

    #[test]
    fn publish_key_tracks_out_of_band_changes() {
        let source = Arc::new(MemoryCollection::new());
        let svc = service(ServiceFlags::all(), Arc::clone(&source));

        source.insert(record(json!({"code": "side", "v": 1})));
        assert_eq!(svc.publish_key("side").unwrap(), Some(1));
        assert_eq!(svc.publish_key("side").unwrap(), None);
        assert_eq!(svc.publish_deleted("side").unwrap(), Some(2));
        assert_eq!(svc.publish_deleted("side").unwrap(), None);
    }

    #[test]
    fn feed_with_negative_timeout_closes_after_batch() {
        let svc = tracked_service();
        for key in ["a", "b", "c"] {
            svc.put(&anyone(), key, &json!({}), None).unwrap();
        }

        let mut out = Vec::new();
        svc.serve_feed(1, -10_000, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let revs: Vec<u64> = text
            .lines()
            .map(|l| serde_json::from_str::<ChangeRecord>(l).unwrap().revision)
            .collect();
        assert_eq!(revs, vec![2, 3]);
    }

    #[test]
    fn feed_times_out_with_heartbeats() {
        let def = ServiceDefinition::new("tasks", "Task", "code")
            .with_flags(ServiceFlags::all())
            .with_update("merge");
        let config = ServerConfig::default().with_heartbeat_interval(Duration::from_millis(10));
        let svc = PublishedService::new(
            def,
            Arc::new(MemoryCollection::new()),
            &callbacks(),
            &config,
        )
        .unwrap();

        let mut out = Vec::new();
        svc.serve_feed(0, 60, &mut out).unwrap();
        assert!(!out.is_empty());
        assert!(out.chunks(2).all(|c| c == FEED_HEARTBEAT));
    }

    #[test]
    fn feed_delivers_change_made_while_waiting() {
        let svc = Arc::new(tracked_service());
        let writer = {
            let svc = Arc::clone(&svc);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                svc.put(&anyone(), "late", &json!({}), None).unwrap();
            })
        };

        let mut out = Vec::new();
        svc.serve_feed(0, -5_000, &mut out).unwrap();
        writer.join().unwrap();

        let record: ChangeRecord = serde_json::from_slice(out.trim_ascii()).unwrap();
        assert_eq!(record.key, "late");
        assert_eq!(record.revision, 1);
    }

    #[test]
    fn rebuild_indexes_existing_records() {
        let source = Arc::new(MemoryCollection::new());
        source.insert(record(json!({"code": "a"})));
        source.insert(record(json!({"code": "b"})));
        let svc = service(ServiceFlags::all(), source);

        assert_eq!(svc.rebuild_index().unwrap(), 2);
        assert_eq!(svc.changes_list(&anyone(), 0).unwrap().len(), 2);
    }
}
