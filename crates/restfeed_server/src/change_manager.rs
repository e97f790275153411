//! Revision assignment and change log access for one service.

use crate::error::ServerResult;
use crate::source::{Record, SourceCollection};
use crate::state_store::{ObjectState, ObjectStateStore};
use parking_lot::{Condvar, Mutex};
use restfeed_protocol::{ChangeRecord, Revision};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Owns the object state index of a service and its change log.
///
/// Every create, update, or delete of a tracked object passes through
/// [`ChangeManager::record_change`], which assigns the next revision and
/// upserts the index row in one critical section. Long-poll readers block
/// in [`ChangeManager::wait_for_change`] until a newer revision exists.
pub struct ChangeManager {
    store: ObjectStateStore,
    latest: Mutex<Revision>,
    changed: Condvar,
}

impl ChangeManager {
    /// Creates a change manager over an existing store.
    pub fn new(store: ObjectStateStore) -> Self {
        let latest = store.latest_revision();
        Self {
            store,
            latest: Mutex::new(latest),
            changed: Condvar::new(),
        }
    }

    /// Returns the underlying index.
    pub fn store(&self) -> &ObjectStateStore {
        &self.store
    }

    /// Returns the highest revision recorded so far.
    pub fn latest_revision(&self) -> Revision {
        self.store.latest_revision()
    }

    /// Returns the index row for `key`, including tombstones.
    pub fn state(&self, key: &str) -> Option<ObjectState> {
        self.store.get(key)
    }

    /// Returns live rows with keys after `after_key`, ascending by key.
    pub fn list_live(&self, after_key: Option<&str>, limit: usize) -> Vec<ObjectState> {
        self.store.live_after(after_key, limit)
    }

    /// Records a new representation (`Some`) or a deletion (`None`).
    ///
    /// Returns the assigned revision, or `None` if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the representation cannot be serialized or the
    /// index cannot be persisted.
    pub fn record_change(&self, key: &str, data: Option<&Value>) -> ServerResult<Option<Revision>> {
        let json = data.map(serde_json::to_string).transpose()?;
        let Some(row) = self.store.record(key, json)? else {
            debug!(service = %self.store.service(), key, "no change to record");
            return Ok(None);
        };

        info!(
            service = %self.store.service(),
            key,
            revision = row.revision,
            deleted = row.deleted,
            "recorded change"
        );

        let mut latest = self.latest.lock();
        *latest = (*latest).max(row.revision);
        self.changed.notify_all();

        Ok(Some(row.revision))
    }

    /// Returns up to `limit` changes after `since`, in ascending revision.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored representation is not valid JSON.
    pub fn changes_since(&self, since: Revision, limit: usize) -> ServerResult<Vec<ChangeRecord>> {
        self.store
            .changed_since(since, limit)
            .into_iter()
            .map(|row| to_change_record(&row))
            .collect()
    }

    /// Blocks until a revision greater than `after` exists or `max_wait`
    /// elapses. Returns true if a newer revision exists.
    pub fn wait_for_change(&self, after: Revision, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut latest = self.latest.lock();
        while *latest <= after {
            if self.changed.wait_until(&mut latest, deadline).timed_out() {
                break;
            }
        }
        *latest > after
    }

    /// Rebuilds the index from the source collection.
    ///
    /// Every in-scope record is published through `publish`; rows whose key
    /// no longer appears are tombstoned. Unchanged objects keep their
    /// revision. Returns the number of revisions assigned.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the source, the transform, or the
    /// index.
    pub fn rebuild_index<F>(
        &self,
        source: &dyn SourceCollection,
        key_attribute: &str,
        constraint: Option<&str>,
        batch_size: usize,
        publish: F,
    ) -> ServerResult<usize>
    where
        F: Fn(&Record) -> ServerResult<Option<(String, Value)>>,
    {
        let mut seen = std::collections::HashSet::new();
        let mut assigned = 0usize;
        let mut offset = 0usize;

        loop {
            let batch = source.scan(key_attribute, constraint, offset, batch_size)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();

            for record in &batch {
                if let Some((key, view)) = publish(record)? {
                    if self.record_change(&key, Some(&view))?.is_some() {
                        assigned += 1;
                    }
                    seen.insert(key);
                }
            }
        }

        for key in self.store.live_keys() {
            if !seen.contains(&key) && self.record_change(&key, None)?.is_some() {
                assigned += 1;
            }
        }

        info!(
            service = %self.store.service(),
            objects = seen.len(),
            revisions = assigned,
            "rebuilt object state index"
        );
        Ok(assigned)
    }
}

/// Converts an index row into its wire form.
pub(crate) fn to_change_record(row: &ObjectState) -> ServerResult<ChangeRecord> {
    if row.deleted {
        Ok(ChangeRecord::deletion(row.revision, row.key.clone()))
    } else {
        let data: Value = serde_json::from_str(&row.json)?;
        Ok(ChangeRecord::upsert(row.revision, row.key.clone(), data))
    }
}
