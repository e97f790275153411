//! Local application of received changes.

use crate::error::ConsumeResult;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Applies remote changes to local storage.
///
/// Records arrive strictly in feed order, one at a time. The same record
/// may be delivered more than once after a reconnect, so both operations
/// must be idempotent.
pub trait ChangeApplier {
    /// Local representation of a published object.
    type Record: DeserializeOwned;

    /// Creates or replaces the object stored under `key`.
    fn apply_upsert(&mut self, key: &str, record: Self::Record) -> ConsumeResult<()>;

    /// Removes the object stored under `key`. Unknown keys are not an error.
    fn apply_delete(&mut self, key: &str) -> ConsumeResult<()>;
}

/// An applier that keeps the replicated objects in memory.
///
/// Clones share the same map, so a test can keep one handle while a
/// listener owns another.
#[derive(Debug)]
pub struct MemoryApplier<R> {
    records: Arc<Mutex<BTreeMap<String, R>>>,
    applied: Arc<AtomicU64>,
}

impl<R> MemoryApplier<R> {
    /// Creates an empty applier.
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            applied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Returns how many changes have been applied, duplicates included.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Returns the stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }
}

impl<R: Clone> MemoryApplier<R> {
    /// Returns the object stored under `key`.
    pub fn get(&self, key: &str) -> Option<R> {
        self.records.lock().get(key).cloned()
    }

    /// Returns a copy of all stored objects.
    pub fn snapshot(&self) -> BTreeMap<String, R> {
        self.records.lock().clone()
    }
}

impl<R> Clone for MemoryApplier<R> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            applied: Arc::clone(&self.applied),
        }
    }
}

impl<R> Default for MemoryApplier<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeserializeOwned> ChangeApplier for MemoryApplier<R> {
    type Record = R;

    fn apply_upsert(&mut self, key: &str, record: R) -> ConsumeResult<()> {
        self.records.lock().insert(key.to_string(), record);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn apply_delete(&mut self, key: &str) -> ConsumeResult<()> {
        self.records.lock().remove(key);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
