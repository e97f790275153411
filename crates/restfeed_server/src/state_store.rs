//! Materialized per-service object state index.
//!
//! The store keeps one row per published key: the last serialized
//! representation, its version tag, a tombstone flag, and the revision at
//! which the row last changed. Rows are never removed; deletions flip the
//! tombstone flag so that feed consumers can learn about them.
//!
//! # Durability
//!
//! A store opened with [`ObjectStateStore::open`] appends every row change
//! to a JSON-lines journal and syncs it before the change becomes visible.
//! Reopening replays the journal; the last row written for a key wins. A
//! torn final line (crash during append) is discarded and truncated away.
//! A failed append is rolled back to the last complete line, so a later
//! append never lands behind partial bytes.
//!
//! [`ObjectStateStore::open_read_only`] replays a journal without creating,
//! repairing or appending to it. Tools use it to look at the journal of a
//! running server.
//!
//! # Invariants
//!
//! - Revisions are unique and strictly increasing within a store
//! - Revision assignment, journal append, and row update happen under one
//!   write lock

use crate::error::{ServerError, ServerResult};
use parking_lot::{Mutex, RwLock};
use restfeed_protocol::{compute_etag, Revision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One row of the object state index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    /// Published key.
    pub key: String,
    /// Last serialized representation (empty for rows deleted before ever
    /// carrying data).
    pub json: String,
    /// Version tag of `json`.
    pub etag: String,
    /// Tombstone marker.
    pub deleted: bool,
    /// Revision at which this row last changed.
    pub revision: Revision,
}

#[derive(Debug, Default)]
struct IndexState {
    rows: BTreeMap<String, ObjectState>,
    by_revision: BTreeMap<Revision, String>,
    revision: Revision,
}

impl IndexState {
    fn insert(&mut self, row: ObjectState) {
        if let Some(previous) = self.rows.get(&row.key) {
            self.by_revision.remove(&previous.revision);
        }
        self.revision = self.revision.max(row.revision);
        self.by_revision.insert(row.revision, row.key.clone());
        self.rows.insert(row.key.clone(), row);
    }
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
    /// Length of the complete lines written so far.
    len: u64,
    poisoned: bool,
}

impl Journal {
    fn append(&mut self, row: &ObjectState) -> ServerResult<()> {
        if self.poisoned {
            return Err(ServerError::Storage(format!(
                "object state journal {} could not be repaired after a failed append",
                self.path.display()
            )));
        }
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');

        let file_len = self.file.metadata()?.len();
        if file_len != self.len {
            warn!(
                path = %self.path.display(),
                expected = self.len,
                found = file_len,
                "discarding bytes behind the last journal row"
            );
            self.repair()?;
        }

        if let Err(e) = self.write_line(&line) {
            self.repair()?;
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        self.file.sync_data()
    }

    /// Cuts the file back to the last complete line.
    fn repair(&mut self) -> ServerResult<()> {
        let result = self
            .file
            .set_len(self.len)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = result {
            self.poisoned = true;
            return Err(ServerError::Storage(format!(
                "cannot truncate object state journal {}: {e}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// The object state index of one published service.
#[derive(Debug)]
pub struct ObjectStateStore {
    service: String,
    state: RwLock<IndexState>,
    journal: Option<Mutex<Journal>>,
    read_only: bool,
}

impl ObjectStateStore {
    /// Creates an empty store that lives only in memory.
    pub fn in_memory(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            state: RwLock::new(IndexState::default()),
            journal: None,
            read_only: false,
        }
    }

    /// Opens or creates a journal-backed store, replaying existing rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened, read, or repaired,
    /// or if a line other than the last one is corrupt.
    pub fn open(service: impl Into<String>, path: &Path) -> ServerResult<Self> {
        let service = service.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let (state, valid_len) = Self::replay(&mut file, path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                service = %service,
                path = %path.display(),
                discarded = file_len - valid_len,
                "truncating torn object state journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        debug!(
            service = %service,
            rows = state.rows.len(),
            revision = state.revision,
            "object state journal replayed"
        );

        Ok(Self {
            service,
            state: RwLock::new(state),
            journal: Some(Mutex::new(Journal {
                path: path.to_path_buf(),
                file,
                len: valid_len,
                poisoned: false,
            })),
            read_only: false,
        })
    }

    /// Replays an existing journal without modifying it.
    ///
    /// A torn final line is skipped but left in place. The returned store
    /// rejects [`record`](Self::record).
    ///
    /// # Errors
    ///
    /// Returns an error if the journal does not exist or cannot be read, or
    /// if a line other than the last one is corrupt.
    pub fn open_read_only(service: impl Into<String>, path: &Path) -> ServerResult<Self> {
        let service = service.into();
        let mut file = File::open(path)?;
        let (state, valid_len) = Self::replay(&mut file, path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                service = %service,
                path = %path.display(),
                ignored = file_len - valid_len,
                "ignoring torn object state journal tail"
            );
        }

        Ok(Self {
            service,
            state: RwLock::new(state),
            journal: None,
            read_only: true,
        })
    }

    fn replay(file: &mut File, path: &Path) -> ServerResult<(IndexState, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);
        let mut state = IndexState::default();
        let mut valid_len = 0u64;
        let mut line = String::new();
        let mut line_no = 0usize;

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;

            // An unterminated or unparsable final line is a torn append.
            if !line.ends_with('\n') {
                break;
            }
            match serde_json::from_str::<ObjectState>(line.trim_end()) {
                Ok(row) => {
                    state.insert(row);
                    valid_len += read as u64;
                }
                Err(e) => {
                    let at_end = reader.fill_buf()?.is_empty();
                    if at_end {
                        break;
                    }
                    return Err(ServerError::Storage(format!(
                        "corrupt object state journal {} at line {}: {}",
                        path.display(),
                        line_no,
                        e
                    )));
                }
            }
        }

        Ok((state, valid_len))
    }

    /// Returns the name of the service this index belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the journal path, if the store is persistent.
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.journal.as_ref().map(|j| j.lock().path.clone())
    }

    /// Returns the highest revision assigned so far (0 when empty).
    pub fn latest_revision(&self) -> Revision {
        self.state.read().revision
    }

    /// Returns the row for `key`, including tombstones.
    pub fn get(&self, key: &str) -> Option<ObjectState> {
        self.state.read().rows.get(key).cloned()
    }

    /// Records a new representation (`Some`) or a deletion (`None`) for `key`.
    ///
    /// Returns the written row, or `None` when nothing changed: the
    /// representation is identical to the live row, or a key that was never
    /// published (or is already deleted) is deleted again.
    ///
    /// # Errors
    ///
    /// Returns an error if the store was opened read-only or the journal
    /// append fails; the row is then not updated and no revision is
    /// consumed.
    pub fn record(&self, key: &str, json: Option<String>) -> ServerResult<Option<ObjectState>> {
        if self.read_only {
            return Err(ServerError::Storage(format!(
                "object state of service '{}' is open read-only",
                self.service
            )));
        }
        let mut state = self.state.write();
        let current = state.rows.get(key);

        let row = match (json, current) {
            (None, None) => return Ok(None),
            (None, Some(existing)) if existing.deleted => return Ok(None),
            (None, Some(existing)) => ObjectState {
                key: key.to_string(),
                json: existing.json.clone(),
                etag: existing.etag.clone(),
                deleted: true,
                revision: state.revision + 1,
            },
            (Some(json), current) => {
                let etag = compute_etag(&json);
                if let Some(existing) = current {
                    if !existing.deleted && existing.etag == etag {
                        return Ok(None);
                    }
                }
                ObjectState {
                    key: key.to_string(),
                    json,
                    etag,
                    deleted: false,
                    revision: state.revision + 1,
                }
            }
        };

        if let Some(journal) = &self.journal {
            journal.lock().append(&row)?;
        }

        state.insert(row.clone());
        Ok(Some(row))
    }

    /// Returns rows changed after `since`, in ascending revision order.
    pub fn changed_since(&self, since: Revision, limit: usize) -> Vec<ObjectState> {
        let state = self.state.read();
        state
            .by_revision
            .range((Bound::Excluded(since), Bound::Unbounded))
            .take(limit)
            .filter_map(|(_, key)| state.rows.get(key).cloned())
            .collect()
    }

    /// Returns live (non-deleted) rows with keys after `after`, ascending.
    pub fn live_after(&self, after: Option<&str>, limit: usize) -> Vec<ObjectState> {
        let state = self.state.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        state
            .rows
            .range((lower, Bound::Unbounded))
            .map(|(_, row)| row)
            .filter(|row| !row.deleted)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the keys of all live rows, ascending.
    pub fn live_keys(&self) -> Vec<String> {
        self.state
            .read()
            .rows
            .values()
            .filter(|row| !row.deleted)
            .map(|row| row.key.clone())
            .collect()
    }

    /// Returns `(live rows, tombstones)`.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.read();
        let tombstones = state.rows.values().filter(|row| row.deleted).count();
        (state.rows.len() - tombstones, tombstones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn revisions_increase_per_change() {
        let store = ObjectStateStore::in_memory("tasks");
        assert_eq!(store.latest_revision(), 0);

        let a = store.record("a", Some("{\"v\":1}".into())).unwrap().unwrap();
        let b = store.record("b", Some("{\"v\":1}".into())).unwrap().unwrap();
        let a2 = store.record("a", Some("{\"v\":2}".into())).unwrap().unwrap();

        assert_eq!((a.revision, b.revision, a2.revision), (1, 2, 3));
        assert_eq!(store.latest_revision(), 3);
    }

    #[test]
    fn identical_representation_is_not_a_change() {
        let store = ObjectStateStore::in_memory("tasks");
        store.record("a", Some("{}".into())).unwrap();
        assert!(store.record("a", Some("{}".into())).unwrap().is_none());
        assert_eq!(store.latest_revision(), 1);
    }

    #[test]
    fn deletion_keeps_a_tombstone() {
        let store = ObjectStateStore::in_memory("tasks");
        store.record("a", Some("{}".into())).unwrap();
        let row = store.record("a", None).unwrap().unwrap();

        assert!(row.deleted);
        assert_eq!(row.revision, 2);
        assert!(store.get("a").unwrap().deleted);
        assert_eq!(store.counts(), (0, 1));

        // Deleting again, or deleting an unknown key, records nothing.
        assert!(store.record("a", None).unwrap().is_none());
        assert!(store.record("zzz", None).unwrap().is_none());
    }

    #[test]
    fn republish_after_delete_revives_row() {
        let store = ObjectStateStore::in_memory("tasks");
        store.record("a", Some("{}".into())).unwrap();
        store.record("a", None).unwrap();
        let row = store.record("a", Some("{}".into())).unwrap().unwrap();
        assert!(!row.deleted);
        assert_eq!(row.revision, 3);
    }

    #[test]
    fn changed_since_collapses_per_key() {
        let store = ObjectStateStore::in_memory("tasks");
        store.record("a", Some("1".into())).unwrap();
        store.record("b", Some("1".into())).unwrap();
        store.record("a", Some("2".into())).unwrap();

        let changes = store.changed_since(0, 10);
        let revs: Vec<_> = changes.iter().map(|r| (r.key.as_str(), r.revision)).collect();
        assert_eq!(revs, vec![("b", 2), ("a", 3)]);

        assert_eq!(store.changed_since(2, 10).len(), 1);
        assert_eq!(store.changed_since(0, 1).len(), 1);
    }

    #[test]
    fn live_rows_page_by_key() {
        let store = ObjectStateStore::in_memory("tasks");
        for key in ["c", "a", "d", "b"] {
            store.record(key, Some("{}".into())).unwrap();
        }
        store.record("c", None).unwrap();

        let first = store.live_after(None, 2);
        assert_eq!(first.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let rest = store.live_after(Some("b"), 2);
        assert_eq!(rest.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(), ["d"]);

        assert_eq!(store.live_keys(), vec!["a", "b", "d"]);
    }

    #[test]
    fn journal_replay_restores_rows_and_counter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.objectstate.jsonl");

        {
            let store = ObjectStateStore::open("tasks", &path).unwrap();
            store.record("a", Some("{\"v\":1}".into())).unwrap();
            store.record("b", Some("{\"v\":1}".into())).unwrap();
            store.record("a", None).unwrap();
        }

        let store = ObjectStateStore::open("tasks", &path).unwrap();
        assert_eq!(store.latest_revision(), 3);
        assert!(store.get("a").unwrap().deleted);
        assert_eq!(store.changed_since(0, 10).len(), 2);

        let row = store.record("c", Some("{}".into())).unwrap().unwrap();
        assert_eq!(row.revision, 4);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.objectstate.jsonl");

        {
            let store = ObjectStateStore::open("tasks", &path).unwrap();
            store.record("a", Some("{}".into())).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"key\":\"b\",\"json\":").unwrap();
        }

        let store = ObjectStateStore::open("tasks", &path).unwrap();
        assert_eq!(store.latest_revision(), 1);
        assert!(store.get("b").is_none());

        store.record("b", Some("{}".into())).unwrap();
        drop(store);

        let store = ObjectStateStore::open("tasks", &path).unwrap();
        assert_eq!(store.latest_revision(), 2);
        assert!(store.get("b").is_some());
    }

    #[test]
    fn append_discards_partial_bytes_of_a_failed_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.objectstate.jsonl");

        let store = ObjectStateStore::open("tasks", &path).unwrap();
        store.record("a", Some("{}".into())).unwrap();
        {
            // What a write that failed halfway leaves behind.
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"key\":\"b\",\"js").unwrap();
        }
        store.record("c", Some("{}".into())).unwrap();
        store.record("d", Some("{}".into())).unwrap();
        drop(store);

        let store = ObjectStateStore::open("tasks", &path).unwrap();
        assert_eq!(store.latest_revision(), 3);
        assert_eq!(store.live_keys(), vec!["a", "c", "d"]);
        assert_eq!(store.get("d").unwrap().revision, 3);
    }

    #[test]
    fn read_only_open_leaves_journal_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.objectstate.jsonl");
        {
            let store = ObjectStateStore::open("tasks", &path).unwrap();
            store.record("a", Some("{}".into())).unwrap();
            store.record("b", Some("{}".into())).unwrap();
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"key\":\"c\"").unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let store = ObjectStateStore::open_read_only("tasks", &path).unwrap();
        assert_eq!(store.latest_revision(), 2);
        assert_eq!(store.live_keys(), vec!["a", "b"]);
        assert!(matches!(
            store.record("c", Some("{}".into())),
            Err(ServerError::Storage(_))
        ));
        drop(store);
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let missing = dir.path().join("notes.objectstate.jsonl");
        assert!(ObjectStateStore::open_read_only("notes", &missing).is_err());
        assert!(!missing.exists());
    }
}
