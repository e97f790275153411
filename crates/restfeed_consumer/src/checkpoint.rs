//! Persistent follow state.
//!
//! A checkpoint records the highest revision applied for a collection URL.
//! Listeners resume from it after a restart.

use crate::error::{ConsumeError, ConsumeResult};
use parking_lot::Mutex;
use restfeed_protocol::Revision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Checkpoint of one followed collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowState {
    /// Collection URL, normalized with a trailing slash.
    pub collection_url: String,
    /// Highest revision applied so far.
    pub revision: Revision,
}

/// Storage for follow state.
pub trait FollowStateStore: Send + Sync {
    /// Loads the checkpoint of a collection.
    fn load(&self, collection_url: &str) -> ConsumeResult<Option<FollowState>>;

    /// Stores a checkpoint, replacing any previous one for the same URL.
    fn save(&self, state: &FollowState) -> ConsumeResult<()>;

    /// Removes the checkpoint of a collection. Returns false if none existed.
    fn remove(&self, collection_url: &str) -> ConsumeResult<bool>;

    /// Returns all checkpoints ordered by URL.
    fn list(&self) -> ConsumeResult<Vec<FollowState>>;
}

/// In-memory follow state. Lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryFollowStore {
    states: Mutex<BTreeMap<String, Revision>>,
}

impl MemoryFollowStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FollowStateStore for MemoryFollowStore {
    fn load(&self, collection_url: &str) -> ConsumeResult<Option<FollowState>> {
        Ok(self
            .states
            .lock()
            .get(collection_url)
            .map(|&revision| FollowState {
                collection_url: collection_url.to_string(),
                revision,
            }))
    }

    fn save(&self, state: &FollowState) -> ConsumeResult<()> {
        self.states
            .lock()
            .insert(state.collection_url.clone(), state.revision);
        Ok(())
    }

    fn remove(&self, collection_url: &str) -> ConsumeResult<bool> {
        Ok(self.states.lock().remove(collection_url).is_some())
    }

    fn list(&self) -> ConsumeResult<Vec<FollowState>> {
        Ok(self
            .states
            .lock()
            .iter()
            .map(|(url, &revision)| FollowState {
                collection_url: url.clone(),
                revision,
            })
            .collect())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FollowFile {
    follows: Vec<FollowState>,
}

/// Follow state kept in a single JSON file.
///
/// Every save rewrites the file through a synced temporary file and a
/// rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileFollowStore {
    path: PathBuf,
    states: Mutex<BTreeMap<String, Revision>>,
}

impl FileFollowStore {
    /// Opens the store at `path`, creating it on first save.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if an existing file cannot be read or
    /// parsed.
    pub fn open(path: impl AsRef<Path>) -> ConsumeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let states = Self::read(&path)?;
        Ok(Self {
            path,
            states: Mutex::new(states),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> ConsumeResult<BTreeMap<String, Revision>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(ConsumeError::Checkpoint(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }

        let file: FollowFile = serde_json::from_slice(&data).map_err(|e| {
            ConsumeError::Checkpoint(format!("corrupt checkpoint file {}: {e}", path.display()))
        })?;
        Ok(file
            .follows
            .into_iter()
            .map(|state| (state.collection_url, state.revision))
            .collect())
    }

    fn persist(&self, states: &BTreeMap<String, Revision>) -> ConsumeResult<()> {
        let file = FollowFile {
            follows: states
                .iter()
                .map(|(url, &revision)| FollowState {
                    collection_url: url.clone(),
                    revision,
                })
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| ConsumeError::Checkpoint(e.to_string()))?;

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&temp_path)?;
            out.write_all(&data)?;
            out.sync_all()?;
            drop(out);
            fs::rename(&temp_path, &self.path)
        };
        write().map_err(|e| {
            ConsumeError::Checkpoint(format!("cannot write {}: {e}", self.path.display()))
        })
    }
}

impl FollowStateStore for FileFollowStore {
    fn load(&self, collection_url: &str) -> ConsumeResult<Option<FollowState>> {
        Ok(self
            .states
            .lock()
            .get(collection_url)
            .map(|&revision| FollowState {
                collection_url: collection_url.to_string(),
                revision,
            }))
    }

    fn save(&self, state: &FollowState) -> ConsumeResult<()> {
        let mut states = self.states.lock();
        let previous = states.insert(state.collection_url.clone(), state.revision);
        if previous == Some(state.revision) {
            return Ok(());
        }
        if let Err(e) = self.persist(&states) {
            match previous {
                Some(revision) => states.insert(state.collection_url.clone(), revision),
                None => states.remove(&state.collection_url),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, collection_url: &str) -> ConsumeResult<bool> {
        let mut states = self.states.lock();
        let Some(revision) = states.remove(collection_url) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&states) {
            states.insert(collection_url.to_string(), revision);
            return Err(e);
        }
        Ok(true)
    }

    fn list(&self) -> ConsumeResult<Vec<FollowState>> {
        Ok(self
            .states
            .lock()
            .iter()
            .map(|(url, &revision)| FollowState {
                collection_url: url.clone(),
                revision,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TASKS: &str = "http://example.com/rest/tasks/";

    fn state(url: &str, revision: Revision) -> FollowState {
        FollowState {
            collection_url: url.to_string(),
            revision,
        }
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryFollowStore::new();
        assert!(store.load(TASKS).unwrap().is_none());

        store.save(&state(TASKS, 4)).unwrap();
        store.save(&state(TASKS, 7)).unwrap();
        assert_eq!(store.load(TASKS).unwrap(), Some(state(TASKS, 7)));

        assert!(store.remove(TASKS).unwrap());
        assert!(!store.remove(TASKS).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("follows.json");
        let notes = "http://example.com/rest/notes/";

        {
            let store = FileFollowStore::open(&path).unwrap();
            store.save(&state(TASKS, 12)).unwrap();
            store.save(&state(notes, 3)).unwrap();
        }

        let store = FileFollowStore::open(&path).unwrap();
        assert_eq!(store.load(TASKS).unwrap(), Some(state(TASKS, 12)));
        assert_eq!(
            store.list().unwrap(),
            vec![state(notes, 3), state(TASKS, 12)]
        );

        store.remove(notes).unwrap();
        let store = FileFollowStore::open(&path).unwrap();
        assert_eq!(store.list().unwrap(), vec![state(TASKS, 12)]);
    }

    #[test]
    fn missing_or_empty_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let missing = FileFollowStore::open(dir.path().join("none.json")).unwrap();
        assert!(missing.list().unwrap().is_empty());

        let empty_path = dir.path().join("empty.json");
        fs::write(&empty_path, "\n").unwrap();
        assert!(FileFollowStore::open(&empty_path).unwrap().list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("follows.json");
        fs::write(&path, "{not json").unwrap();
        let err = FileFollowStore::open(&path).unwrap_err();
        assert!(matches!(err, ConsumeError::Checkpoint(_)));
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("follows.json");
        let store = FileFollowStore::open(&path).unwrap();
        store.save(&state(TASKS, 1)).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("state").join("follows.json.tmp").exists());
    }
}
