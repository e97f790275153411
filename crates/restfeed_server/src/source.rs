//! Source collection abstraction.
//!
//! The persistence layer that stores domain records is an external
//! collaborator. Services talk to it through [`SourceCollection`] and
//! [`SourceTransaction`]; [`MemoryCollection`] is an in-process
//! implementation for tests and demos.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use restfeed_protocol::key_from_value;
use serde_json::{Map, Value};

/// A domain record: attribute name to value.
pub type Record = Map<String, Value>;

/// Read access to a collection of records plus transactional writes.
///
/// `constraint` is the service's row filter (already specialised for the
/// requesting user). Passing `None` ignores the filter, which services use
/// to tell "outside the visible scope" apart from "does not exist".
pub trait SourceCollection: Send + Sync {
    /// Finds the record whose `key_attribute` equals `key`.
    fn find(
        &self,
        key_attribute: &str,
        key: &str,
        constraint: Option<&str>,
    ) -> ServerResult<Option<Record>>;

    /// Returns up to `limit` records starting at `offset`, ascending by key.
    fn scan(
        &self,
        key_attribute: &str,
        constraint: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> ServerResult<Vec<Record>>;

    /// Starts a transaction. Dropping it without committing rolls back.
    fn begin(&self) -> ServerResult<Box<dyn SourceTransaction + '_>>;
}

/// A unit of work against a source collection.
pub trait SourceTransaction {
    /// Finds a record, seeing this transaction's own uncommitted writes.
    fn find(
        &self,
        key_attribute: &str,
        key: &str,
        constraint: Option<&str>,
    ) -> ServerResult<Option<Record>>;

    /// Inserts or replaces the record identified by its key attribute.
    fn save(&mut self, key_attribute: &str, record: Record) -> ServerResult<()>;

    /// Deletes the record with the given key. Returns false if absent.
    fn delete(&mut self, key_attribute: &str, key: &str) -> ServerResult<bool>;

    /// Makes all writes visible atomically.
    fn commit(self: Box<Self>) -> ServerResult<()>;
}

/// A parsed row filter of the form `attr = 'value' and other = 'x'`.
///
/// Surrounding brackets are accepted (`[owner = 'u1']`). Values compare
/// against the attribute's textual key form, so `'42'` matches `42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    clauses: Vec<(String, String)>,
}

impl Constraint {
    /// Parses a constraint expression.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for anything but equality clauses.
    pub fn parse(expression: &str) -> ServerResult<Self> {
        let mut text = expression.trim();
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            text = inner.trim();
        }

        let mut clauses = Vec::new();
        if text.is_empty() {
            return Ok(Self { clauses });
        }

        for clause in split_and(text) {
            let (attr, value) = clause.split_once('=').ok_or_else(|| {
                ServerError::Configuration(format!("unsupported constraint clause '{clause}'"))
            })?;
            let attr = attr.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or(value);
            if attr.is_empty() {
                return Err(ServerError::Configuration(format!(
                    "constraint clause '{clause}' has no attribute"
                )));
            }
            clauses.push((attr.to_string(), value.to_string()));
        }

        Ok(Self { clauses })
    }

    /// Returns true if `record` satisfies every clause.
    pub fn matches(&self, record: &Record) -> bool {
        self.clauses.iter().all(|(attr, expected)| {
            key_from_value(record.get(attr)).as_deref() == Some(expected.as_str())
        })
    }
}

fn split_and(text: &str) -> Vec<&str> {
    let lower = text.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(pos) = lower[search..].find(" and ") {
        let at = search + pos;
        parts.push(text[start..at].trim());
        start = at + 5;
        search = start;
    }
    parts.push(text[start..].trim());
    parts
}

fn matches(record: &Record, constraint: Option<&Constraint>) -> bool {
    constraint.map_or(true, |c| c.matches(record))
}

fn record_key(record: &Record, key_attribute: &str) -> Option<String> {
    key_from_value(record.get(key_attribute))
}

fn parse_constraint(constraint: Option<&str>) -> ServerResult<Option<Constraint>> {
    constraint.map(Constraint::parse).transpose()
}

/// An in-memory source collection.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    records: RwLock<Vec<Record>>,
}

impl MemoryCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record outside of any transaction.
    pub fn insert(&self, record: Record) {
        self.records.write().push(record);
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the collection holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn position(records: &[Record], key_attribute: &str, key: &str) -> Option<usize> {
        records
            .iter()
            .position(|r| record_key(r, key_attribute).as_deref() == Some(key))
    }
}

impl SourceCollection for MemoryCollection {
    fn find(
        &self,
        key_attribute: &str,
        key: &str,
        constraint: Option<&str>,
    ) -> ServerResult<Option<Record>> {
        let constraint = parse_constraint(constraint)?;
        let records = self.records.read();
        Ok(Self::position(&records, key_attribute, key)
            .map(|i| &records[i])
            .filter(|r| matches(r, constraint.as_ref()))
            .cloned())
    }

    fn scan(
        &self,
        key_attribute: &str,
        constraint: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> ServerResult<Vec<Record>> {
        let constraint = parse_constraint(constraint)?;
        let records = self.records.read();
        let mut visible: Vec<&Record> = records
            .iter()
            .filter(|r| matches(r, constraint.as_ref()))
            .collect();
        visible.sort_by_key(|r| record_key(r, key_attribute));
        Ok(visible
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn begin(&self) -> ServerResult<Box<dyn SourceTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            collection: self,
            writes: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum PendingWrite {
    Save {
        key_attribute: String,
        key: String,
        record: Record,
    },
    Delete {
        key_attribute: String,
        key: String,
    },
}

struct MemoryTransaction<'a> {
    collection: &'a MemoryCollection,
    writes: Vec<PendingWrite>,
}

impl MemoryTransaction<'_> {
    /// Latest pending write for `key`: `Some(Some(record))` for a save,
    /// `Some(None)` for a delete.
    fn pending(&self, key_attribute: &str, key: &str) -> Option<Option<&Record>> {
        self.writes.iter().rev().find_map(|w| match w {
            PendingWrite::Save {
                key_attribute: a,
                key: k,
                record,
            } if a == key_attribute && k == key => Some(Some(record)),
            PendingWrite::Delete {
                key_attribute: a,
                key: k,
            } if a == key_attribute && k == key => Some(None),
            _ => None,
        })
    }
}

impl SourceTransaction for MemoryTransaction<'_> {
    fn find(
        &self,
        key_attribute: &str,
        key: &str,
        constraint: Option<&str>,
    ) -> ServerResult<Option<Record>> {
        match self.pending(key_attribute, key) {
            Some(pending) => {
                let constraint = parse_constraint(constraint)?;
                Ok(pending
                    .filter(|r| matches(r, constraint.as_ref()))
                    .cloned())
            }
            None => self.collection.find(key_attribute, key, constraint),
        }
    }

    fn save(&mut self, key_attribute: &str, record: Record) -> ServerResult<()> {
        let key = record_key(&record, key_attribute).ok_or_else(|| {
            ServerError::Storage(format!("record has no value for key '{key_attribute}'"))
        })?;
        self.writes.push(PendingWrite::Save {
            key_attribute: key_attribute.to_string(),
            key,
            record,
        });
        Ok(())
    }

    fn delete(&mut self, key_attribute: &str, key: &str) -> ServerResult<bool> {
        let exists = self.find(key_attribute, key, None)?.is_some();
        if exists {
            self.writes.push(PendingWrite::Delete {
                key_attribute: key_attribute.to_string(),
                key: key.to_string(),
            });
        }
        Ok(exists)
    }

    fn commit(self: Box<Self>) -> ServerResult<()> {
        let MemoryTransaction { collection, writes } = *self;
        let mut records = collection.records.write();
        for write in writes {
            match write {
                PendingWrite::Save {
                    key_attribute,
                    key,
                    record,
                } => match MemoryCollection::position(&records, &key_attribute, &key) {
                    Some(i) => records[i] = record,
                    None => records.push(record),
                },
                PendingWrite::Delete { key_attribute, key } => {
                    records.retain(|r| record_key(r, &key_attribute).as_deref() != Some(key.as_str()));
                }
            }
        }
        Ok(())
    }
}
