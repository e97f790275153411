//! Change records as they travel over the change feed.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::de::IoRead;
use serde_json::{StreamDeserializer, Value};
use std::io::{Read, Write};

/// Position of a change in a service's change log.
pub type Revision = u64;

/// A single entry of the change feed.
///
/// `rev` is the only ordering and deduplication key. Consumers must tolerate
/// a record whose revision is not greater than the last one they applied.
///
/// Wire form: `{"rev": 3, "key": "k1", "deleted": false, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Revision assigned by the change manager.
    #[serde(rename = "rev")]
    pub revision: Revision,
    /// Published key of the object.
    pub key: String,
    /// Whether the object was deleted at this revision.
    pub deleted: bool,
    /// Published representation (absent for deletions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ChangeRecord {
    /// Creates an upsert record.
    pub fn upsert(revision: Revision, key: impl Into<String>, data: Value) -> Self {
        Self {
            revision,
            key: key.into(),
            deleted: false,
            data: Some(data),
        }
    }

    /// Creates a deletion record.
    pub fn deletion(revision: Revision, key: impl Into<String>) -> Self {
        Self {
            revision,
            key: key.into(),
            deleted: true,
            data: None,
        }
    }

    /// Checks that an upsert carries a data object.
    pub fn validate(&self) -> ProtocolResult<()> {
        if !self.deleted && self.data.is_none() {
            return Err(ProtocolError::MissingData {
                revision: self.revision,
                key: self.key.clone(),
            });
        }
        Ok(())
    }
}

/// Writes one feed entry: the record as compact JSON followed by a newline.
pub fn write_feed_entry<W: Write + ?Sized>(
    writer: &mut W,
    record: &ChangeRecord,
) -> ProtocolResult<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Encodes a batch of records as a JSON array (the `changes/list` body).
pub fn encode_change_list(records: &[ChangeRecord]) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(records)?)
}

/// Incremental decoder over a long-poll feed body.
///
/// Yields one record per JSON object in the stream. Whitespace between
/// objects (including heartbeat newlines) is skipped. The iterator ends at a
/// clean end of stream; a truncated object yields an error.
pub struct ChangeStream<R: Read> {
    inner: StreamDeserializer<'static, IoRead<R>, ChangeRecord>,
}

impl<R: Read> ChangeStream<R> {
    /// Wraps a reader positioned at the start of a feed body.
    pub fn new(reader: R) -> Self {
        Self {
            inner: serde_json::Deserializer::from_reader(reader).into_iter(),
        }
    }
}

impl<R: Read> Iterator for ChangeStream<R> {
    type Item = ProtocolResult<ChangeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next()?;
        Some(
            next.map_err(ProtocolError::from)
                .and_then(|record| record.validate().map(|()| record)),
        )
    }
}
