//! Redo/undo operation records.
//!
//! Every mutation produces a redo record (re-applies the mutation on another
//! replica) and, except for erase, an undo record (reverses it locally).
//! Both are encoded [`Operation`]s: a format-version byte followed by the
//! postcard serialization of the record.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{CodecSnafu, Error, Result};

/// Current operation record format version.
pub const FORMAT_VERSION: u8 = 1;

/// Kind of mutation an [`Operation`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Create a key that must be absent.
    Insert,
    /// Create or replace a key.
    Upsert,
    /// Replace the value of an existing key.
    Update,
    /// Overwrite a byte range of an existing value.
    PartialUpdate,
    /// Remove an existing key.
    Delete,
    /// Remove every key.
    Erase,
}

impl OperationType {
    /// Short lowercase name, used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Upsert => "upsert",
            OperationType::Update => "update",
            OperationType::PartialUpdate => "partial_update",
            OperationType::Delete => "delete",
            OperationType::Erase => "erase",
        }
    }
}

/// A decoded redo or undo record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Kind of mutation.
    pub operation_type: OperationType,
    /// Target key. Absent only for erase.
    pub key: Option<Bytes>,
    /// New value, or the bytes to write for a partial update.
    pub value: Option<Bytes>,
    /// Expected bytes for a conditional operation.
    pub conditional_value: Option<Bytes>,
    /// Offset into the current value where `conditional_value` is compared.
    pub conditional_offset: u32,
    /// Offset into the current value where a partial update writes.
    pub partial_update_offset: u32,
}

impl Operation {
    fn new(operation_type: OperationType, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            operation_type,
            key,
            value,
            conditional_value: None,
            conditional_offset: 0,
            partial_update_offset: 0,
        }
    }

    /// Insert of `key` with `value`.
    pub fn insert(key: Bytes, value: Bytes) -> Self {
        Self::new(OperationType::Insert, Some(key), Some(value))
    }

    /// Upsert of `key` with `value`.
    pub fn upsert(key: Bytes, value: Bytes) -> Self {
        Self::new(OperationType::Upsert, Some(key), Some(value))
    }

    /// Unconditional update of `key` to `value`.
    pub fn update(key: Bytes, value: Bytes) -> Self {
        Self::new(OperationType::Update, Some(key), Some(value))
    }

    /// Update of `key` to `value`, guarded by `expected` at `offset`.
    pub fn conditional_update(key: Bytes, value: Bytes, offset: u32, expected: Bytes) -> Self {
        Self {
            conditional_value: Some(expected),
            conditional_offset: offset,
            ..Self::update(key, value)
        }
    }

    /// Overwrite of `bytes` at `offset` within the value of `key`.
    pub fn partial_update(key: Bytes, offset: u32, bytes: Bytes) -> Self {
        Self {
            partial_update_offset: offset,
            ..Self::new(OperationType::PartialUpdate, Some(key), Some(bytes))
        }
    }

    /// Partial update guarded by `expected` at `condition_offset`.
    pub fn conditional_partial_update(
        key: Bytes,
        offset: u32,
        bytes: Bytes,
        condition_offset: u32,
        expected: Bytes,
    ) -> Self {
        Self {
            conditional_value: Some(expected),
            conditional_offset: condition_offset,
            ..Self::partial_update(key, offset, bytes)
        }
    }

    /// Unconditional delete of `key`.
    pub fn delete(key: Bytes) -> Self {
        Self::new(OperationType::Delete, Some(key), None)
    }

    /// Delete of `key`, guarded by `expected` at `offset`.
    pub fn conditional_delete(key: Bytes, offset: u32, expected: Bytes) -> Self {
        Self { conditional_value: Some(expected), conditional_offset: offset, ..Self::delete(key) }
    }

    /// Removal of every key.
    pub fn erase() -> Self {
        Self::new(OperationType::Erase, None, None)
    }

    /// Whether this operation carries a byte-range condition.
    pub fn is_conditional(&self) -> bool {
        self.conditional_value.is_some()
    }

    /// Encodes this record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = vec![FORMAT_VERSION];
        let body = postcard::to_allocvec(self).context(CodecSnafu)?;
        buf.extend_from_slice(&body);
        Ok(Bytes::from(buf))
    }

    /// Decodes a record produced by [`Operation::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedVersion`] for an unknown format byte,
    /// [`Error::Corrupted`] for empty input, or [`Error::Codec`] if the body
    /// does not deserialize.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Corrupted { reason: "empty operation record".to_string() })?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version: u16::from(version) });
        }
        postcard::from_bytes(body).context(CodecSnafu)
    }
}

/// Redo and undo records produced by one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoUndo {
    /// Record that re-applies the mutation.
    pub redo: Bytes,
    /// Record that reverses the mutation. `None` for erase.
    pub undo: Option<Bytes>,
}

impl RedoUndo {
    /// Encodes a redo/undo pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if either record fails to serialize.
    pub fn new(redo: &Operation, undo: Option<&Operation>) -> Result<Self> {
        Ok(Self { redo: redo.encode()?, undo: undo.map(Operation::encode).transpose()? })
    }

    /// Decodes the redo record.
    ///
    /// # Errors
    ///
    /// Propagates [`Operation::decode`] failures.
    pub fn redo_operation(&self) -> Result<Operation> {
        Operation::decode(&self.redo)
    }

    /// Decodes the undo record, if there is one.
    ///
    /// # Errors
    ///
    /// Propagates [`Operation::decode`] failures.
    pub fn undo_operation(&self) -> Result<Option<Operation>> {
        self.undo.as_deref().map(Operation::decode).transpose()
    }
}
