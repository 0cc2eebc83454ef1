//! Shared helpers for the store integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;

use bytes::Bytes;
use strata_store::{Error, RedoUndo, Result, SequenceNumber, Store};
use strata_test_utils::strategies::KvOp;
use tokio_util::sync::CancellationToken;

/// Every entry in key order, read through a full scan.
pub async fn dump(store: &Store) -> Vec<(Bytes, Bytes)> {
    let cancel = CancellationToken::new();
    let scan = store.create_scan().unwrap();
    scan.open(None, None, None, true, &cancel).await.unwrap();
    let mut entries = Vec::new();
    while let Some(position) = scan.move_next(&cancel).await.unwrap() {
        entries.push((position.key, position.value.unwrap()));
    }
    scan.close().unwrap();
    entries
}

/// Applies `op` at `sequence`. Returns the records when the store changed,
/// `None` when it legitimately did not (failed condition, empty erase).
pub async fn apply(store: &Store, op: &KvOp, sequence: SequenceNumber) -> Result<Option<RedoUndo>> {
    let cancel = CancellationToken::new();
    match op {
        KvOp::Insert { key, value } => store.insert(key, value, sequence, &cancel).await.map(Some),
        KvOp::Upsert { key, value } => {
            store.upsert(key, value, sequence, &cancel).await.map(|(_, records)| Some(records))
        },
        KvOp::Update { key, value } => store.update(key, value, sequence, &cancel).await.map(Some),
        KvOp::ConditionalUpdate { key, value, offset, expected } => store
            .conditional_update(key, value, *offset, expected, sequence, &cancel)
            .await
            .map(|(_, records)| records),
        KvOp::PartialUpdate { key, offset, bytes } => {
            store.partial_update(key, *offset, bytes, sequence, &cancel).await.map(Some)
        },
        KvOp::Delete { key } => {
            store.delete(key, sequence, &cancel).await.map(|(_, records)| Some(records))
        },
        KvOp::ConditionalDelete { key, offset, expected } => store
            .conditional_delete(key, *offset, expected, sequence, &cancel)
            .await
            .map(|(_, records)| records),
        KvOp::Erase => store.erase(sequence, &cancel).await.map(|(_, records)| records),
    }
}

/// Reference semantics over a `BTreeMap`.
#[derive(Debug, Default)]
pub struct Model {
    pub entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// What the reference says an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed.
    Applied,
    /// Legitimate no-op.
    Unchanged,
    /// Rejected with an error.
    Rejected,
}

fn holds(value: &[u8], offset: u32, expected: &[u8]) -> bool {
    if expected.is_empty() {
        return true;
    }
    let start = offset as usize;
    value.get(start..start + expected.len()).is_some_and(|actual| actual == expected)
}

impl Model {
    pub fn apply(&mut self, op: &KvOp) -> Outcome {
        match op {
            KvOp::Insert { key, value } => {
                if self.entries.contains_key(key) {
                    return Outcome::Rejected;
                }
                self.entries.insert(key.clone(), value.clone());
                Outcome::Applied
            },
            KvOp::Upsert { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                Outcome::Applied
            },
            KvOp::Update { key, value } => match self.entries.get_mut(key) {
                Some(current) => {
                    *current = value.clone();
                    Outcome::Applied
                },
                None => Outcome::Rejected,
            },
            KvOp::ConditionalUpdate { key, value, offset, expected } => {
                match self.entries.get_mut(key) {
                    Some(current) if holds(current, *offset, expected) => {
                        *current = value.clone();
                        Outcome::Applied
                    },
                    Some(_) => Outcome::Unchanged,
                    None => Outcome::Rejected,
                }
            },
            KvOp::PartialUpdate { key, offset, bytes } => match self.entries.get_mut(key) {
                Some(current) => {
                    let start = *offset as usize;
                    let end = start + bytes.len();
                    if end > current.len() {
                        return Outcome::Rejected;
                    }
                    current[start..end].copy_from_slice(bytes);
                    Outcome::Applied
                },
                None => Outcome::Rejected,
            },
            KvOp::Delete { key } => match self.entries.remove(key) {
                Some(_) => Outcome::Applied,
                None => Outcome::Rejected,
            },
            KvOp::ConditionalDelete { key, offset, expected } => match self.entries.get(key) {
                Some(current) if holds(current, *offset, expected) => {
                    self.entries.remove(key);
                    Outcome::Applied
                },
                Some(_) => Outcome::Unchanged,
                None => Outcome::Rejected,
            },
            KvOp::Erase => {
                if self.entries.is_empty() {
                    return Outcome::Unchanged;
                }
                self.entries.clear();
                Outcome::Applied
            },
        }
    }

    pub fn snapshot(&self) -> Vec<(Bytes, Bytes)> {
        self.entries
            .iter()
            .map(|(k, v)| (Bytes::copy_from_slice(k), Bytes::copy_from_slice(v)))
            .collect()
    }
}

/// Classifies a store result the same way as [`Model::apply`].
pub fn outcome(result: &Result<Option<RedoUndo>>) -> Outcome {
    match result {
        Ok(Some(_)) => Outcome::Applied,
        Ok(None) => Outcome::Unchanged,
        Err(Error::KeyExists | Error::KeyNotFound | Error::InvalidArgument { .. }) => {
            Outcome::Rejected
        },
        Err(e) => panic!("unexpected error: {e}"),
    }
}
