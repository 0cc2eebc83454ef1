//! Copy streams: full-state transfer between replicas.
//!
//! A producer turns one retained version into a finite sequence of frames;
//! a fresh consumer rebuilds an equivalent index from them.
//!
//! # Frame format
//!
//! ```text
//! magic "STCP" | kind u8 | chunk index u32 | payload
//! ```
//!
//! | Kind    | Payload                                              |
//! |---------|------------------------------------------------------|
//! | Header  | version u16, key fingerprint u64, sequence u64       |
//! | Data    | records, as in checkpoint images                     |
//! | Trailer | record count u64, xxh3-64 over every data payload    |
//!
//! Chunk indexes start at 0 with the header and increase by one.

use std::sync::{Arc, atomic::Ordering};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    checkpoint::{decode_record, encode_record},
    error::{Error, Result, SequenceNumber},
    index::{Entry, Index, RangeIter},
    metrics,
    store::{CommittedState, Store},
};

const FRAME_MAGIC: &[u8; 4] = b"STCP";
const FRAME_HEADER_SIZE: usize = 4 + 1 + 4;
const COPY_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Header = 1,
    Data = 2,
    Trailer = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Header),
            2 => Some(Self::Data),
            3 => Some(Self::Trailer),
            _ => None,
        }
    }
}

fn frame(kind: FrameKind, chunk_index: u32, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(kind as u8);
    buf.extend_from_slice(&chunk_index.to_le_bytes());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

fn parse_frame(chunk: &[u8]) -> Result<(FrameKind, u32, &[u8])> {
    if chunk.len() < FRAME_HEADER_SIZE {
        return Err(Error::Corrupted { reason: format!("copy chunk of {} bytes", chunk.len()) });
    }
    if &chunk[0..4] != FRAME_MAGIC {
        return Err(Error::InvalidMagic);
    }
    let kind = FrameKind::from_u8(chunk[4]).ok_or_else(|| Error::Corrupted {
        reason: format!("unknown copy frame kind {}", chunk[4]),
    })?;
    Ok((kind, LittleEndian::read_u32(&chunk[5..9]), &chunk[FRAME_HEADER_SIZE..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Data,
    Trailer,
    Done,
}

/// Lazy, single-use stream of copy frames over one immutable version.
///
/// Yields an error (and then ends) if the source store is closed or
/// aborted while the stream is being consumed.
pub struct CopyStream {
    store: Store,
    entries: RangeIter,
    sequence: SequenceNumber,
    fingerprint: u64,
    chunk_size: usize,
    next_index: u32,
    phase: Phase,
    count: u64,
    hasher: Xxh3,
}

impl std::fmt::Debug for CopyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyStream")
            .field("sequence", &self.sequence)
            .field("next_index", &self.next_index)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl CopyStream {
    /// Sequence number of the version being streamed.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    fn emit(&mut self, kind: FrameKind, payload: &[u8]) -> Bytes {
        let chunk = frame(kind, self.next_index, payload);
        self.next_index += 1;
        metrics::record_copy_chunk("out");
        chunk
    }

    fn next_data(&mut self) -> Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        let mut records = 0u64;
        while payload.len() < self.chunk_size {
            let Some(entry) = self.entries.next() else {
                break;
            };
            encode_record(&entry, &mut payload)?;
            records += 1;
        }
        if records == 0 {
            return Ok(None);
        }
        self.hasher.update(&payload);
        self.count += records;
        Ok(Some(payload))
    }
}

impl Iterator for CopyStream {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.phase == Phase::Done {
            return None;
        }
        if let Err(e) = self.store.ensure_open() {
            self.phase = Phase::Done;
            return Some(Err(e));
        }

        match self.phase {
            Phase::Header => {
                let mut payload = Vec::with_capacity(18);
                payload.extend_from_slice(&COPY_VERSION.to_le_bytes());
                payload.extend_from_slice(&self.fingerprint.to_le_bytes());
                payload.extend_from_slice(&self.sequence.to_le_bytes());
                self.phase = Phase::Data;
                Some(Ok(self.emit(FrameKind::Header, &payload)))
            },
            Phase::Data => match self.next_data() {
                Ok(Some(payload)) => {
                    if self.entries.peek().is_none() {
                        self.phase = Phase::Trailer;
                    }
                    Some(Ok(self.emit(FrameKind::Data, &payload)))
                },
                Ok(None) => Some(Ok(self.trailer())),
                Err(e) => {
                    self.phase = Phase::Done;
                    Some(Err(e))
                },
            },
            Phase::Trailer => Some(Ok(self.trailer())),
            Phase::Done => None,
        }
    }
}

impl CopyStream {
    fn trailer(&mut self) -> Bytes {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&self.count.to_le_bytes());
        payload.extend_from_slice(&self.hasher.digest().to_le_bytes());
        self.phase = Phase::Done;
        self.emit(FrameKind::Trailer, &payload)
    }
}

/// Consumer-side state for an in-progress copy.
#[derive(Default)]
pub(crate) struct CopyReceiver {
    next_index: u32,
    pending: Option<PendingCopy>,
}

struct PendingCopy {
    sequence: SequenceNumber,
    index: Index,
    count: u64,
    hasher: Xxh3,
}

impl Store {
    /// Starts a copy stream over the version at the greatest committed
    /// sequence number `<= up_to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionUnavailable`] if that version is no longer
    /// retained, or [`Error::Closed`]/[`Error::Aborted`].
    pub fn get_copy_state(&self, up_to: SequenceNumber) -> Result<CopyStream> {
        self.ensure_open()?;
        let version = self.version_at(up_to)?;
        debug!(up_to, sequence = version.sequence, records = version.index.len(), "Copy stream started");
        Ok(CopyStream {
            store: self.clone(),
            entries: version.index.iter(),
            sequence: version.sequence,
            fingerprint: self.inner.comparator.fingerprint(),
            chunk_size: self.inner.config.copy_chunk_size_bytes,
            next_index: 0,
            phase: Phase::Header,
            count: 0,
            hasher: Xxh3::new(),
        })
    }

    /// Applies one copy frame. Frames must arrive in the order the producer
    /// emitted them, into a store that has received no other mutation. The
    /// copied state becomes visible when the trailer is applied.
    ///
    /// # Errors
    ///
    /// - [`Error::CopyTargetNotEmpty`] if the store already holds state.
    /// - [`Error::CopyOutOfOrder`] for a frame other than the next one.
    /// - [`Error::CopyIncompatible`] if the key comparison differs.
    /// - [`Error::Corrupted`] or [`Error::InvalidMagic`] for damaged frames.
    pub async fn apply_copy_data(&self, chunk: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.inner.mutated.load(Ordering::Acquire) {
            return Err(Error::CopyTargetNotEmpty);
        }

        let (kind, chunk_index, payload) = parse_frame(chunk)?;
        let mut receiver = self.inner.copy.lock();
        if chunk_index != receiver.next_index {
            return Err(Error::CopyOutOfOrder { expected: receiver.next_index, found: chunk_index });
        }

        match kind {
            FrameKind::Header => receiver.pending = Some(self.copy_header(payload)?),
            FrameKind::Data => {
                let pending = receiver.pending.as_mut().ok_or_else(|| Error::Corrupted {
                    reason: "copy data before header".to_string(),
                })?;
                self.copy_data(pending, payload)?;
            },
            FrameKind::Trailer => {
                let pending = receiver.pending.take().ok_or_else(|| Error::Corrupted {
                    reason: "copy trailer before header".to_string(),
                })?;
                if let Err(e) = self.copy_trailer(&pending, payload) {
                    receiver.pending = Some(pending);
                    return Err(e);
                }
            },
        }
        receiver.next_index += 1;
        metrics::record_copy_chunk("in");
        Ok(())
    }

    fn copy_header(&self, payload: &[u8]) -> Result<PendingCopy> {
        if payload.len() < 18 {
            return Err(Error::Corrupted { reason: "copy header truncated".to_string() });
        }
        let version = LittleEndian::read_u16(&payload[0..2]);
        if version != COPY_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        let fingerprint = LittleEndian::read_u64(&payload[2..10]);
        if fingerprint != self.inner.comparator.fingerprint() {
            return Err(Error::CopyIncompatible {
                reason: format!(
                    "key comparison fingerprint {fingerprint:#x}, expected {:#x}",
                    self.inner.comparator.fingerprint()
                ),
            });
        }
        Ok(PendingCopy {
            sequence: LittleEndian::read_u64(&payload[10..18]),
            index: Index::new(self.inner.layout),
            count: 0,
            hasher: Xxh3::new(),
        })
    }

    fn copy_data(&self, pending: &mut PendingCopy, payload: &[u8]) -> Result<()> {
        let mut index = pending.index.clone();
        let mut count = 0u64;
        let mut pos = 0;
        while pos < payload.len() {
            let (record, consumed) = decode_record(&payload[pos..])?;
            pos += consumed;
            let sort_key = self.inner.comparator.sort_key(&record.key)?;
            index.insert(Entry { sort_key, key: record.key, value: record.value, seq: record.seq });
            count += 1;
        }

        let limit = self.inner.config.storage.max_memory_bytes();
        let requested = index.byte_size() as u64;
        if requested > limit {
            return Err(Error::CapacityExceeded { resource: "memory", requested, limit });
        }

        pending.index = index;
        pending.count += count;
        pending.hasher.update(payload);
        Ok(())
    }

    fn copy_trailer(&self, pending: &PendingCopy, payload: &[u8]) -> Result<()> {
        if payload.len() < 16 {
            return Err(Error::Corrupted { reason: "copy trailer truncated".to_string() });
        }
        let count = LittleEndian::read_u64(&payload[0..8]);
        let checksum = LittleEndian::read_u64(&payload[8..16]);
        if count != pending.count || checksum != pending.hasher.digest() {
            return Err(Error::Corrupted {
                reason: format!(
                    "copy stream carried {} records, trailer says {count}",
                    pending.count
                ),
            });
        }

        let state =
            Arc::new(CommittedState { index: pending.index.clone(), sequence: pending.sequence });
        let mut history = self.inner.history.lock();
        self.ensure_open()?;
        if self.inner.mutated.swap(true, Ordering::AcqRel) {
            return Err(Error::CopyTargetNotEmpty);
        }
        self.inner.state.store(Arc::clone(&state));
        history.reset(Arc::clone(&state));
        drop(history);

        metrics::set_store_size(
            self.inner.config.partition_id,
            self.inner.config.replica_id,
            state.index.len(),
            state.index.byte_size(),
        );
        info!(
            sequence = state.sequence,
            records = state.index.len(),
            "Copy applied"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use strata_types::{KeyComparison, KeyDataType, StorageConfig, StoreConfig};

    use super::*;

    fn config(chunk: usize) -> StoreConfig {
        StoreConfig {
            storage: StorageConfig::volatile(),
            copy_chunk_size_bytes: chunk,
            ..StoreConfig::default()
        }
    }

    async fn populated(records: u64) -> Store {
        let store = Store::open(config(1024), false).await.unwrap();
        let cancel = CancellationToken::new();
        for i in 0..records {
            let key = format!("key-{i:05}");
            store.insert(key.as_bytes(), &[i as u8; 100], i + 1, &cancel).await.unwrap();
        }
        store
    }

    async fn transfer(chunks: &[Bytes]) -> Store {
        let target = Store::open(config(1024), false).await.unwrap();
        let cancel = CancellationToken::new();
        for chunk in chunks {
            target.apply_copy_data(chunk, &cancel).await.unwrap();
        }
        target
    }

    // =========================================================================
    // Producer
    // =========================================================================

    #[tokio::test]
    async fn test_stream_layout() {
        let store = populated(50).await;
        let chunks: Vec<Bytes> = store.get_copy_state(50).unwrap().map(Result::unwrap).collect();
        assert!(chunks.len() > 3, "expected several data chunks, got {}", chunks.len());

        for (i, chunk) in chunks.iter().enumerate() {
            let (kind, index, _) = parse_frame(chunk).unwrap();
            assert_eq!(index as usize, i);
            let expected = if i == 0 {
                FrameKind::Header
            } else if i == chunks.len() - 1 {
                FrameKind::Trailer
            } else {
                FrameKind::Data
            };
            assert_eq!(kind, expected);
        }
    }

    #[tokio::test]
    async fn test_empty_store_streams_header_and_trailer() {
        let store = Store::open(config(1024), false).await.unwrap();
        let chunks: Vec<Bytes> = store.get_copy_state(0).unwrap().map(Result::unwrap).collect();
        assert_eq!(chunks.len(), 2);
        let target = transfer(&chunks).await;
        assert_eq!(target.statistics().unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn test_stream_is_a_snapshot() {
        let store = populated(10).await;
        let stream = store.get_copy_state(10).unwrap();
        store.delete(b"key-00000", 11, &CancellationToken::new()).await.unwrap();
        let chunks: Vec<Bytes> = stream.map(Result::unwrap).collect();
        let target = transfer(&chunks).await;
        assert_eq!(target.statistics().unwrap().record_count, 10);
    }

    #[tokio::test]
    async fn test_stream_fails_after_close() {
        let store = populated(50).await;
        let mut stream = store.get_copy_state(50).unwrap();
        assert!(stream.next().unwrap().is_ok());
        store.close(false).await.unwrap();
        assert!(matches!(stream.next(), Some(Err(Error::Closed))));
        assert!(stream.next().is_none());
    }

    // =========================================================================
    // Consumer
    // =========================================================================

    #[tokio::test]
    async fn test_copy_reproduces_store() {
        let source = populated(40).await;
        let cancel = CancellationToken::new();
        source.update(b"key-00003", b"changed", 41, &cancel).await.unwrap();

        let chunks: Vec<Bytes> = source.get_copy_state(41).unwrap().map(Result::unwrap).collect();
        let target = transfer(&chunks).await;

        assert_eq!(target.last_committed_sequence_number().unwrap(), 41);
        assert_eq!(target.statistics().unwrap().record_count, 40);
        for i in 0..40u64 {
            let key = format!("key-{i:05}");
            assert_eq!(
                target.seek(key.as_bytes(), &cancel).await.unwrap(),
                source.seek(key.as_bytes(), &cancel).await.unwrap()
            );
        }
        // Next mutation continues past the copied sequence number.
        assert!(target.insert(b"new", b"v", 41, &cancel).await.is_err());
        target.insert(b"new", b"v", 42, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_of_older_version() {
        let source = populated(5).await;
        let cancel = CancellationToken::new();
        source.delete(b"key-00000", 6, &cancel).await.unwrap();

        let stream = source.get_copy_state(5).unwrap();
        assert_eq!(stream.sequence(), 5);
        let chunks: Vec<Bytes> = stream.map(Result::unwrap).collect();
        let target = transfer(&chunks).await;
        assert_eq!(target.seek(b"key-00000", &cancel).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let source = populated(30).await;
        let chunks: Vec<Bytes> = source.get_copy_state(30).unwrap().map(Result::unwrap).collect();
        let target = Store::open(config(1024), false).await.unwrap();
        let cancel = CancellationToken::new();

        let err = target.apply_copy_data(&chunks[1], &cancel).await.unwrap_err();
        assert!(matches!(err, Error::CopyOutOfOrder { expected: 0, found: 1 }));
        target.apply_copy_data(&chunks[0], &cancel).await.unwrap();
        let err = target.apply_copy_data(&chunks[0], &cancel).await.unwrap_err();
        assert!(matches!(err, Error::CopyOutOfOrder { expected: 1, found: 0 }));
    }

    #[tokio::test]
    async fn test_incompatible_key_comparison_rejected() {
        let source = populated(3).await;
        let chunks: Vec<Bytes> = source.get_copy_state(3).unwrap().map(Result::unwrap).collect();

        let key_comparison = KeyComparison::builder().data_type(KeyDataType::String).build().unwrap();
        let target =
            Store::open(StoreConfig { key_comparison, ..config(1024) }, false).await.unwrap();
        let err = target.apply_copy_data(&chunks[0], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::CopyIncompatible { .. }));
    }

    #[tokio::test]
    async fn test_mutated_target_rejected() {
        let source = populated(3).await;
        let chunks: Vec<Bytes> = source.get_copy_state(3).unwrap().map(Result::unwrap).collect();

        let target = Store::open(config(1024), false).await.unwrap();
        let cancel = CancellationToken::new();
        target.insert(b"x", b"y", 1, &cancel).await.unwrap();
        let err = target.apply_copy_data(&chunks[0], &cancel).await.unwrap_err();
        assert!(matches!(err, Error::CopyTargetNotEmpty));
    }

    #[tokio::test]
    async fn test_damaged_data_detected_at_trailer() {
        let source = populated(20).await;
        let mut chunks: Vec<Bytes> =
            source.get_copy_state(20).unwrap().map(Result::unwrap).collect();

        // Flip one value byte in the first data chunk; keys still decode.
        let mut damaged = chunks[1].to_vec();
        let last = damaged.len() - 9;
        damaged[last] ^= 0x01;
        chunks[1] = Bytes::from(damaged);

        let target = Store::open(config(1024), false).await.unwrap();
        let cancel = CancellationToken::new();
        let (trailer, body) = chunks.split_last().unwrap();
        for chunk in body {
            target.apply_copy_data(chunk, &cancel).await.unwrap();
        }
        let err = target.apply_copy_data(trailer, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
        assert_eq!(target.statistics().unwrap().record_count, 0);
    }

    #[test]
    fn test_parse_frame_rejects_garbage() {
        assert!(matches!(parse_frame(b"STC"), Err(Error::Corrupted { .. })));
        assert!(matches!(parse_frame(b"XXXX\x01\0\0\0\0"), Err(Error::InvalidMagic)));
        assert!(matches!(parse_frame(b"STCP\x09\0\0\0\0"), Err(Error::Corrupted { .. })));
    }
}
