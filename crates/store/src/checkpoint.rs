//! Checkpoints and stability tracking.
//!
//! A checkpoint persists one retained version as an immutable image, then
//! commits it through the dual-slot manifest (see [`crate::backend`]).
//!
//! # Image format
//!
//! ```text
//! magic "STRATACK" | version u16 | fingerprint u64 | sequence u64 | count u64
//! record*          | xxh3-64 of all preceding bytes
//! ```
//!
//! A record is `len-prefixed key | len-prefixed value | seq u64`, all
//! integers little-endian. Copy streams reuse the record encoding.

use std::{sync::atomic::Ordering, time::Instant};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{CommitSlot, MANIFEST_SIZE, Manifest, StorageBackend},
    error::{Error, Result, SequenceNumber},
    index::{Entry, Index},
    metrics,
    store::Store,
    types::{decode_length_prefixed, encode_length_prefixed},
};

const IMAGE_MAGIC: &[u8; 8] = b"STRATACK";
const IMAGE_VERSION: u16 = 1;
const IMAGE_HEADER_SIZE: usize = 8 + 2 + 8 + 8 + 8;
const IMAGE_FOOTER_SIZE: usize = 8;

/// One persisted or streamed entry, keyed by its raw key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub(crate) key: Bytes,
    pub(crate) value: Bytes,
    pub(crate) seq: SequenceNumber,
}

/// Appends the wire form of `entry` to `buf`.
pub(crate) fn encode_record(entry: &Entry, buf: &mut Vec<u8>) -> Result<()> {
    encode_length_prefixed(&entry.key, buf)?;
    encode_length_prefixed(&entry.value, buf)?;
    buf.extend_from_slice(&entry.seq.to_le_bytes());
    Ok(())
}

/// Decodes one record from the front of `buf`. Returns the record and the
/// bytes consumed.
pub(crate) fn decode_record(buf: &[u8]) -> Result<(Record, usize)> {
    let truncated = || Error::Corrupted { reason: "truncated record".to_string() };
    let (key, key_len) = decode_length_prefixed(buf).ok_or_else(truncated)?;
    let rest = &buf[key_len..];
    let (value, value_len) = decode_length_prefixed(rest).ok_or_else(truncated)?;
    let rest = &rest[value_len..];
    if rest.len() < 8 {
        return Err(truncated());
    }
    let record = Record {
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
        seq: LittleEndian::read_u64(&rest[..8]),
    };
    Ok((record, key_len + value_len + 8))
}

/// Decoded checkpoint image.
#[derive(Debug)]
pub(crate) struct CheckpointImage {
    pub(crate) fingerprint: u64,
    pub(crate) sequence: SequenceNumber,
    pub(crate) records: Vec<Record>,
}

/// Manifest plus the image its active slot names.
#[derive(Debug)]
pub(crate) struct LoadedCheckpoint {
    pub(crate) manifest: Manifest,
    pub(crate) image: CheckpointImage,
}

pub(crate) fn encode_image(
    index: &Index,
    sequence: SequenceNumber,
    fingerprint: u64,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(IMAGE_HEADER_SIZE + index.byte_size() + IMAGE_FOOTER_SIZE);
    buf.extend_from_slice(IMAGE_MAGIC);
    buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    buf.extend_from_slice(&fingerprint.to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&(index.len() as u64).to_le_bytes());
    for entry in index.iter() {
        encode_record(&entry, &mut buf)?;
    }
    let checksum = xxhash_rust::xxh3::xxh3_64(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

pub(crate) fn decode_image(buf: &[u8]) -> Result<CheckpointImage> {
    if buf.len() < IMAGE_HEADER_SIZE + IMAGE_FOOTER_SIZE {
        return Err(Error::Corrupted { reason: format!("image truncated to {} bytes", buf.len()) });
    }
    if &buf[0..8] != IMAGE_MAGIC {
        return Err(Error::InvalidMagic);
    }
    let version = LittleEndian::read_u16(&buf[8..10]);
    if version != IMAGE_VERSION {
        return Err(Error::UnsupportedVersion { version });
    }

    let (body, footer) = buf.split_at(buf.len() - IMAGE_FOOTER_SIZE);
    if xxhash_rust::xxh3::xxh3_64(body) != LittleEndian::read_u64(footer) {
        return Err(Error::Corrupted { reason: "image checksum mismatch".to_string() });
    }

    let fingerprint = LittleEndian::read_u64(&body[10..18]);
    let sequence = LittleEndian::read_u64(&body[18..26]);
    let count = LittleEndian::read_u64(&body[26..34]);

    let mut records = Vec::new();
    let mut pos = IMAGE_HEADER_SIZE;
    while pos < body.len() {
        let (record, consumed) = decode_record(&body[pos..])?;
        records.push(record);
        pos += consumed;
    }
    if records.len() as u64 != count {
        return Err(Error::Corrupted {
            reason: format!("image holds {} records, header says {count}", records.len()),
        });
    }
    Ok(CheckpointImage { fingerprint, sequence, records })
}

/// Reads the committed checkpoint, or `None` if nothing was ever committed.
pub(crate) fn load(backend: &dyn StorageBackend) -> Result<Option<LoadedCheckpoint>> {
    let Some(bytes) = backend.read_manifest()? else {
        return Ok(None);
    };
    let mut manifest = Manifest::from_bytes(&bytes)?;
    let chosen = manifest.validate_and_choose_slot()?;
    if chosen != manifest.primary_slot_index() {
        warn!(
            primary = manifest.primary_slot_index(),
            chosen, "Primary manifest slot invalid, recovering from secondary"
        );
        // The damaged slot becomes the one the next checkpoint overwrites.
        manifest.flip_primary_slot();
    }

    let slot = manifest.slot(chosen).clone();
    let raw = backend.read_image(slot.checkpoint_sequence)?;
    if raw.len() as u64 != slot.image_len
        || xxhash_rust::xxh3::xxh3_64(&raw) != slot.image_checksum
    {
        return Err(Error::Corrupted {
            reason: format!("checkpoint image {} does not match manifest", slot.checkpoint_sequence),
        });
    }
    let image = decode_image(&raw)?;
    if image.sequence != slot.checkpoint_sequence || image.records.len() as u64 != slot.entry_count
    {
        return Err(Error::Corrupted {
            reason: format!("checkpoint image {} disagrees with its slot", slot.checkpoint_sequence),
        });
    }
    Ok(Some(LoadedCheckpoint { manifest, image }))
}

fn check_cancelled(cancel: &CancellationToken, shutdown: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() || shutdown.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Writes `image` and commits it. Returns the manifest now on disk.
///
/// Cancellation is honored until the secondary slot is written. Up to that
/// point the previous checkpoint stays in force.
fn persist(
    backend: &dyn StorageBackend,
    mut manifest: Manifest,
    sequence: SequenceNumber,
    image: &[u8],
    entry_count: u64,
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<Manifest> {
    check_cancelled(cancel, shutdown)?;
    backend.write_image(sequence, image)?;

    if let Err(e) = check_cancelled(cancel, shutdown) {
        backend.remove_image(sequence)?;
        return Err(e);
    }

    *manifest.secondary_slot_mut() = CommitSlot {
        checkpoint_sequence: sequence,
        image_len: image.len() as u64,
        image_checksum: xxhash_rust::xxh3::xxh3_64(image),
        entry_count,
        timestamp: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0),
        checksum: 0,
    }
    .sealed();
    backend.write_manifest(&manifest.to_bytes())?;
    backend.sync()?;

    manifest.flip_primary_slot();
    backend.write_manifest(&manifest.to_bytes())?;
    backend.sync()?;

    for stale in backend.list_images()? {
        if stale != sequence {
            if let Err(e) = backend.remove_image(stale) {
                warn!(sequence = stale, error = %e, "Failed to remove superseded checkpoint image");
            } else {
                debug!(sequence = stale, "Removed superseded checkpoint image");
            }
        }
    }
    Ok(manifest)
}

impl Store {
    /// Durably persists the store version at the greatest committed
    /// sequence number `<= sequence`.
    ///
    /// A request at or below the last checkpoint succeeds without doing
    /// anything. Versions older than the new checkpoint are released. A
    /// request for a version already released by
    /// [`on_operation_stable`](Self::on_operation_stable) persists the newest
    /// version at or below the stable sequence number.
    ///
    /// # Errors
    ///
    /// - [`Error::VersionUnavailable`] if that version is no longer retained.
    /// - [`Error::CapacityExceeded`] if the image exceeds `max_storage_mb`.
    /// - [`Error::Cancelled`], [`Error::Aborted`] if interrupted; the
    ///   previous checkpoint stays in force.
    /// - I/O errors from the backend.
    #[instrument(skip(self, cancel), fields(replica_id = self.inner.config.replica_id))]
    pub async fn checkpoint(&self, sequence: SequenceNumber, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        let _guard = tokio::select! {
            guard = self.inner.checkpoint_lock.lock() => guard,
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = self.inner.shutdown.cancelled() => return Err(self.terminal_error()),
        };
        self.ensure_open()?;

        let last = self.inner.checkpoint_sequence.load(Ordering::Acquire);
        if sequence <= last {
            return Ok(());
        }
        let stable = self.inner.stable_sequence.load(Ordering::Acquire);
        let version = match self.version_at(sequence) {
            // Released by a stability report; the newest stable version may
            // be materialized in its place.
            Err(Error::VersionUnavailable { .. }) if sequence <= stable => self.version_at(stable)?,
            resolved => resolved?,
        };
        if version.sequence <= last {
            return Ok(());
        }

        let start = Instant::now();
        let result = self.persist_version(version.sequence, &version.index, cancel).await;
        metrics::record_checkpoint(result.is_ok(), start.elapsed().as_secs_f64());
        let manifest = match result {
            Ok(manifest) => manifest,
            Err(Error::Cancelled) if self.inner.shutdown.is_cancelled() => {
                return Err(self.terminal_error());
            },
            Err(e) => return Err(e),
        };

        *self.inner.manifest.lock() = manifest;
        self.inner.checkpoint_sequence.fetch_max(version.sequence, Ordering::AcqRel);
        self.prune_history(version.sequence);

        info!(
            sequence = version.sequence,
            records = version.index.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Checkpoint committed"
        );
        Ok(())
    }

    async fn persist_version(
        &self,
        sequence: SequenceNumber,
        index: &Index,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        let image = encode_image(index, sequence, self.inner.comparator.fingerprint())?;
        let requested = (image.len() + MANIFEST_SIZE) as u64;
        let limit = self.inner.config.storage.max_storage_bytes();
        if requested > limit {
            return Err(Error::CapacityExceeded { resource: "storage", requested, limit });
        }

        let backend = std::sync::Arc::clone(&self.inner.backend);
        let manifest = self.inner.manifest.lock().clone();
        let entry_count = index.len() as u64;
        let cancel = cancel.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::task::spawn_blocking(move || {
            persist(backend.as_ref(), manifest, sequence, &image, entry_count, &cancel, &shutdown)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "Checkpoint spawn_blocking panicked");
            Error::Io { source: std::io::Error::other(e) }
        })?
    }

    /// Records that every mutation up to `sequence` is stable in the
    /// replication log. Returns the stable sequence number now in effect,
    /// which may be greater than `sequence`.
    ///
    /// Retained versions older than the newest one at or below the stable
    /// sequence number are released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] on a terminal store.
    pub fn on_operation_stable(&self, sequence: SequenceNumber) -> Result<SequenceNumber> {
        self.ensure_open()?;
        let previous = self.inner.stable_sequence.fetch_max(sequence, Ordering::AcqRel);
        let stable = previous.max(sequence);
        if stable > previous {
            self.prune_history(stable);
        }
        Ok(stable)
    }

    /// Sequence number of the last committed checkpoint (or the one loaded
    /// at open).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] on a terminal store.
    pub fn last_checkpoint_sequence_number(&self) -> Result<SequenceNumber> {
        self.ensure_open()?;
        Ok(self.inner.checkpoint_sequence.load(Ordering::Acquire))
    }

    /// Highest sequence number reported through
    /// [`on_operation_stable`](Self::on_operation_stable).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] on a terminal store.
    pub fn stable_sequence_number(&self) -> Result<SequenceNumber> {
        self.ensure_open()?;
        Ok(self.inner.stable_sequence.load(Ordering::Acquire))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use strata_types::{StorageConfig, StoreConfig};

    use super::*;
    use crate::{backend::InMemoryBackend, index::IndexLayout};

    fn entry(key: &str, value: &str, seq: u64) -> Entry {
        Entry {
            sort_key: Bytes::copy_from_slice(key.as_bytes()),
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            seq,
        }
    }

    fn sample_index() -> Index {
        Index::from_entries(
            IndexLayout::default(),
            [entry("a", "1", 1), entry("b", "22", 2), entry("c", "", 3)],
        )
    }

    async fn open_shared(backend: &Arc<InMemoryBackend>, exists: bool) -> Store {
        let config = StoreConfig { storage: StorageConfig::volatile(), ..StoreConfig::default() };
        Store::open_with_backend(config, exists, Arc::clone(backend) as Arc<dyn StorageBackend>)
            .await
            .unwrap()
    }

    // =========================================================================
    // Image format
    // =========================================================================

    #[test]
    fn test_image_roundtrip() {
        let image = encode_image(&sample_index(), 3, 0xFEED).unwrap();
        let decoded = decode_image(&image).unwrap();
        assert_eq!(decoded.fingerprint, 0xFEED);
        assert_eq!(decoded.sequence, 3);
        let keys: Vec<_> = decoded.records.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(decoded.records[1].value.as_ref(), b"22");
        assert_eq!(decoded.records[2].seq, 3);
    }

    #[test]
    fn test_image_detects_damage() {
        let mut image = encode_image(&sample_index(), 3, 0).unwrap();
        let mid = image.len() / 2;
        image[mid] ^= 0xFF;
        assert!(matches!(decode_image(&image), Err(Error::Corrupted { .. })));

        let mut image = encode_image(&sample_index(), 3, 0).unwrap();
        image[0] = b'X';
        assert!(matches!(decode_image(&image), Err(Error::InvalidMagic)));

        assert!(matches!(decode_image(&[0u8; 4]), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_decode_record_truncated() {
        let mut buf = Vec::new();
        encode_record(&entry("key", "value", 9), &mut buf).unwrap();
        let (record, consumed) = decode_record(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(record.seq, 9);
        assert!(decode_record(&buf[..buf.len() - 1]).is_err());
    }

    // =========================================================================
    // Persist and load
    // =========================================================================

    #[test]
    fn test_persist_then_load() {
        let backend = InMemoryBackend::new();
        let index = sample_index();
        let image = encode_image(&index, 3, 0).unwrap();
        let none = CancellationToken::new();
        let manifest = persist(&backend, Manifest::new(), 3, &image, 3, &none, &none).unwrap();
        assert_eq!(manifest.primary_slot_index(), 1);

        let loaded = load(&backend).unwrap().unwrap();
        assert_eq!(loaded.image.sequence, 3);
        assert_eq!(loaded.image.records.len(), 3);

        // A second checkpoint replaces the first image.
        let image = encode_image(&index, 7, 0).unwrap();
        persist(&backend, loaded.manifest, 7, &image, 3, &none, &none).unwrap();
        assert_eq!(backend.list_images().unwrap(), vec![7]);
        assert_eq!(load(&backend).unwrap().unwrap().image.sequence, 7);
    }

    #[test]
    fn test_cancelled_persist_leaves_previous_checkpoint() {
        let backend = InMemoryBackend::new();
        let none = CancellationToken::new();
        let image = encode_image(&sample_index(), 3, 0).unwrap();
        let manifest = persist(&backend, Manifest::new(), 3, &image, 3, &none, &none).unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let image = encode_image(&sample_index(), 9, 0).unwrap();
        let err = persist(&backend, manifest, 9, &image, 3, &cancelled, &none).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(load(&backend).unwrap().unwrap().image.sequence, 3);
        assert_eq!(backend.list_images().unwrap(), vec![3]);
    }

    #[test]
    fn test_load_falls_back_to_valid_slot() {
        let backend = InMemoryBackend::new();
        let none = CancellationToken::new();
        let image = encode_image(&sample_index(), 3, 0).unwrap();
        let mut manifest = persist(&backend, Manifest::new(), 3, &image, 3, &none, &none).unwrap();

        // Point the god byte at the empty slot.
        manifest.flip_primary_slot();
        backend.write_manifest(&manifest.to_bytes()).unwrap();

        let loaded = load(&backend).unwrap().unwrap();
        assert_eq!(loaded.image.sequence, 3);
        assert_eq!(loaded.manifest.slot(loaded.manifest.primary_slot_index()).checkpoint_sequence, 3);
    }

    #[test]
    fn test_load_rejects_image_mismatch() {
        let backend = InMemoryBackend::new();
        let none = CancellationToken::new();
        let image = encode_image(&sample_index(), 3, 0).unwrap();
        persist(&backend, Manifest::new(), 3, &image, 3, &none, &none).unwrap();
        backend.write_image(3, b"replaced").unwrap();
        assert!(matches!(load(&backend), Err(Error::Corrupted { .. })));
    }

    // =========================================================================
    // Store integration
    // =========================================================================

    #[tokio::test]
    async fn test_checkpoint_and_reopen() {
        let backend = Arc::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();
        let store = open_shared(&backend, false).await;
        store.insert(b"a", b"1", 1, &cancel).await.unwrap();
        store.insert(b"b", b"2", 2, &cancel).await.unwrap();
        store.checkpoint(2, &cancel).await.unwrap();
        store.insert(b"c", b"3", 3, &cancel).await.unwrap();
        assert_eq!(store.last_checkpoint_sequence_number().unwrap(), 2);
        store.close(false).await.unwrap();

        let reopened = open_shared(&backend, true).await;
        assert_eq!(reopened.last_committed_sequence_number().unwrap(), 2);
        assert_eq!(reopened.seek(b"b", &cancel).await.unwrap().as_ref(), b"2");
        assert!(reopened.seek(b"c", &cancel).await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_checkpoint_resolves_older_version() {
        let backend = Arc::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();
        let store = open_shared(&backend, false).await;
        store.insert(b"a", b"1", 10, &cancel).await.unwrap();
        store.update(b"a", b"2", 20, &cancel).await.unwrap();

        store.checkpoint(15, &cancel).await.unwrap();
        assert_eq!(store.last_checkpoint_sequence_number().unwrap(), 10);
        // At or below the last checkpoint: no-op.
        store.checkpoint(10, &cancel).await.unwrap();
        store.checkpoint(5, &cancel).await.unwrap();
        // Versions before the checkpoint are gone.
        assert!(matches!(store.version_at(5), Err(Error::VersionUnavailable { oldest: 10, .. })));

        store.close(false).await.unwrap();
        let reopened = open_shared(&backend, true).await;
        assert_eq!(reopened.seek(b"a", &cancel).await.unwrap().as_ref(), b"1");
    }

    #[tokio::test]
    async fn test_checkpoint_below_stable_persists_newest_stable_version() {
        let backend = Arc::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();
        let store = open_shared(&backend, false).await;
        store.insert(b"a", b"1", 10, &cancel).await.unwrap();
        store.update(b"a", b"2", 20, &cancel).await.unwrap();
        store.update(b"a", b"3", 30, &cancel).await.unwrap();

        assert_eq!(store.on_operation_stable(20).unwrap(), 20);
        assert!(matches!(store.version_at(15), Err(Error::VersionUnavailable { oldest: 20, .. })));
        store.checkpoint(15, &cancel).await.unwrap();
        assert_eq!(store.last_checkpoint_sequence_number().unwrap(), 20);

        store.close(false).await.unwrap();
        let reopened = open_shared(&backend, true).await;
        assert_eq!(reopened.last_committed_sequence_number().unwrap(), 20);
        assert_eq!(reopened.seek(b"a", &cancel).await.unwrap().as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_cancelled_checkpoint_does_not_advance() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = open_shared(&backend, false).await;
        store.insert(b"a", b"1", 1, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(store.checkpoint(1, &cancel).await, Err(Error::Cancelled)));
        assert_eq!(store.last_checkpoint_sequence_number().unwrap(), 0);
        assert!(backend.read_manifest().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_storage_budget() {
        let storage = StorageConfig::builder().max_storage_mb(1).is_volatile(true).build().unwrap();
        let config = StoreConfig { storage, ..StoreConfig::default() };
        let store = Store::open(config, false).await.unwrap();
        let cancel = CancellationToken::new();
        let value = vec![7u8; 400 * 1024];
        for i in 0..3u64 {
            store.insert(&i.to_be_bytes(), &value, i + 1, &cancel).await.unwrap();
        }
        let err = store.checkpoint(3, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { resource: "storage", .. }));
        assert_eq!(store.last_checkpoint_sequence_number().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aborted_store_rejects_checkpoint() {
        let store = open_shared(&Arc::new(InMemoryBackend::new()), false).await;
        store.abort();
        assert!(matches!(
            store.checkpoint(1, &CancellationToken::new()).await,
            Err(Error::Aborted)
        ));
        assert!(matches!(store.on_operation_stable(1), Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn test_on_operation_stable_is_monotonic() {
        let store = open_shared(&Arc::new(InMemoryBackend::new()), false).await;
        assert_eq!(store.on_operation_stable(5).unwrap(), 5);
        assert_eq!(store.on_operation_stable(3).unwrap(), 5);
        assert_eq!(store.on_operation_stable(8).unwrap(), 8);
        assert_eq!(store.stable_sequence_number().unwrap(), 8);
        assert_eq!(store.statistics().unwrap().stable_sequence_number, 8);
    }
}
