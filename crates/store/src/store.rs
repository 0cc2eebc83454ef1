//! Store handle, commit pipeline, and the key-value operations.
//!
//! # Commit protocol
//!
//! The committed state (index root plus last sequence number) lives in an
//! [`ArcSwap`]. Readers load it without locking. A mutation:
//!
//! 1. loads the committed state;
//! 2. rejects a sequence number that does not advance it;
//! 3. computes the next index off to the side (path copy);
//! 4. re-checks cancellation and lifecycle;
//! 5. compare-and-swaps the state under the history lock.
//!
//! Losing the swap re-runs the attempt against the newer state, up to
//! `retries_before_timeout` times. Nothing is published until step 5, so a
//! failure at any earlier step has no effect.
//!
//! # Version history
//!
//! Committed states are retained, oldest first, so that checkpoints and
//! copy streams can resolve a sequence number to the greatest retained
//! state at or below it. A checkpoint, or a stability report from
//! [`Store::on_operation_stable`], releases every version older than the
//! newest one at or below its sequence number.
//!
//! Bytes pinned only by older versions count towards the memory budget and
//! [`StoreStats::memory_usage_bytes`].

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use strata_types::StoreConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{FileBackend, InMemoryBackend, Manifest, StorageBackend},
    checkpoint,
    comparator::KeyComparator,
    copy::CopyReceiver,
    error::{Error, Result, SequenceNumber},
    index::{Entry, Index, IndexLayout},
    metrics,
    operation::{Operation, OperationType, RedoUndo},
    types::length_prefix,
};

/// Lifecycle state of a store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Serving requests.
    Open = 0,
    /// Closed gracefully.
    Closed = 1,
    /// Torn down by [`Store::abort`] or detected corruption.
    Aborted = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Open,
            1 => Lifecycle::Closed,
            _ => Lifecycle::Aborted,
        }
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Bytes held by the current index plus bytes pinned only by retained
    /// older versions.
    pub memory_usage_bytes: u64,
    /// Bytes held by persisted checkpoints.
    pub storage_usage_bytes: u64,
    /// Index nodes (pages) in the current version.
    pub page_count: u64,
    /// Live entries.
    pub record_count: u64,
    /// Last committed sequence number.
    pub last_committed_sequence_number: u64,
    /// Sequence number of the last durable checkpoint.
    pub last_checkpoint_sequence_number: u64,
    /// Highest sequence number reported stable.
    pub stable_sequence_number: u64,
}

/// One committed version of the store.
#[derive(Debug)]
pub(crate) struct CommittedState {
    pub(crate) index: Index,
    pub(crate) sequence: SequenceNumber,
}

/// A retained version.
#[derive(Debug)]
struct RetainedVersion {
    state: Arc<CommittedState>,
    /// Bytes of this version replaced by the next one. Released when this
    /// version is dropped.
    superseded_bytes: usize,
}

/// Committed versions, oldest first. The back is always the current state.
#[derive(Debug)]
pub(crate) struct VersionHistory {
    versions: VecDeque<RetainedVersion>,
    retained_bytes: usize,
}

impl VersionHistory {
    pub(crate) fn new(current: Arc<CommittedState>) -> Self {
        Self {
            versions: VecDeque::from([RetainedVersion { state: current, superseded_bytes: 0 }]),
            retained_bytes: 0,
        }
    }

    /// Appends a new current state. `superseded_bytes` is what the previous
    /// state keeps alive on its own from now on.
    fn push(&mut self, state: Arc<CommittedState>, superseded_bytes: usize) {
        if let Some(previous) = self.versions.back_mut() {
            previous.superseded_bytes = superseded_bytes;
            self.retained_bytes += superseded_bytes;
        }
        self.versions.push_back(RetainedVersion { state, superseded_bytes: 0 });
    }

    /// Greatest retained version whose sequence number is `<= sequence`.
    pub(crate) fn at(&self, sequence: SequenceNumber) -> Result<Arc<CommittedState>> {
        let oldest = self.versions.front().map_or(0, |v| v.state.sequence);
        self.versions
            .iter()
            .rev()
            .find(|v| v.state.sequence <= sequence)
            .map(|v| Arc::clone(&v.state))
            .ok_or(Error::VersionUnavailable { sequence, oldest })
    }

    /// Drops every version older than the newest one at or below
    /// `sequence`. Returns how many were dropped.
    pub(crate) fn release_through(&mut self, sequence: SequenceNumber) -> usize {
        let mut released = 0;
        while self.versions.len() > 1 && self.versions[1].state.sequence <= sequence {
            if let Some(dropped) = self.versions.pop_front() {
                self.retained_bytes -= dropped.superseded_bytes;
                released += 1;
            }
        }
        released
    }

    /// Replaces every version with `state`.
    pub(crate) fn reset(&mut self, state: Arc<CommittedState>) {
        *self = Self::new(state);
    }

    /// Bytes pinned only by versions older than the current one.
    pub(crate) fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Number of retained versions, the current one included.
    pub(crate) fn len(&self) -> usize {
        self.versions.len()
    }
}

/// Raw key plus its normalized sort key.
#[derive(Debug, Clone)]
struct KeyBytes {
    raw: Bytes,
    sort: Bytes,
}

/// Outcome of one commit attempt.
struct Mutation<T> {
    /// Next index, or `None` when the operation changes nothing.
    next: Option<Index>,
    /// Bytes of the current index that `next` no longer shares.
    superseded_bytes: usize,
    output: T,
}

impl<T> Mutation<T> {
    fn commit(next: Index, superseded_bytes: usize, output: T) -> Self {
        Self { next: Some(next), superseded_bytes, output }
    }

    fn unchanged(output: T) -> Self {
        Self { next: None, superseded_bytes: 0, output }
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) comparator: KeyComparator,
    pub(crate) layout: IndexLayout,
    pub(crate) state: ArcSwap<CommittedState>,
    pub(crate) history: Mutex<VersionHistory>,
    lifecycle: AtomicU8,
    /// Cancelled by `abort` and `close`; stops in-flight checkpoints.
    pub(crate) shutdown: CancellationToken,
    pub(crate) stable_sequence: AtomicU64,
    pub(crate) checkpoint_sequence: AtomicU64,
    /// Serializes checkpoints, and lets `close` wait for one in flight.
    pub(crate) checkpoint_lock: tokio::sync::Mutex<()>,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) manifest: Mutex<Manifest>,
    pub(crate) copy: Mutex<CopyReceiver>,
    /// Set once the store holds any state. Copy data is accepted only while
    /// clear.
    pub(crate) mutated: AtomicBool,
}

/// Transactional ordered key-value store.
///
/// `Store` is a cheap-clone handle; clones share one store. Every operation
/// takes the caller's [`CancellationToken`]. An operation cancelled before
/// it commits has no effect.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("partition_id", &self.inner.config.partition_id)
            .field("replica_id", &self.inner.config.replica_id)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

/// Whether bytes `[offset, offset + expected.len())` of `value` equal
/// `expected`. An empty `expected` always matches; a range past the end of
/// the value never does.
pub(crate) fn condition_holds(value: &[u8], offset: u32, expected: &[u8]) -> bool {
    if expected.is_empty() {
        return true;
    }
    let start = offset as usize;
    start
        .checked_add(expected.len())
        .and_then(|end| value.get(start..end))
        .is_some_and(|actual| actual == expected)
}

/// Byte range `[offset, offset + len)` of a value, bounds-checked.
fn checked_range(value_len: usize, offset: u32, len: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    match start.checked_add(len) {
        Some(end) if end <= value_len => Ok(start..end),
        _ => Err(Error::InvalidArgument {
            message: format!("range {start}+{len} exceeds value length {value_len}"),
        }),
    }
}

/// Copies a caller value, rejecting one too large for the record formats.
fn value_bytes(value: &[u8]) -> Result<Bytes> {
    length_prefix(value.len())?;
    Ok(Bytes::copy_from_slice(value))
}

fn splice_value(value: &[u8], range: std::ops::Range<usize>, bytes: &[u8]) -> Bytes {
    let mut buf = BytesMut::from(value);
    buf[range].copy_from_slice(bytes);
    buf.freeze()
}

impl Store {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Opens a store.
    ///
    /// Memory-only configurations (`is_volatile`, or no `path`) get a private
    /// in-memory backend. Otherwise the store directory at `path` is used; it
    /// is created only when `storage_exists` is `false`.
    ///
    /// `storage_exists` asserts whether a persisted checkpoint is expected:
    /// `true` loads it, `false` requires there to be none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration,
    /// [`Error::StorageMismatch`] when `storage_exists` disagrees with what
    /// is on disk, or I/O and corruption errors from loading the checkpoint.
    pub async fn open(config: StoreConfig, storage_exists: bool) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn StorageBackend> = match config.storage.path.clone() {
            Some(path) if !config.storage.is_memory_only() => {
                let backend = tokio::task::spawn_blocking(move || {
                    if storage_exists {
                        FileBackend::open_existing(path)
                    } else {
                        FileBackend::open(path)
                    }
                })
                .await
                .map_err(|e| Error::Io { source: std::io::Error::other(e) })??;
                Arc::new(backend)
            },
            _ => Arc::new(InMemoryBackend::new()),
        };
        Self::open_with_backend(config, storage_exists, backend).await
    }

    /// Opens a store on an explicit backend.
    ///
    /// # Errors
    ///
    /// Same as [`Store::open`].
    pub async fn open_with_backend(
        config: StoreConfig,
        storage_exists: bool,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let comparator = KeyComparator::new(config.key_comparison.clone());
        let layout = IndexLayout {
            max_page_size: config.storage.max_page_size_bytes(),
            store_data_inline: config.storage.store_data_inline,
        };

        let loader = Arc::clone(&backend);
        let loaded = tokio::task::spawn_blocking(move || checkpoint::load(loader.as_ref()))
            .await
            .map_err(|e| Error::Io { source: std::io::Error::other(e) })??;

        if loaded.is_some() != storage_exists {
            return Err(Error::StorageMismatch { expected_exists: storage_exists });
        }

        let (manifest, index, sequence) = match loaded {
            Some(loaded) => {
                if loaded.image.fingerprint != comparator.fingerprint() {
                    return Err(Error::InvalidArgument {
                        message: "key comparison does not match the persisted checkpoint"
                            .to_string(),
                    });
                }
                let mut index = Index::new(layout);
                for record in loaded.image.records {
                    let sort_key = comparator.sort_key(&record.key)?;
                    index.insert(Entry {
                        sort_key,
                        key: record.key,
                        value: record.value,
                        seq: record.seq,
                    });
                }
                (loaded.manifest, index, loaded.image.sequence)
            },
            None => (Manifest::new(), Index::new(layout), 0),
        };

        let initial = Arc::new(CommittedState { index, sequence });
        let record_count = initial.index.len();
        let inner = StoreInner {
            config,
            comparator,
            layout,
            state: ArcSwap::new(Arc::clone(&initial)),
            history: Mutex::new(VersionHistory::new(Arc::clone(&initial))),
            lifecycle: AtomicU8::new(Lifecycle::Open as u8),
            shutdown: CancellationToken::new(),
            stable_sequence: AtomicU64::new(sequence),
            checkpoint_sequence: AtomicU64::new(sequence),
            checkpoint_lock: tokio::sync::Mutex::new(()),
            backend,
            manifest: Mutex::new(manifest),
            copy: Mutex::new(CopyReceiver::default()),
            mutated: AtomicBool::new(sequence > 0 || record_count > 0),
        };
        let store = Self { inner: Arc::new(inner) };

        metrics::set_store_size(
            store.inner.config.partition_id,
            store.inner.config.replica_id,
            record_count,
            initial.index.byte_size(),
        );
        info!(
            partition_id = %store.inner.config.partition_id,
            replica_id = store.inner.config.replica_id,
            sequence,
            records = record_count,
            "Store opened"
        );
        Ok(store)
    }

    /// Closes the store gracefully, waiting for an in-flight checkpoint.
    /// With `erase_storage`, persisted checkpoints are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] if the store is
    /// already terminal, or an I/O error from erasing storage.
    pub async fn close(&self, erase_storage: bool) -> Result<()> {
        self.inner
            .lifecycle
            .compare_exchange(
                Lifecycle::Open as u8,
                Lifecycle::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|state| Self::terminal_error_for(Lifecycle::from_u8(state)))?;

        let _guard = self.inner.checkpoint_lock.lock().await;
        self.inner.shutdown.cancel();

        if erase_storage {
            let backend = Arc::clone(&self.inner.backend);
            tokio::task::spawn_blocking(move || backend.destroy())
                .await
                .map_err(|e| Error::Io { source: std::io::Error::other(e) })??;
        }

        info!(
            partition_id = %self.inner.config.partition_id,
            replica_id = self.inner.config.replica_id,
            erase_storage,
            "Store closed"
        );
        Ok(())
    }

    /// Tears the store down immediately. Outstanding and later operations
    /// fail with [`Error::Aborted`]. Safe to call from any thread, any
    /// number of times.
    pub fn abort(&self) {
        let previous = self.inner.lifecycle.swap(Lifecycle::Aborted as u8, Ordering::AcqRel);
        self.inner.shutdown.cancel();
        if previous != Lifecycle::Aborted as u8 {
            warn!(
                partition_id = %self.inner.config.partition_id,
                replica_id = self.inner.config.replica_id,
                "Store aborted"
            );
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::Acquire))
    }

    fn terminal_error_for(state: Lifecycle) -> Error {
        match state {
            Lifecycle::Aborted => Error::Aborted,
            _ => Error::Closed,
        }
    }

    /// The error an operation on a terminal store fails with.
    pub(crate) fn terminal_error(&self) -> Error {
        Self::terminal_error_for(self.lifecycle())
    }

    /// Fails with `Closed`/`Aborted` unless the store is open.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Open => Ok(()),
            state => Err(Self::terminal_error_for(state)),
        }
    }

    fn fail_corrupted(&self, reason: String) -> Error {
        error!(
            partition_id = %self.inner.config.partition_id,
            replica_id = self.inner.config.replica_id,
            reason = %reason,
            "Index corruption detected"
        );
        self.abort();
        Error::Corrupted { reason }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Key comparator derived from the configuration.
    pub fn comparator(&self) -> &KeyComparator {
        &self.inner.comparator
    }

    /// Last committed sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] on a terminal store.
    pub fn last_committed_sequence_number(&self) -> Result<SequenceNumber> {
        self.ensure_open()?;
        Ok(self.inner.state.load().sequence)
    }

    /// Point-in-time statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] on a terminal store,
    /// or an I/O error querying storage size.
    pub fn statistics(&self) -> Result<StoreStats> {
        self.ensure_open()?;
        let (state, retained) = {
            let history = self.inner.history.lock();
            (self.inner.state.load_full(), history.retained_bytes())
        };
        Ok(StoreStats {
            memory_usage_bytes: (state.index.byte_size() + retained) as u64,
            storage_usage_bytes: self.inner.backend.storage_size()?,
            page_count: state.index.node_count() as u64,
            record_count: state.index.len() as u64,
            last_committed_sequence_number: state.sequence,
            last_checkpoint_sequence_number: self
                .inner
                .checkpoint_sequence
                .load(Ordering::Acquire),
            stable_sequence_number: self.inner.stable_sequence.load(Ordering::Acquire),
        })
    }

    /// Current committed state.
    pub(crate) fn current_state(&self) -> Arc<CommittedState> {
        self.inner.state.load_full()
    }

    // =========================================================================
    // Version history
    // =========================================================================

    /// Greatest retained version whose sequence number is `<= sequence`.
    pub(crate) fn version_at(&self, sequence: SequenceNumber) -> Result<Arc<CommittedState>> {
        self.inner.history.lock().at(sequence)
    }

    /// Releases versions older than the newest one at or below `sequence`.
    pub(crate) fn prune_history(&self, sequence: SequenceNumber) {
        let (released, remaining, retained) = {
            let mut history = self.inner.history.lock();
            let released = history.release_through(sequence);
            (released, history.len(), history.retained_bytes())
        };
        if released > 0 {
            let current = self.inner.state.load();
            metrics::set_store_size(
                self.inner.config.partition_id,
                self.inner.config.replica_id,
                current.index.len(),
                current.index.byte_size() + retained,
            );
            debug!(sequence, released, remaining, "Released retained versions");
        }
    }

    // =========================================================================
    // Commit pipeline
    // =========================================================================

    fn key_bytes(&self, raw: &[u8]) -> Result<KeyBytes> {
        self.owned_key(Bytes::copy_from_slice(raw))
    }

    fn owned_key(&self, raw: Bytes) -> Result<KeyBytes> {
        self.ensure_open()?;
        let sort = self.inner.comparator.sort_key(&raw)?;
        Ok(KeyBytes { raw, sort })
    }

    async fn mutate<T>(
        &self,
        kind: OperationType,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
        compute: impl FnMut(&Index) -> Result<Mutation<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = self.mutate_inner(sequence, cancel, compute).await;
        metrics::record_operation(kind.as_str(), result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn mutate_inner<T>(
        &self,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
        mut compute: impl FnMut(&Index) -> Result<Mutation<T>>,
    ) -> Result<T> {
        let attempts = self.inner.config.storage.retries_before_timeout;
        for _ in 0..attempts {
            self.ensure_open()?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let current = self.inner.state.load_full();
            if sequence <= current.sequence {
                return Err(Error::SequenceRegression {
                    sequence,
                    last_committed: current.sequence,
                });
            }

            let Mutation { next, superseded_bytes, output } = match compute(&current.index) {
                Ok(mutation) => mutation,
                Err(Error::Corrupted { reason }) => return Err(self.fail_corrupted(reason)),
                Err(e) => return Err(e),
            };
            let Some(index) = next else {
                return Ok(output);
            };

            #[cfg(debug_assertions)]
            if let Err(reason) = index.check_invariants() {
                return Err(self.fail_corrupted(reason));
            }

            let retained = self.inner.history.lock().retained_bytes();
            let limit = self.inner.config.storage.max_memory_bytes();
            let footprint = current.index.byte_size() + retained;
            let requested = index.byte_size() + retained + superseded_bytes;
            if requested as u64 > limit && requested > footprint {
                return Err(Error::CapacityExceeded {
                    resource: "memory",
                    requested: requested as u64,
                    limit,
                });
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let next_state = Arc::new(CommittedState { index, sequence });
            {
                let mut history = self.inner.history.lock();
                self.ensure_open()?;
                let previous =
                    self.inner.state.compare_and_swap(&current, Arc::clone(&next_state));
                if Arc::ptr_eq(&*previous, &current) {
                    history.push(Arc::clone(&next_state), superseded_bytes);
                    metrics::set_store_size(
                        self.inner.config.partition_id,
                        self.inner.config.replica_id,
                        next_state.index.len(),
                        next_state.index.byte_size() + history.retained_bytes(),
                    );
                    self.inner.mutated.store(true, Ordering::Release);
                    return Ok(output);
                }
            }

            metrics::record_write_conflict();
            tokio::task::yield_now().await;
        }

        warn!(sequence, attempts, "Write conflict retries exhausted");
        Err(Error::WriteConflict { attempts })
    }

    fn entry(key: &KeyBytes, value: Bytes, sequence: SequenceNumber) -> Entry {
        Entry { sort_key: key.sort.clone(), key: key.raw.clone(), value, seq: sequence }
    }

    /// Removes `key` from a copy of `index`, failing if it vanished.
    fn without(index: &Index, key: &KeyBytes) -> Result<Index> {
        let mut next = index.clone();
        match next.remove(&key.sort) {
            Some(_) => Ok(next),
            None => Err(Error::Corrupted {
                reason: "entry found by lookup but missing on removal".to_string(),
            }),
        }
    }

    fn with(index: &Index, entry: Entry) -> Index {
        let mut next = index.clone();
        next.insert(entry);
        next
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn seek(&self, key: &[u8], cancel: &CancellationToken) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.read_value(key, cancel);
        metrics::record_operation("seek", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    /// Reads `len` bytes at `offset` of the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent, or
    /// [`Error::InvalidArgument`] if the range runs past the value.
    pub async fn partial_seek(
        &self,
        key: &[u8],
        offset: u32,
        len: u32,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.read_value(key, cancel).and_then(|value| {
            let range = checked_range(value.len(), offset, len as usize)?;
            Ok(value.slice(range))
        });
        metrics::record_operation("partial_seek", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    fn read_value(&self, key: &[u8], cancel: &CancellationToken) -> Result<Bytes> {
        let key = self.key_bytes(key)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let state = self.inner.state.load();
        state.index.get(&key.sort).map(|e| e.value.clone()).ok_or(Error::KeyNotFound)
    }

    // =========================================================================
    // Inserts
    // =========================================================================

    /// Creates `key` with `value`. The key must be absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyExists`] if the key is present.
    pub async fn insert(
        &self,
        key: &[u8],
        value: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<RedoUndo> {
        let key = self.key_bytes(key)?;
        self.insert_owned(key, value_bytes(value)?, sequence, cancel).await
    }

    async fn insert_owned(
        &self,
        key: KeyBytes,
        value: Bytes,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<RedoUndo> {
        self.mutate(OperationType::Insert, sequence, cancel, |index| {
            if index.get(&key.sort).is_some() {
                return Err(Error::KeyExists);
            }
            let records = RedoUndo::new(
                &Operation::insert(key.raw.clone(), value.clone()),
                Some(&Operation::delete(key.raw.clone())),
            )?;
            let next = Self::with(index, Self::entry(&key, value.clone(), sequence));
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), records))
        })
        .await
    }

    /// Creates `key` with `value` if absent. When the key is present,
    /// returns its current value and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns sequencing, lifecycle, and argument errors.
    pub async fn insert_with_output(
        &self,
        key: &[u8],
        value: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Option<Bytes>, Option<RedoUndo>)> {
        let key = self.key_bytes(key)?;
        let value = value_bytes(value)?;
        self.mutate(OperationType::Insert, sequence, cancel, |index| {
            if let Some(existing) = index.get(&key.sort) {
                return Ok(Mutation::unchanged((Some(existing.value.clone()), None)));
            }
            let records = RedoUndo::new(
                &Operation::insert(key.raw.clone(), value.clone()),
                Some(&Operation::delete(key.raw.clone())),
            )?;
            let next = Self::with(index, Self::entry(&key, value.clone(), sequence));
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (None, Some(records))))
        })
        .await
    }

    /// Creates or replaces `key`. Returns the prior value, if any.
    ///
    /// # Errors
    ///
    /// Returns sequencing, lifecycle, and argument errors.
    pub async fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Option<Bytes>, RedoUndo)> {
        let key = self.key_bytes(key)?;
        self.upsert_owned(key, value_bytes(value)?, sequence, cancel).await
    }

    async fn upsert_owned(
        &self,
        key: KeyBytes,
        value: Bytes,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Option<Bytes>, RedoUndo)> {
        self.mutate(OperationType::Upsert, sequence, cancel, |index| {
            let prior = index.get(&key.sort).map(|e| e.value.clone());
            let undo = match &prior {
                Some(prior) => Operation::update(key.raw.clone(), prior.clone()),
                None => Operation::delete(key.raw.clone()),
            };
            let records =
                RedoUndo::new(&Operation::upsert(key.raw.clone(), value.clone()), Some(&undo))?;
            let next = Self::with(index, Self::entry(&key, value.clone(), sequence));
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (prior, records)))
        })
        .await
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Replaces the value of an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn update(
        &self,
        key: &[u8],
        value: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<RedoUndo> {
        self.update_with_output(key, value, sequence, cancel).await.map(|(_, records)| records)
    }

    /// Replaces the value of an existing key, returning the prior value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn update_with_output(
        &self,
        key: &[u8],
        value: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, RedoUndo)> {
        let key = self.key_bytes(key)?;
        self.update_owned(key, value_bytes(value)?, sequence, cancel).await
    }

    async fn update_owned(
        &self,
        key: KeyBytes,
        value: Bytes,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, RedoUndo)> {
        self.mutate(OperationType::Update, sequence, cancel, |index| {
            let prior = index.get(&key.sort).map(|e| e.value.clone()).ok_or(Error::KeyNotFound)?;
            let records = RedoUndo::new(
                &Operation::update(key.raw.clone(), value.clone()),
                Some(&Operation::update(key.raw.clone(), prior.clone())),
            )?;
            let next = Self::with(index, Self::entry(&key, value.clone(), sequence));
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (prior, records)))
        })
        .await
    }

    /// Replaces the value of `key` if bytes `[offset, offset + expected.len())`
    /// of its current value equal `expected`. Returns `false`, with no
    /// records and no effect, when they do not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn conditional_update(
        &self,
        key: &[u8],
        value: &[u8],
        offset: u32,
        expected: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        let key = self.key_bytes(key)?;
        self.conditional_update_owned(
            key,
            value_bytes(value)?,
            offset,
            Bytes::copy_from_slice(expected),
            sequence,
            cancel,
        )
        .await
    }

    async fn conditional_update_owned(
        &self,
        key: KeyBytes,
        value: Bytes,
        offset: u32,
        expected: Bytes,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        self.mutate(OperationType::Update, sequence, cancel, |index| {
            let prior = index.get(&key.sort).map(|e| e.value.clone()).ok_or(Error::KeyNotFound)?;
            if !condition_holds(&prior, offset, &expected) {
                return Ok(Mutation::unchanged((false, None)));
            }
            let records = RedoUndo::new(
                &Operation::conditional_update(
                    key.raw.clone(),
                    value.clone(),
                    offset,
                    expected.clone(),
                ),
                Some(&Operation::update(key.raw.clone(), prior)),
            )?;
            let next = Self::with(index, Self::entry(&key, value.clone(), sequence));
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (true, Some(records))))
        })
        .await
    }

    /// Overwrites `bytes.len()` bytes at `offset` within the value of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent, or
    /// [`Error::InvalidArgument`] if the range runs past the value.
    pub async fn partial_update(
        &self,
        key: &[u8],
        offset: u32,
        bytes: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<RedoUndo> {
        let key = self.key_bytes(key)?;
        let (_, records) = self
            .partial_update_owned(key, offset, Bytes::copy_from_slice(bytes), None, sequence, cancel)
            .await?;
        records.ok_or_else(|| Error::Corrupted {
            reason: "unconditional partial update produced no records".to_string(),
        })
    }

    /// Partial update guarded by `expected` at `condition_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent, or
    /// [`Error::InvalidArgument`] if the update range runs past the value.
    #[allow(clippy::too_many_arguments)]
    pub async fn conditional_partial_update(
        &self,
        key: &[u8],
        offset: u32,
        bytes: &[u8],
        condition_offset: u32,
        expected: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        let key = self.key_bytes(key)?;
        self.partial_update_owned(
            key,
            offset,
            Bytes::copy_from_slice(bytes),
            Some((condition_offset, Bytes::copy_from_slice(expected))),
            sequence,
            cancel,
        )
        .await
    }

    async fn partial_update_owned(
        &self,
        key: KeyBytes,
        offset: u32,
        bytes: Bytes,
        condition: Option<(u32, Bytes)>,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        self.mutate(OperationType::PartialUpdate, sequence, cancel, |index| {
            let prior = index.get(&key.sort).map(|e| e.value.clone()).ok_or(Error::KeyNotFound)?;
            let range = checked_range(prior.len(), offset, bytes.len())?;
            let redo = match &condition {
                Some((condition_offset, expected)) => {
                    if !condition_holds(&prior, *condition_offset, expected) {
                        return Ok(Mutation::unchanged((false, None)));
                    }
                    Operation::conditional_partial_update(
                        key.raw.clone(),
                        offset,
                        bytes.clone(),
                        *condition_offset,
                        expected.clone(),
                    )
                },
                None => Operation::partial_update(key.raw.clone(), offset, bytes.clone()),
            };
            let undo = Operation::partial_update(key.raw.clone(), offset, prior.slice(range.clone()));
            let records = RedoUndo::new(&redo, Some(&undo))?;
            let value = splice_value(&prior, range, &bytes);
            let next = Self::with(index, Self::entry(&key, value, sequence));
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (true, Some(records))))
        })
        .await
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Removes an existing key. Returns `true` once removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn delete(
        &self,
        key: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, RedoUndo)> {
        let (_, records) = self.delete_with_output(key, sequence, cancel).await?;
        Ok((true, records))
    }

    /// Removes an existing key, returning its prior value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn delete_with_output(
        &self,
        key: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, RedoUndo)> {
        let key = self.key_bytes(key)?;
        self.delete_owned(key, sequence, cancel).await
    }

    async fn delete_owned(
        &self,
        key: KeyBytes,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, RedoUndo)> {
        self.mutate(OperationType::Delete, sequence, cancel, |index| {
            let prior = index.get(&key.sort).map(|e| e.value.clone()).ok_or(Error::KeyNotFound)?;
            let records = RedoUndo::new(
                &Operation::delete(key.raw.clone()),
                Some(&Operation::insert(key.raw.clone(), prior.clone())),
            )?;
            let next = Self::without(index, &key)?;
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (prior, records)))
        })
        .await
    }

    /// Removes `key` if bytes `[offset, offset + expected.len())` of its
    /// value equal `expected`. Returns `false`, with no records and no
    /// effect, when they do not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub async fn conditional_delete(
        &self,
        key: &[u8],
        offset: u32,
        expected: &[u8],
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        let key = self.key_bytes(key)?;
        self.conditional_delete_owned(key, offset, Bytes::copy_from_slice(expected), sequence, cancel)
            .await
    }

    async fn conditional_delete_owned(
        &self,
        key: KeyBytes,
        offset: u32,
        expected: Bytes,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        self.mutate(OperationType::Delete, sequence, cancel, |index| {
            let prior = index.get(&key.sort).map(|e| e.value.clone()).ok_or(Error::KeyNotFound)?;
            if !condition_holds(&prior, offset, &expected) {
                return Ok(Mutation::unchanged((false, None)));
            }
            let records = RedoUndo::new(
                &Operation::conditional_delete(key.raw.clone(), offset, expected.clone()),
                Some(&Operation::insert(key.raw.clone(), prior)),
            )?;
            let next = Self::without(index, &key)?;
            Ok(Mutation::commit(next, index.path_bytes(&key.sort), (true, Some(records))))
        })
        .await
    }

    /// Removes every key. Returns `false`, with no records and no effect,
    /// when the store is already empty. Erase has no undo record.
    ///
    /// # Errors
    ///
    /// Returns sequencing and lifecycle errors.
    pub async fn erase(
        &self,
        sequence: SequenceNumber,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<RedoUndo>)> {
        self.ensure_open()?;
        let layout = self.inner.layout;
        self.mutate(OperationType::Erase, sequence, cancel, |index| {
            if index.is_empty() {
                return Ok(Mutation::unchanged((false, None)));
            }
            let records = RedoUndo::new(&Operation::erase(), None)?;
            Ok(Mutation::commit(Index::new(layout), index.byte_size(), (true, Some(records))))
        })
        .await
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Decodes a redo (or undo) record and, unless `decode_only`, applies it
    /// at `sequence`. Records at or below the last committed sequence number
    /// were already applied; they are decoded and skipped.
    ///
    /// # Errors
    ///
    /// Returns decoding errors for malformed records, and the same errors the
    /// equivalent direct operation would.
    pub async fn apply_with_output(
        &self,
        sequence: SequenceNumber,
        record: &[u8],
        decode_only: bool,
        cancel: &CancellationToken,
    ) -> Result<Operation> {
        self.ensure_open()?;
        let op = Operation::decode(record)?;
        if decode_only {
            return Ok(op);
        }

        let last_committed = self.inner.state.load().sequence;
        if sequence <= last_committed {
            debug!(
                sequence,
                last_committed,
                operation = op.operation_type.as_str(),
                "Skipping replay of applied operation"
            );
            return Ok(op);
        }

        if op.operation_type == OperationType::Erase {
            self.erase(sequence, cancel).await?;
            return Ok(op);
        }

        let key = self.owned_key(Self::required(&op.key, "key")?)?;
        match op.operation_type {
            OperationType::Insert => {
                let value = Self::required(&op.value, "value")?;
                self.insert_owned(key, value, sequence, cancel).await?;
            },
            OperationType::Upsert => {
                let value = Self::required(&op.value, "value")?;
                self.upsert_owned(key, value, sequence, cancel).await?;
            },
            OperationType::Update => {
                let value = Self::required(&op.value, "value")?;
                match op.conditional_value.clone() {
                    Some(expected) => {
                        let offset = op.conditional_offset;
                        self.conditional_update_owned(key, value, offset, expected, sequence, cancel)
                            .await?;
                    },
                    None => {
                        self.update_owned(key, value, sequence, cancel).await?;
                    },
                }
            },
            OperationType::PartialUpdate => {
                let bytes = Self::required(&op.value, "value")?;
                let condition = op.conditional_value.clone().map(|v| (op.conditional_offset, v));
                self.partial_update_owned(
                    key,
                    op.partial_update_offset,
                    bytes,
                    condition,
                    sequence,
                    cancel,
                )
                .await?;
            },
            OperationType::Delete => match op.conditional_value.clone() {
                Some(expected) => {
                    let offset = op.conditional_offset;
                    self.conditional_delete_owned(key, offset, expected, sequence, cancel).await?;
                },
                None => {
                    self.delete_owned(key, sequence, cancel).await?;
                },
            },
            OperationType::Erase => {},
        }
        Ok(op)
    }

    fn required(field: &Option<Bytes>, name: &str) -> Result<Bytes> {
        field.clone().ok_or_else(|| Error::InvalidArgument {
            message: format!("operation record is missing its {name}"),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use strata_types::{KeyComparison, KeyDataType, StorageConfig, StringCollation};

    use super::*;

    fn config() -> StoreConfig {
        StoreConfig { storage: StorageConfig::volatile(), ..StoreConfig::default() }
    }

    async fn open() -> Store {
        Store::open(config(), false).await.unwrap()
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    // =========================================================================
    // Condition helper
    // =========================================================================

    #[test]
    fn test_condition_holds() {
        assert!(condition_holds(b"hello", 0, b""));
        assert!(condition_holds(b"hello", 99, b""));
        assert!(condition_holds(b"hello", 0, b"he"));
        assert!(condition_holds(b"hello", 3, b"lo"));
        assert!(!condition_holds(b"hello", 3, b"lol"));
        assert!(!condition_holds(b"hello", 1, b"he"));
        assert!(!condition_holds(b"hello", u32::MAX, b"x"));
    }

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(5, 1, 3).unwrap(), 1..4);
        assert_eq!(checked_range(5, 5, 0).unwrap(), 5..5);
        assert!(matches!(checked_range(5, 4, 2), Err(Error::InvalidArgument { .. })));
    }

    // =========================================================================
    // Operation semantics
    // =========================================================================

    #[tokio::test]
    async fn test_insert_then_seek() {
        let store = open().await;
        let records = store.insert(b"k", b"v", 1, &cancel()).await.unwrap();
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"v");
        assert_eq!(records.redo_operation().unwrap().operation_type, OperationType::Insert);
        assert_eq!(
            records.undo_operation().unwrap().unwrap(),
            Operation::delete(Bytes::from_static(b"k"))
        );
        assert_eq!(store.last_committed_sequence_number().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_existing_fails_without_effect() {
        let store = open().await;
        store.insert(b"k", b"v1", 1, &cancel()).await.unwrap();
        let err = store.insert(b"k", b"v2", 2, &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::KeyExists));
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"v1");
        assert_eq!(store.last_committed_sequence_number().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_with_output_reports_existing() {
        let store = open().await;
        let (existing, records) = store.insert_with_output(b"k", b"v1", 1, &cancel()).await.unwrap();
        assert!(existing.is_none());
        assert!(records.is_some());

        let (existing, records) = store.insert_with_output(b"k", b"v2", 2, &cancel()).await.unwrap();
        assert_eq!(existing.as_deref(), Some(b"v1".as_ref()));
        assert!(records.is_none());
        assert_eq!(store.last_committed_sequence_number().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_undo_depends_on_prior() {
        let store = open().await;
        let (prior, records) = store.upsert(b"k", b"v1", 1, &cancel()).await.unwrap();
        assert!(prior.is_none());
        assert_eq!(
            records.undo_operation().unwrap().unwrap().operation_type,
            OperationType::Delete
        );

        let (prior, records) = store.upsert(b"k", b"v2", 2, &cancel()).await.unwrap();
        assert_eq!(prior.as_deref(), Some(b"v1".as_ref()));
        assert_eq!(
            records.undo_operation().unwrap().unwrap(),
            Operation::update(Bytes::from_static(b"k"), Bytes::from_static(b"v1"))
        );
    }

    #[tokio::test]
    async fn test_update_requires_key() {
        let store = open().await;
        let err = store.update(b"missing", b"v", 1, &cancel()).await.unwrap_err();
        assert!(err.is_key_not_found());

        store.insert(b"k", b"old", 2, &cancel()).await.unwrap();
        let (prior, _) = store.update_with_output(b"k", b"new", 3, &cancel()).await.unwrap();
        assert_eq!(prior.as_ref(), b"old");
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = open().await;
        store.insert(b"k", b"version-1", 1, &cancel()).await.unwrap();

        let (ok, records) =
            store.conditional_update(b"k", b"version-2", 8, b"2", 2, &cancel()).await.unwrap();
        assert!(!ok);
        assert!(records.is_none());
        assert_eq!(store.last_committed_sequence_number().unwrap(), 1);

        let (ok, records) =
            store.conditional_update(b"k", b"version-2", 8, b"1", 2, &cancel()).await.unwrap();
        assert!(ok);
        let redo = records.unwrap().redo_operation().unwrap();
        assert_eq!(redo.conditional_value.as_deref(), Some(b"1".as_ref()));
        assert_eq!(redo.conditional_offset, 8);
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"version-2");

        let err = store.conditional_update(b"nope", b"x", 0, b"", 3, &cancel()).await.unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[tokio::test]
    async fn test_partial_update_and_seek() {
        let store = open().await;
        store.insert(b"k", b"abcdef", 1, &cancel()).await.unwrap();

        let records = store.partial_update(b"k", 2, b"XY", 2, &cancel()).await.unwrap();
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"abXYef");
        assert_eq!(
            records.undo_operation().unwrap().unwrap(),
            Operation::partial_update(Bytes::from_static(b"k"), 2, Bytes::from_static(b"cd"))
        );
        assert_eq!(store.partial_seek(b"k", 1, 3, &cancel()).await.unwrap().as_ref(), b"bXY");

        let err = store.partial_update(b"k", 5, b"XY", 3, &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        let err = store.partial_seek(b"k", 4, 3, &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(store.last_committed_sequence_number().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_conditional_partial_update() {
        let store = open().await;
        store.insert(b"k", b"0000", 1, &cancel()).await.unwrap();
        let (ok, _) =
            store.conditional_partial_update(b"k", 0, b"11", 2, b"99", 2, &cancel()).await.unwrap();
        assert!(!ok);
        let (ok, _) =
            store.conditional_partial_update(b"k", 0, b"11", 2, b"00", 2, &cancel()).await.unwrap();
        assert!(ok);
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"1100");
    }

    #[tokio::test]
    async fn test_delete_variants() {
        let store = open().await;
        store.insert(b"a", b"1", 1, &cancel()).await.unwrap();
        store.insert(b"b", b"2", 2, &cancel()).await.unwrap();
        store.insert(b"c", b"3", 3, &cancel()).await.unwrap();

        let (deleted, records) = store.delete(b"a", 4, &cancel()).await.unwrap();
        assert!(deleted);
        assert_eq!(
            records.undo_operation().unwrap().unwrap(),
            Operation::insert(Bytes::from_static(b"a"), Bytes::from_static(b"1"))
        );
        assert!(store.delete(b"a", 5, &cancel()).await.unwrap_err().is_key_not_found());

        let (prior, _) = store.delete_with_output(b"b", 5, &cancel()).await.unwrap();
        assert_eq!(prior.as_ref(), b"2");

        let (ok, _) = store.conditional_delete(b"c", 0, b"x", 6, &cancel()).await.unwrap();
        assert!(!ok);
        let (ok, _) = store.conditional_delete(b"c", 0, b"3", 6, &cancel()).await.unwrap();
        assert!(ok);
        assert_eq!(store.statistics().unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn test_erase() {
        let store = open().await;
        let (erased, records) = store.erase(1, &cancel()).await.unwrap();
        assert!(!erased);
        assert!(records.is_none());
        assert_eq!(store.last_committed_sequence_number().unwrap(), 0);

        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            store.insert(*key, b"v", i as u64 + 1, &cancel()).await.unwrap();
        }
        let (erased, records) = store.erase(10, &cancel()).await.unwrap();
        assert!(erased);
        assert!(records.unwrap().undo.is_none());
        assert_eq!(store.statistics().unwrap().record_count, 0);
        assert!(!store.erase(11, &cancel()).await.unwrap().0);
    }

    // =========================================================================
    // Sequencing, cancellation, budgets
    // =========================================================================

    #[tokio::test]
    async fn test_sequence_regression_rejected() {
        let store = open().await;
        store.insert(b"a", b"1", 5, &cancel()).await.unwrap();
        for sequence in [1, 5] {
            let err = store.insert(b"b", b"2", sequence, &cancel()).await.unwrap_err();
            assert!(matches!(err, Error::SequenceRegression { last_committed: 5, .. }));
        }
        assert!(store.seek(b"b", &cancel()).await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_cancelled_operation_has_no_effect() {
        let store = open().await;
        let token = CancellationToken::new();
        token.cancel();
        let err = store.insert(b"k", b"v", 1, &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(matches!(store.seek(b"k", &token).await, Err(Error::Cancelled)));
        assert_eq!(store.last_committed_sequence_number().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_budget() {
        let storage = StorageConfig::builder().max_memory_mb(1).is_volatile(true).build().unwrap();
        let store =
            Store::open(StoreConfig { storage, ..StoreConfig::default() }, false).await.unwrap();
        let big = vec![0u8; 600 * 1024];
        store.insert(b"a", &big, 1, &cancel()).await.unwrap();
        let err = store.insert(b"b", &big, 2, &cancel()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { resource: "memory", .. }));
        // Shrinking is always allowed.
        store.delete(b"a", 3, &cancel()).await.unwrap();
    }

    async fn open_with_memory_mb(max_memory_mb: u64) -> Store {
        let storage =
            StorageConfig::builder().max_memory_mb(max_memory_mb).is_volatile(true).build().unwrap();
        Store::open(StoreConfig { storage, ..StoreConfig::default() }, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_retained_versions_count_against_memory_budget() {
        let store = open_with_memory_mb(1).await;
        let limit = store.config().storage.max_memory_bytes();
        let value = vec![7u8; 100 * 1024];

        let mut failed_at = None;
        for sequence in 1..=500u64 {
            match store.upsert(b"k", &value, sequence, &cancel()).await {
                Ok(_) => assert!(store.statistics().unwrap().memory_usage_bytes <= limit),
                Err(Error::CapacityExceeded { resource: "memory", .. }) => {
                    failed_at = Some(sequence);
                    break;
                },
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        // Each overwrite pins the previous ~100 KiB leaf.
        let failed_at = failed_at.expect("budget never enforced");
        assert_eq!(failed_at, 11);
        assert_eq!(store.inner.history.lock().len(), 11);
        assert!(store.statistics().unwrap().memory_usage_bytes > 9 * 100 * 1024);

        assert_eq!(store.on_operation_stable(failed_at - 1).unwrap(), 10);
        assert_eq!(store.inner.history.lock().len(), 1);
        assert_eq!(store.inner.history.lock().retained_bytes(), 0);
        assert!(store.statistics().unwrap().memory_usage_bytes < 2 * 100 * 1024);
        store.upsert(b"k", &value, failed_at, &cancel()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stability_reports_bound_retained_versions() {
        let store = open_with_memory_mb(1).await;
        let value = vec![7u8; 100 * 1024];
        for sequence in 1..=500u64 {
            store.upsert(b"k", &value, sequence, &cancel()).await.unwrap();
            store.on_operation_stable(sequence).unwrap();
            assert!(store.inner.history.lock().len() <= 2);
        }
        let stats = store.statistics().unwrap();
        assert!(stats.memory_usage_bytes < 2 * 100 * 1024, "{}", stats.memory_usage_bytes);
        assert!(matches!(store.version_at(499), Err(Error::VersionUnavailable { oldest: 500, .. })));
    }

    #[tokio::test]
    async fn test_erase_pins_the_whole_previous_version() {
        let store = open().await;
        for i in 0..100u64 {
            store.insert(&i.to_be_bytes(), b"value", i + 1, &cancel()).await.unwrap();
        }
        let before = store.current_state().index.byte_size();
        store.on_operation_stable(100).unwrap();
        store.erase(101, &cancel()).await.unwrap();
        assert_eq!(store.inner.history.lock().retained_bytes(), before);
        assert_eq!(store.statistics().unwrap().memory_usage_bytes, before as u64);

        store.on_operation_stable(101).unwrap();
        assert_eq!(store.statistics().unwrap().memory_usage_bytes, 0);
    }

    // =========================================================================
    // Write conflicts
    // =========================================================================

    async fn open_with_retries(retries_before_timeout: u32) -> Store {
        let storage = StorageConfig::builder()
            .retries_before_timeout(retries_before_timeout)
            .is_volatile(true)
            .build()
            .unwrap();
        Store::open(StoreConfig { storage, ..StoreConfig::default() }, false).await.unwrap()
    }

    /// Publishes a competing state, as another writer winning the swap would.
    fn race(store: &Store, racer: &'static [u8], sequence: SequenceNumber) {
        let current = store.current_state();
        let mut index = current.index.clone();
        let key = Bytes::from_static(racer);
        index.insert(Entry {
            sort_key: key.clone(),
            key,
            value: Bytes::from_static(b"r"),
            seq: sequence,
        });
        store.inner.state.store(Arc::new(CommittedState { index, sequence }));
    }

    fn put(index: &Index, key: &'static [u8], sequence: SequenceNumber) -> Mutation<()> {
        let key = Bytes::from_static(key);
        let entry =
            Entry { sort_key: key.clone(), key, value: Bytes::from_static(b"v"), seq: sequence };
        Mutation::commit(Store::with(index, entry), 0, ())
    }

    #[tokio::test]
    async fn test_lost_swap_is_retried() {
        let store = open_with_retries(3).await;
        let mut attempts = 0;
        store
            .mutate_inner(10, &cancel(), |index| {
                attempts += 1;
                if attempts == 1 {
                    race(&store, b"racer", 5);
                }
                Ok(put(index, b"mine", 10))
            })
            .await
            .unwrap();

        assert_eq!(attempts, 2);
        let current = store.current_state();
        assert_eq!(current.sequence, 10);
        assert!(current.index.get(b"racer").is_some());
        assert!(current.index.get(b"mine").is_some());
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_write_conflict() {
        let store = open_with_retries(1).await;
        store.insert(b"a", b"1", 1, &cancel()).await.unwrap();

        let mut attempts = 0;
        let err = store
            .mutate_inner(10, &cancel(), |index| {
                attempts += 1;
                race(&store, b"racer", 5);
                Ok(put(index, b"mine", 10))
            })
            .await
            .unwrap_err();

        assert_eq!(attempts, 1);
        assert!(matches!(err, Error::WriteConflict { attempts: 1 }));
        assert!(err.is_retryable());
        assert_eq!(err.code(), strata_types::ErrorCode::WriteConflict);
        let current = store.current_state();
        assert_eq!(current.sequence, 5);
        assert!(current.index.get(b"mine").is_none());
        assert_eq!(store.inner.history.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let key_comparison =
            KeyComparison::builder().data_type(KeyDataType::Int32).max_key_size_bytes(4).build().unwrap();
        let store = Store::open(StoreConfig { key_comparison, ..config() }, false).await.unwrap();
        let err = store.insert(b"abc", b"v", 1, &cancel()).await.unwrap_err();
        assert_eq!(err.code(), strata_types::ErrorCode::ArgumentInvalid);
        store.insert(&7i32.to_le_bytes(), b"v", 1, &cancel()).await.unwrap();
    }

    #[tokio::test]
    async fn test_ignore_case_keys_collide() {
        let key_comparison = KeyComparison::builder()
            .data_type(KeyDataType::String)
            .collation(StringCollation::OrdinalIgnoreCase)
            .build()
            .unwrap();
        let store = Store::open(StoreConfig { key_comparison, ..config() }, false).await.unwrap();
        store.insert(b"Key", b"1", 1, &cancel()).await.unwrap();
        assert!(matches!(store.insert(b"KEY", b"2", 2, &cancel()).await, Err(Error::KeyExists)));
        assert_eq!(store.seek(b"key", &cancel()).await.unwrap().as_ref(), b"1");
    }

    // =========================================================================
    // Replay
    // =========================================================================

    #[tokio::test]
    async fn test_apply_with_output_replays_and_skips() {
        let primary = open().await;
        let secondary = open().await;

        let r1 = primary.insert(b"k", b"v1", 1, &cancel()).await.unwrap();
        let r2 = primary.partial_update(b"k", 1, b"X", 2, &cancel()).await.unwrap();

        let op = secondary.apply_with_output(1, &r1.redo, false, &cancel()).await.unwrap();
        assert_eq!(op.operation_type, OperationType::Insert);
        secondary.apply_with_output(2, &r2.redo, false, &cancel()).await.unwrap();
        assert_eq!(secondary.seek(b"k", &cancel()).await.unwrap().as_ref(), b"vX");

        // Already applied: decoded, not re-applied.
        let op = secondary.apply_with_output(1, &r1.redo, false, &cancel()).await.unwrap();
        assert_eq!(op.operation_type, OperationType::Insert);
        assert_eq!(secondary.last_committed_sequence_number().unwrap(), 2);

        // Decode only leaves the store alone.
        let op = secondary.apply_with_output(3, &r2.undo.unwrap(), true, &cancel()).await.unwrap();
        assert_eq!(op.operation_type, OperationType::PartialUpdate);
        assert_eq!(secondary.last_committed_sequence_number().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_apply_with_output_undo_reverses() {
        let store = open().await;
        store.insert(b"k", b"v1", 1, &cancel()).await.unwrap();
        let (_, records) = store.upsert(b"k", b"v2", 2, &cancel()).await.unwrap();
        store.apply_with_output(3, &records.undo.unwrap(), false, &cancel()).await.unwrap();
        assert_eq!(store.seek(b"k", &cancel()).await.unwrap().as_ref(), b"v1");
    }

    #[tokio::test]
    async fn test_apply_with_output_rejects_garbage() {
        let store = open().await;
        assert!(store.apply_with_output(1, &[], false, &cancel()).await.is_err());
        assert!(store.apply_with_output(1, &[7, 7, 7], false, &cancel()).await.is_err());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_closed_store_rejects_everything() {
        let store = open().await;
        store.insert(b"k", b"v", 1, &cancel()).await.unwrap();
        store.close(false).await.unwrap();

        assert_eq!(store.lifecycle(), Lifecycle::Closed);
        assert!(matches!(store.seek(b"k", &cancel()).await, Err(Error::Closed)));
        assert!(matches!(store.insert(b"x", b"v", 2, &cancel()).await, Err(Error::Closed)));
        assert!(matches!(store.erase(3, &cancel()).await, Err(Error::Closed)));
        assert!(matches!(store.statistics(), Err(Error::Closed)));
        assert!(matches!(store.close(false).await, Err(Error::Closed)));
        store.abort();
        assert_eq!(store.lifecycle(), Lifecycle::Aborted);
    }

    #[tokio::test]
    async fn test_aborted_store_rejects_everything() {
        let store = open().await;
        let clone = store.clone();
        clone.abort();
        clone.abort();
        assert!(matches!(store.seek(b"k", &cancel()).await, Err(Error::Aborted)));
        assert!(matches!(store.upsert(b"k", b"v", 1, &cancel()).await, Err(Error::Aborted)));
        assert!(matches!(store.last_committed_sequence_number(), Err(Error::Aborted)));
        assert!(matches!(store.close(false).await, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_all_commit() {
        let store = open().await;
        let mut handles = Vec::new();
        for task in 0u64..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut committed = 0;
                for i in 0..50u64 {
                    let sequence = task * 1_000 + i + 1;
                    let key = format!("{task}-{i}");
                    match store.upsert(key.as_bytes(), b"v", sequence, &CancellationToken::new()).await {
                        Ok(_) => committed += 1,
                        Err(Error::SequenceRegression { .. } | Error::WriteConflict { .. }) => {},
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                committed
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        let stats = store.statistics().unwrap();
        assert_eq!(stats.record_count, total);
        assert!(stats.last_committed_sequence_number >= 7_001);
    }
}
