//! Stateful range scans over a store snapshot.
//!
//! A [`Scan`] moves through `Unopened -> Opened -> Closed`. Opening captures
//! the committed version at that moment; later commits are invisible to it.
//! The handle is single-caller: a call that overlaps another on the same
//! handle fails with [`Error::ScanBusy`] instead of waiting.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    index::RangeIter,
    store::Store,
};

/// One step of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPosition {
    /// Raw key as it was inserted.
    pub key: Bytes,
    /// Value, when the scan was opened with `include_values`.
    pub value: Option<Bytes>,
}

#[derive(Debug)]
enum ScanState {
    Unopened,
    Opened(OpenScan),
    Closed,
}

#[derive(Debug)]
struct OpenScan {
    /// Position right after `open`; `reset` returns here.
    initial: RangeIter,
    current: RangeIter,
    include_values: bool,
}

/// Cursor over an ordered key range.
#[derive(Debug)]
pub struct Scan {
    store: Store,
    state: Mutex<ScanState>,
}

impl Store {
    /// Creates an unopened scan over this store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or [`Error::Aborted`] on a terminal store.
    pub fn create_scan(&self) -> Result<Scan> {
        self.ensure_open()?;
        Ok(Scan { store: self.clone(), state: Mutex::new(ScanState::Unopened) })
    }
}

impl Scan {
    fn lock(&self) -> Result<MutexGuard<'_, ScanState>> {
        let guard = self.state.try_lock().ok_or(Error::ScanBusy)?;
        if !matches!(*guard, ScanState::Closed) {
            self.store.ensure_open()?;
        }
        Ok(guard)
    }

    fn opened(state: &mut ScanState) -> Result<&mut OpenScan> {
        match state {
            ScanState::Opened(scan) => Ok(scan),
            ScanState::Unopened => Err(Error::ScanNotOpen),
            ScanState::Closed => Err(Error::ScanClosed),
        }
    }

    /// Opens the scan over keys `k` with `begin_exclusive < k <= end_inclusive`
    /// whose sort key starts with the sort key of `prefix`. Absent bounds are
    /// unbounded.
    ///
    /// Returns the key immediately preceding the first key in range, or
    /// `None` if the range is empty or starts at the first key of the store.
    ///
    /// # Errors
    ///
    /// - [`Error::ScanAlreadyOpen`], [`Error::ScanClosed`] in the wrong state.
    /// - [`Error::InvalidArgument`] for malformed bounds, or a prefix on a
    ///   fixed-width key type.
    pub async fn open(
        &self,
        begin_exclusive: Option<&[u8]>,
        end_inclusive: Option<&[u8]>,
        prefix: Option<&[u8]>,
        include_values: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        let mut state = self.lock()?;
        match *state {
            ScanState::Unopened => {},
            ScanState::Opened(_) => return Err(Error::ScanAlreadyOpen),
            ScanState::Closed => return Err(Error::ScanClosed),
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let comparator = self.store.comparator();
        let begin = begin_exclusive
            .map(|k| comparator.sort_key(&Bytes::copy_from_slice(k)))
            .transpose()?;
        let end = end_inclusive.map(|k| comparator.sort_key(&Bytes::copy_from_slice(k))).transpose()?;
        let prefix = prefix.map(|p| comparator.prefix_key(&Bytes::copy_from_slice(p))).transpose()?;

        let snapshot = self.store.current_state();
        let iter = snapshot.index.range(begin.as_deref(), end.as_deref(), prefix.as_deref());
        let marker = iter
            .peek()
            .and_then(|first| snapshot.index.predecessor(&first.sort_key))
            .map(|entry| entry.key.clone());

        *state = ScanState::Opened(OpenScan { initial: iter.clone(), current: iter, include_values });
        Ok(marker)
    }

    /// Advances to the next key in range. `None` means the scan is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanNotOpen`], [`Error::ScanClosed`], or
    /// [`Error::ScanBusy`] when misused.
    pub async fn move_next(&self, cancel: &CancellationToken) -> Result<Option<ScanPosition>> {
        let mut state = self.lock()?;
        let scan = Self::opened(&mut state)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(scan.current.next().map(|entry| ScanPosition {
            key: entry.key,
            value: scan.include_values.then_some(entry.value),
        }))
    }

    /// Next key without advancing.
    ///
    /// # Errors
    ///
    /// Same as [`move_next`](Self::move_next).
    pub fn peek_next_key(&self) -> Result<Option<Bytes>> {
        let mut state = self.lock()?;
        let scan = Self::opened(&mut state)?;
        Ok(scan.current.peek().map(|entry| entry.key.clone()))
    }

    /// Returns to the position right after `open`, on the same snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`move_next`](Self::move_next).
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        let scan = Self::opened(&mut state)?;
        scan.current = scan.initial.clone();
        Ok(())
    }

    /// Releases the snapshot. Closing twice is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanBusy`] if another call is in progress.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.try_lock().ok_or(Error::ScanBusy)?;
        *state = ScanState::Closed;
        Ok(())
    }
}
