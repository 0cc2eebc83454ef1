//! Deterministic crash points for the checkpoint commit protocol.
//!
//! A test wraps a storage backend so each backend call first asks the
//! [`CrashInjector`] whether to "crash". A crash makes that call fail
//! without taking effect; the test then reopens the untouched backend and
//! checks what recovery sees.
//!
//! ```text
//! write image -> write slot -> sync -> write god byte -> sync -> remove old images
//!      ^              ^          ^            ^            ^            ^
//! DuringImageWrite    |   BeforeFirstSync     |    BeforeSecondSync     |
//!           DuringSlotWrite           BeforeGodByteFlip          DuringImageCleanup
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Where in the commit sequence to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// The new image never lands. The previous checkpoint stays in force.
    DuringImageWrite,
    /// The image is durable but no slot names it.
    DuringSlotWrite,
    /// The secondary slot was written but not synced.
    BeforeFirstSync,
    /// The secondary slot is durable; the god byte still names the old one.
    BeforeGodByteFlip,
    /// The god byte was written but not synced.
    BeforeSecondSync,
    /// Fully committed; superseded images are left behind.
    DuringImageCleanup,
}

impl CrashPoint {
    /// Every crash point, in protocol order.
    pub const ALL: [CrashPoint; 6] = [
        CrashPoint::DuringImageWrite,
        CrashPoint::DuringSlotWrite,
        CrashPoint::BeforeFirstSync,
        CrashPoint::BeforeGodByteFlip,
        CrashPoint::BeforeSecondSync,
        CrashPoint::DuringImageCleanup,
    ];

    /// Whether a crash here happens after the commit point, so recovery
    /// must see the new checkpoint.
    #[must_use]
    pub fn is_after_commit(self) -> bool {
        matches!(self, CrashPoint::BeforeSecondSync | CrashPoint::DuringImageCleanup)
    }
}

/// Counts backend calls and fires once at the configured point.
///
/// Starts disarmed so setup checkpoints run normally.
#[derive(Debug)]
pub struct CrashInjector {
    crash_point: CrashPoint,
    manifest_writes: AtomicU32,
    syncs: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a disarmed injector for `crash_point`.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            manifest_writes: AtomicU32::new(0),
            syncs: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Resets the counters and arms the injector.
    pub fn arm(&self) {
        self.manifest_writes.store(0, Ordering::SeqCst);
        self.syncs.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stops injecting.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether the crash fired.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    fn active(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    fn fire(&self, hit: bool) -> bool {
        if hit {
            self.crashed.store(true, Ordering::SeqCst);
        }
        hit
    }

    /// Called before an image write. Returns `true` to crash.
    pub fn on_image_write(&self) -> bool {
        self.active() && self.fire(self.crash_point == CrashPoint::DuringImageWrite)
    }

    /// Called before a manifest write. Returns `true` to crash.
    pub fn on_manifest_write(&self) -> bool {
        if !self.active() {
            return false;
        }
        let n = self.manifest_writes.fetch_add(1, Ordering::SeqCst);
        self.fire(match self.crash_point {
            CrashPoint::DuringSlotWrite => n == 0,
            CrashPoint::BeforeGodByteFlip => n == 1,
            _ => false,
        })
    }

    /// Called before a sync. Returns `true` to crash.
    pub fn on_sync(&self) -> bool {
        if !self.active() {
            return false;
        }
        let n = self.syncs.fetch_add(1, Ordering::SeqCst);
        self.fire(match self.crash_point {
            CrashPoint::BeforeFirstSync => n == 0,
            CrashPoint::BeforeSecondSync => n == 1,
            _ => false,
        })
    }

    /// Called before an image removal. Returns `true` to crash.
    pub fn on_image_remove(&self) -> bool {
        self.active() && self.fire(self.crash_point == CrashPoint::DuringImageCleanup)
    }
}
