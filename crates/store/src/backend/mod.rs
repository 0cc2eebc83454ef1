//! Storage backend abstraction for checkpoints.
//!
//! A backend holds two kinds of objects:
//! - the **manifest**, a small fixed-size header naming the current checkpoint;
//! - **checkpoint images**, one immutable blob per persisted sequence number.
//!
//! Both a directory-based (production) and an in-memory (volatile stores,
//! testing) implementation are provided.
//!
//! # Crash Safety: Dual-Slot Commit
//!
//! The manifest uses a dual-slot commit mechanism:
//! - The manifest contains TWO commit slots (primary and secondary)
//! - A "god byte" indicates which slot is currently active
//! - A checkpoint is written to the INACTIVE slot, then the god byte flips
//! - Recovery reads both slots and uses the valid one
//!
//! An image is always fully written and synced before any slot references
//! it, so the slot chosen at recovery always names a complete image.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use crate::error::{Error, Result};

/// Manifest size in bytes.
/// Layout: 16-byte common header + 2 × 64-byte commit slots + 112 bytes reserved.
pub const MANIFEST_SIZE: usize = 256;

/// Magic number for strata manifests.
pub const MANIFEST_MAGIC: &[u8; 8] = b"STRATAMF";

/// Current manifest format version.
pub const MANIFEST_VERSION: u16 = 1;

/// Storage backend trait for abstracting checkpoint I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads the manifest, or `None` if none was ever written.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_manifest(&self) -> Result<Option<Vec<u8>>>;

    /// Overwrites the manifest in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the manifest size is incorrect.
    fn write_manifest(&self, manifest: &[u8]) -> Result<()>;

    /// Durably stores the image for `sequence`. Returns once the image is
    /// complete on stable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write or sync fails.
    fn write_image(&self, sequence: u64, image: &[u8]) -> Result<()>;

    /// Reads the image for `sequence`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the image is missing or unreadable.
    fn read_image(&self, sequence: u64) -> Result<Vec<u8>>;

    /// Removes the image for `sequence`. Removing a missing image succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if removal fails.
    fn remove_image(&self, sequence: u64) -> Result<()>;

    /// Sequence numbers of every stored image, ascending.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if listing fails.
    fn list_images(&self) -> Result<Vec<u64>>;

    /// Flushes manifest writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Bytes currently used by the manifest and all images.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn storage_size(&self) -> Result<u64>;

    /// Deletes everything this backend stores.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if deletion fails.
    fn destroy(&self) -> Result<()>;
}

/// A single commit slot naming one checkpoint image.
///
/// Two of these are stored in the manifest. The "god byte" indicates which
/// is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSlot {
    /// Sequence number the checkpoint covers.
    pub checkpoint_sequence: u64,
    /// Length of the image in bytes.
    pub image_len: u64,
    /// XXH3-64 of the whole image.
    pub image_checksum: u64,
    /// Entries in the image.
    pub entry_count: u64,
    /// Time the checkpoint was committed (Unix epoch seconds).
    pub timestamp: u64,
    /// Checksum of this slot's fields (XXH3-64).
    pub checksum: u64,
}

impl CommitSlot {
    /// Size of a commit slot on disk (64 bytes).
    pub const SIZE: usize = 64;

    /// Size of checksum-protected region (5 × 8-byte fields before the checksum).
    const CHECKSUMMED_SIZE: usize = 40;

    /// Serializes the slot, computing a fresh checksum.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = self.fields_to_bytes();
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUMMED_SIZE]);
        buf[40..48].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Serializes the slot keeping the stored checksum as is.
    fn to_raw_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = self.fields_to_bytes();
        buf[40..48].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn fields_to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.checkpoint_sequence.to_le_bytes());
        buf[8..16].copy_from_slice(&self.image_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.image_checksum.to_le_bytes());
        buf[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.timestamp.to_le_bytes());
        // Bytes 48-63 are reserved/padding
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            checkpoint_sequence: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            image_len: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            image_checksum: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            entry_count: u64::from_le_bytes(buf[24..32].try_into().ok()?),
            timestamp: u64::from_le_bytes(buf[32..40].try_into().ok()?),
            checksum: u64::from_le_bytes(buf[40..48].try_into().ok()?),
        })
    }

    /// Verifies the checksum of this slot.
    pub fn verify_checksum(&self) -> bool {
        let buf = self.fields_to_bytes();
        let expected = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUMMED_SIZE]);
        self.checksum == expected
    }

    /// Returns this slot with its checksum filled in.
    pub fn sealed(mut self) -> Self {
        let buf = self.fields_to_bytes();
        self.checksum = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUMMED_SIZE]);
        self
    }
}

/// Manifest with dual-slot commit.
///
/// # Layout (256 bytes total)
///
/// - Bytes 0-15: Common header (magic, version, reserved, god_byte)
/// - Bytes 16-79: Commit slot 0 (64 bytes)
/// - Bytes 80-143: Commit slot 1 (64 bytes)
/// - Bytes 144-255: Reserved
///
/// Bit 0 of the god byte (byte 15) is the primary slot index.
///
/// # Commit protocol
///
/// 1. **Write the image** under a fresh name and sync it.
/// 2. **Write the secondary slot** naming the image. The primary is untouched, so a crash here
///    recovers the previous checkpoint.
/// 3. **Sync.**
/// 4. **Flip the god byte.** This is the commit point.
/// 5. **Sync.**
/// 6. **Remove the image the old primary named.**
///
/// **Recovery:** The slot indicated by the god byte is tried first. If its
/// checksum is invalid, the other slot is used. If both are invalid the
/// store cannot be opened.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Format version.
    pub version: u16,
    /// God byte: bit 0 = primary slot.
    pub god_byte: u8,
    /// Commit slots.
    pub slots: [CommitSlot; 2],
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Offset of the god byte.
    pub const GOD_BYTE_OFFSET: usize = 15;

    /// Bit mask for primary slot index in god byte.
    pub const GOD_BYTE_SLOT_MASK: u8 = 0x01;

    /// Creates a manifest with two empty (invalid) slots.
    pub fn new() -> Self {
        Self { version: MANIFEST_VERSION, god_byte: 0, slots: Default::default() }
    }

    /// Index of the primary (active) slot.
    pub fn primary_slot_index(&self) -> usize {
        (self.god_byte & Self::GOD_BYTE_SLOT_MASK) as usize
    }

    /// Index of the secondary (inactive) slot.
    pub fn secondary_slot_index(&self) -> usize {
        1 - self.primary_slot_index()
    }

    /// Slot by index.
    pub fn slot(&self, index: usize) -> &CommitSlot {
        &self.slots[index & 1]
    }

    /// Mutable reference to the secondary slot.
    pub fn secondary_slot_mut(&mut self) -> &mut CommitSlot {
        let idx = self.secondary_slot_index();
        &mut self.slots[idx]
    }

    /// Makes the secondary slot primary.
    pub fn flip_primary_slot(&mut self) {
        self.god_byte ^= Self::GOD_BYTE_SLOT_MASK;
    }

    /// Serializes the manifest.
    pub fn to_bytes(&self) -> [u8; MANIFEST_SIZE] {
        let mut buf = [0u8; MANIFEST_SIZE];
        buf[0..8].copy_from_slice(MANIFEST_MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        buf[Self::GOD_BYTE_OFFSET] = self.god_byte;
        buf[16..16 + CommitSlot::SIZE].copy_from_slice(&self.slots[0].to_raw_bytes());
        buf[80..80 + CommitSlot::SIZE].copy_from_slice(&self.slots[1].to_raw_bytes());
        buf
    }

    /// Deserializes the manifest.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the buffer is too short.
    /// Returns `Error::InvalidMagic` if the magic number does not match.
    /// Returns `Error::UnsupportedVersion` if the format version is unsupported.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < MANIFEST_SIZE {
            return Err(Error::Corrupted { reason: "Manifest too short".to_string() });
        }
        if &buf[0..8] != MANIFEST_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = u16::from_le_bytes([buf[8], buf[9]]);
        if version > MANIFEST_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        let parse = |offset: usize, which: u8| {
            CommitSlot::from_bytes(&buf[offset..offset + CommitSlot::SIZE]).ok_or_else(|| {
                Error::Corrupted { reason: format!("Failed to parse commit slot {which}") }
            })
        };
        let slots = [parse(16, 0)?, parse(80, 1)?];

        Ok(Self { version, god_byte: buf[Self::GOD_BYTE_OFFSET], slots })
    }

    /// Determines which slot to recover from.
    ///
    /// Returns the index of the valid slot, preferring the primary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if both commit slots have invalid checksums.
    pub fn validate_and_choose_slot(&self) -> Result<usize> {
        let primary = self.primary_slot_index();
        if self.slot(primary).verify_checksum() {
            return Ok(primary);
        }
        let secondary = self.secondary_slot_index();
        if self.slot(secondary).verify_checksum() {
            return Ok(secondary);
        }
        Err(Error::Corrupted { reason: "Both commit slots have invalid checksums".to_string() })
    }
}
