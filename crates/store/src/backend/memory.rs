//! In-memory storage backend for volatile stores and testing.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{MANIFEST_SIZE, StorageBackend};
use crate::error::{Error, Result};

/// In-memory storage backend.
///
/// Checkpoints are kept in memory and lost when the backend is dropped.
/// Volatile stores use one privately; tests share one between store
/// instances through an `Arc` to simulate a restart.
#[derive(Default)]
pub struct InMemoryBackend {
    /// Manifest bytes, absent until the first checkpoint commits.
    manifest: RwLock<Option<Vec<u8>>>,
    /// Images by sequence number.
    images: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images currently stored.
    pub fn image_count(&self) -> usize {
        self.images.read().len()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_manifest(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.manifest.read().clone())
    }

    fn write_manifest(&self, manifest: &[u8]) -> Result<()> {
        if manifest.len() != MANIFEST_SIZE {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid manifest size: {} (expected {MANIFEST_SIZE})",
                    manifest.len()
                ),
            });
        }
        *self.manifest.write() = Some(manifest.to_vec());
        Ok(())
    }

    fn write_image(&self, sequence: u64, image: &[u8]) -> Result<()> {
        self.images.write().insert(sequence, image.to_vec());
        Ok(())
    }

    fn read_image(&self, sequence: u64) -> Result<Vec<u8>> {
        self.images.read().get(&sequence).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("checkpoint image {sequence} not found"),
            )
            .into()
        })
    }

    fn remove_image(&self, sequence: u64) -> Result<()> {
        self.images.write().remove(&sequence);
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<u64>> {
        Ok(self.images.read().keys().copied().collect())
    }

    fn sync(&self) -> Result<()> {
        // No-op for in-memory storage
        Ok(())
    }

    fn storage_size(&self) -> Result<u64> {
        let manifest = self.manifest.read().as_ref().map_or(0, Vec::len);
        let images: usize = self.images.read().values().map(Vec::len).sum();
        Ok((manifest + images) as u64)
    }

    fn destroy(&self) -> Result<()> {
        *self.manifest.write() = None;
        self.images.write().clear();
        Ok(())
    }
}
