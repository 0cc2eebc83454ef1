//! Directory-based storage backend.
//!
//! Layout of a store directory:
//!
//! ```text
//! <path>/
//!   MANIFEST                         fixed-size dual-slot header
//!   checkpoint-00000000000000000042.img
//! ```
//!
//! The manifest is overwritten in place with position-based I/O
//! (`pwrite`), so flipping the god byte never changes the file length.
//! Images are written to a temporary name, synced, and renamed into place,
//! so a reader never observes a partially written image.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::{MANIFEST_SIZE, StorageBackend};
use crate::error::{Error, Result};

const MANIFEST_FILE: &str = "MANIFEST";
const IMAGE_PREFIX: &str = "checkpoint-";
const IMAGE_SUFFIX: &str = ".img";
const TEMP_SUFFIX: &str = ".tmp";

/// Directory-based storage backend.
///
/// Reads of the manifest are lock-free on Unix (`read_exact_at()` takes
/// `&self`). Writes are serialized via `write_lock`.
pub struct FileBackend {
    /// Store directory.
    dir: PathBuf,
    /// Manifest file handle, opened for positional reads and writes.
    manifest: File,
    /// Serializes manifest writes and image renames.
    ///
    /// This is a `Mutex<()>` (not `Mutex<File>`) because the file handle
    /// itself does not need to be wrapped: `write_all_at()` takes `&self`
    /// on Unix.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens (creating if needed) the store directory at `dir`.
    ///
    /// An empty manifest file is created if none exists; it reads back as
    /// "no manifest" until the first checkpoint commits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory or manifest cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let manifest = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(MANIFEST_FILE))?;
        Ok(Self { dir, manifest, write_lock: Mutex::new(()) })
    }

    /// Opens the store directory at `dir` without creating anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageMismatch`] if `dir` holds no manifest, or
    /// [`Error::Io`] if it cannot be opened.
    pub fn open_existing(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manifest =
            match OpenOptions::new().read(true).write(true).open(dir.join(MANIFEST_FILE)) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::StorageMismatch { expected_exists: true });
                },
                Err(e) => return Err(e.into()),
            };
        Ok(Self { dir, manifest, write_lock: Mutex::new(()) })
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn image_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{IMAGE_PREFIX}{sequence:020}{IMAGE_SUFFIX}"))
    }

    /// Syncs the directory entry so renames survive a crash.
    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn parse_image_name(name: &str) -> Option<u64> {
    name.strip_prefix(IMAGE_PREFIX)?.strip_suffix(IMAGE_SUFFIX)?.parse().ok()
}

impl StorageBackend for FileBackend {
    fn read_manifest(&self) -> Result<Option<Vec<u8>>> {
        let len = self.manifest.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }
        if len < MANIFEST_SIZE as u64 {
            return Err(Error::Corrupted { reason: format!("Manifest truncated to {len} bytes") });
        }
        let mut buf = vec![0u8; MANIFEST_SIZE];
        read_exact_at_offset(&self.manifest, &mut buf, 0)?;
        Ok(Some(buf))
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
        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.manifest, manifest, 0)?;
        Ok(())
    }

    fn write_image(&self, sequence: u64, image: &[u8]) -> Result<()> {
        let final_path = self.image_path(sequence);
        let temp_path = final_path.with_extension(format!("img{TEMP_SUFFIX}"));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(image)?;
        file.sync_all()?;
        drop(file);

        let _guard = self.write_lock.lock();
        fs::rename(&temp_path, &final_path)?;
        self.sync_dir()
    }

    fn read_image(&self, sequence: u64) -> Result<Vec<u8>> {
        Ok(fs::read(self.image_path(sequence))?)
    }

    fn remove_image(&self, sequence: u64) -> Result<()> {
        match fs::remove_file(self.image_path(sequence)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_images(&self) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(sequence) = entry.file_name().to_str().and_then(parse_image_name) {
                sequences.push(sequence);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn sync(&self) -> Result<()> {
        // sync_data() takes &self; no lock needed.
        self.manifest.sync_data()?;
        Ok(())
    }

    fn storage_size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    fn destroy(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Windows fallback: `seek_read` updates the file cursor.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
