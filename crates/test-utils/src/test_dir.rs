//! Scratch directories for tests that touch the filesystem.

// Failing to create a scratch directory is a broken test environment.
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Temporary directory removed on drop.
///
/// ```
/// use strata_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let store_path = dir.store_path("partition-0");
/// assert!(store_path.starts_with(dir.path()));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a fresh directory under the system temp location.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: tempfile::Builder::new().prefix("strata-").tempdir().expect("create temp dir") }
    }

    /// Root of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// `path()` joined with `relative`.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        self.path().join(relative)
    }

    /// Location for a store directory named `name`. The directory itself is
    /// not created; opening a store creates it.
    #[must_use]
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.join(name)
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
