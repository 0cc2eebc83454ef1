//! Store configurations for tests.

use std::path::Path;

use strata_types::{KeyComparison, KeyDataType, StorageConfig, StoreConfig};

/// Smallest copy chunk the configuration accepts; forces multi-chunk
/// streams out of small stores.
pub const SMALL_COPY_CHUNK: usize = 1024;

/// Memory-only store with default budgets and `Binary` keys.
#[must_use]
pub fn test_store_config() -> StoreConfig {
    StoreConfig { storage: StorageConfig::volatile(), ..StoreConfig::default() }
}

/// Store persisted under `path`, with small nodes so modest data sets
/// build multi-level trees.
#[must_use]
pub fn test_durable_config(path: &Path) -> StoreConfig {
    StoreConfig {
        storage: StorageConfig {
            path: Some(path.to_path_buf()),
            max_page_size_kb: 1,
            ..StorageConfig::default()
        },
        ..StoreConfig::default()
    }
}

/// Memory-only store with keys of `data_type`.
#[must_use]
pub fn test_typed_config(data_type: KeyDataType) -> StoreConfig {
    let max_key_size_bytes = data_type.fixed_width().unwrap_or(256);
    StoreConfig {
        key_comparison: KeyComparison { data_type, max_key_size_bytes, ..KeyComparison::default() },
        ..test_store_config()
    }
}
