//! Top-level store configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConfigError, KeyComparison, StorageConfig};

/// Smallest copy chunk: 1 KB.
const MIN_COPY_CHUNK_SIZE: usize = 1024;

/// Largest copy chunk: 16 MB.
const MAX_COPY_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Configuration passed to `Store::open`.
///
/// # Validation Rules
///
/// - `storage` and `key_comparison` must each validate
/// - `copy_chunk_size_bytes` must be 1 KB - 16 MB
///
/// # Example
///
/// ```no_run
/// # use strata_types::config::{KeyComparison, KeyDataType, StorageConfig, StoreConfig};
/// let config = StoreConfig::builder()
///     .storage(StorageConfig::volatile())
///     .key_comparison(
///         KeyComparison::builder().data_type(KeyDataType::String).build().expect("valid"),
///     )
///     .build()
///     .expect("valid store config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Partition this replica belongs to.
    #[serde(default = "Uuid::nil")]
    pub partition_id: Uuid,
    /// Replica identifier within the partition.
    #[serde(default)]
    pub replica_id: u64,
    /// Storage location and budgets.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Key type and ordering.
    #[serde(default)]
    pub key_comparison: KeyComparison,
    /// Target payload size of a copy stream chunk.
    #[serde(default = "default_copy_chunk_size")]
    pub copy_chunk_size_bytes: usize,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a new store configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any nested config is invalid or
    /// `copy_chunk_size_bytes` is out of range.
    #[builder]
    pub fn new(
        #[builder(default = Uuid::nil())] partition_id: Uuid,
        #[builder(default)] replica_id: u64,
        #[builder(default)] storage: StorageConfig,
        #[builder(default)] key_comparison: KeyComparison,
        #[builder(default = default_copy_chunk_size())] copy_chunk_size_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { partition_id, replica_id, storage, key_comparison, copy_chunk_size_bytes };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates this config and every nested config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first failing rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.key_comparison.validate()?;
        if !(MIN_COPY_CHUNK_SIZE..=MAX_COPY_CHUNK_SIZE).contains(&self.copy_chunk_size_bytes) {
            return Err(ConfigError::Validation {
                message: format!(
                    "copy_chunk_size_bytes must be {}-{}, got {}",
                    MIN_COPY_CHUNK_SIZE, MAX_COPY_CHUNK_SIZE, self.copy_chunk_size_bytes
                ),
            });
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partition_id: Uuid::nil(),
            replica_id: 0,
            storage: StorageConfig::default(),
            key_comparison: KeyComparison::default(),
            copy_chunk_size_bytes: default_copy_chunk_size(),
        }
    }
}

fn default_copy_chunk_size() -> usize {
    64 * 1024
}
