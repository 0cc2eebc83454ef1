//! Storage configuration: location, budgets, and node sizing.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Largest accepted node size ceiling: 1 MB.
const MAX_PAGE_SIZE_KB: u32 = 1024;

/// Storage layer configuration.
///
/// # Validation Rules
///
/// - `max_storage_mb` and `max_memory_mb` must be >= 1
/// - `max_page_size_kb` must be 1-1024
/// - `retries_before_timeout` must be >= 1
///
/// # Example
///
/// ```no_run
/// # use strata_types::config::StorageConfig;
/// let config = StorageConfig::builder()
///     .path("/var/lib/strata/partition-0".into())
///     .max_memory_mb(256)
///     .build()
///     .expect("valid storage config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Directory holding checkpoints. `None` makes the store memory-only.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Upper bound on a persisted checkpoint image, in MB.
    #[serde(default = "default_max_storage_mb")]
    pub max_storage_mb: u64,
    /// Keep everything in memory; checkpoints do not survive the process.
    #[serde(default)]
    pub is_volatile: bool,
    /// Upper bound on the in-memory index footprint, in MB.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Node size ceiling in KB. Nodes split once they grow past it.
    #[serde(default = "default_max_page_size_kb")]
    pub max_page_size_kb: u32,
    /// Charge value bytes against the node ceiling (`true`) or only a
    /// fixed-size reference (`false`).
    #[serde(default = "default_store_data_inline")]
    pub store_data_inline: bool,
    /// Commit attempts before a contended write gives up.
    #[serde(default = "default_retries_before_timeout")]
    pub retries_before_timeout: u32,
}

#[bon::bon]
impl StorageConfig {
    /// Creates a new storage configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any rule listed on the type is violated.
    #[builder]
    pub fn new(
        path: Option<PathBuf>,
        #[builder(default = default_max_storage_mb())] max_storage_mb: u64,
        #[builder(default)] is_volatile: bool,
        #[builder(default = default_max_memory_mb())] max_memory_mb: u64,
        #[builder(default = default_max_page_size_kb())] max_page_size_kb: u32,
        #[builder(default = default_store_data_inline())] store_data_inline: bool,
        #[builder(default = default_retries_before_timeout())] retries_before_timeout: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            path,
            max_storage_mb,
            is_volatile,
            max_memory_mb,
            max_page_size_kb,
            store_data_inline,
            retries_before_timeout,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StorageConfig {
    /// Volatile configuration with default budgets.
    #[must_use]
    pub fn volatile() -> Self {
        Self { is_volatile: true, ..Self::default() }
    }

    /// Whether the store persists nothing to disk.
    #[must_use]
    pub fn is_memory_only(&self) -> bool {
        self.is_volatile || self.path.is_none()
    }

    /// Node size ceiling in bytes.
    #[must_use]
    pub fn max_page_size_bytes(&self) -> usize {
        self.max_page_size_kb as usize * 1024
    }

    /// In-memory budget in bytes.
    #[must_use]
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    /// Persisted budget in bytes.
    #[must_use]
    pub fn max_storage_bytes(&self) -> u64 {
        self.max_storage_mb.saturating_mul(1024 * 1024)
    }

    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_storage_mb == 0 {
            return Err(ConfigError::Validation {
                message: "max_storage_mb must be >= 1".to_string(),
            });
        }
        if self.max_memory_mb == 0 {
            return Err(ConfigError::Validation {
                message: "max_memory_mb must be >= 1".to_string(),
            });
        }
        if self.max_page_size_kb == 0 || self.max_page_size_kb > MAX_PAGE_SIZE_KB {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_page_size_kb must be 1-{}, got {}",
                    MAX_PAGE_SIZE_KB, self.max_page_size_kb
                ),
            });
        }
        if self.retries_before_timeout == 0 {
            return Err(ConfigError::Validation {
                message: "retries_before_timeout must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_storage_mb: default_max_storage_mb(),
            is_volatile: false,
            max_memory_mb: default_max_memory_mb(),
            max_page_size_kb: default_max_page_size_kb(),
            store_data_inline: default_store_data_inline(),
            retries_before_timeout: default_retries_before_timeout(),
        }
    }
}

fn default_max_storage_mb() -> u64 {
    4096
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_max_page_size_kb() -> u32 {
    8
}

fn default_store_data_inline() -> bool {
    true
}

fn default_retries_before_timeout() -> u32 {
    16
}
