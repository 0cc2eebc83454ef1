//! Key comparison descriptor.
//!
//! Selects how raw key bytes are interpreted and ordered. The descriptor is
//! fixed when a store is opened; changing it for an existing store changes
//! the meaning of every persisted key and is rejected by the copy and
//! checkpoint paths through [`KeyComparison::fingerprint`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Upper bound on `max_key_size_bytes`.
const MAX_KEY_SIZE_LIMIT: u32 = 64 * 1024;

/// Logical type of the keys held in a store.
///
/// Fixed-width numeric types are passed to the store in little-endian wire
/// form. `DateTime` and `TimeSpan` are signed 64-bit tick counts (100 ns).
/// `Char` is a single UTF-16 code unit. `Guid` is the 16-byte mixed-endian
/// layout (`u32 LE`, `u16 LE`, `u16 LE`, 8 raw bytes). `String` is UTF-8.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum KeyDataType {
    /// Arbitrary bytes, unsigned lexicographic order.
    #[default]
    Binary = 0,
    /// Single unsigned byte.
    Byte = 1,
    /// UTF-16 code unit.
    Char = 2,
    /// Signed tick count since 0001-01-01.
    DateTime = 3,
    /// Signed tick count.
    TimeSpan = 4,
    /// Signed 16-bit integer.
    Int16 = 5,
    /// Unsigned 16-bit integer.
    UInt16 = 6,
    /// Signed 32-bit integer.
    Int32 = 7,
    /// Unsigned 32-bit integer.
    UInt32 = 8,
    /// Signed 64-bit integer.
    Int64 = 9,
    /// Unsigned 64-bit integer.
    UInt64 = 10,
    /// IEEE 754 single precision.
    Single = 11,
    /// IEEE 754 double precision.
    Double = 12,
    /// 128-bit GUID.
    Guid = 13,
    /// UTF-8 text.
    String = 14,
}

impl KeyDataType {
    /// Returns the exact encoded width for fixed-width types, or `None` for
    /// `Binary` and `String`.
    #[must_use]
    pub const fn fixed_width(self) -> Option<u32> {
        match self {
            Self::Binary | Self::String => None,
            Self::Byte => Some(1),
            Self::Char | Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Single => Some(4),
            Self::DateTime | Self::TimeSpan | Self::Int64 | Self::UInt64 | Self::Double => Some(8),
            Self::Guid => Some(16),
        }
    }

    /// Whether keys of this type can be matched by byte prefix.
    #[must_use]
    pub const fn supports_prefix(self) -> bool {
        matches!(self, Self::Binary | Self::String)
    }

    /// Stable numeric tag.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Collation applied to `String` keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StringCollation {
    /// Code point order.
    #[default]
    Ordinal = 0,
    /// Code point order after lowercasing both sides.
    OrdinalIgnoreCase = 1,
}

/// Key comparison descriptor supplied at open time.
///
/// # Validation Rules
///
/// - `max_key_size_bytes` must be in 1..=65536
/// - for fixed-width `data_type`s, `max_key_size_bytes` must be at least the type's width
/// - `is_fixed_length` is only meaningful for `Binary` keys
/// - a non-ordinal `collation` requires `data_type = String`
///
/// # Example
///
/// ```no_run
/// # use strata_types::config::{KeyComparison, KeyDataType};
/// let cmp = KeyComparison::builder()
///     .data_type(KeyDataType::Int64)
///     .max_key_size_bytes(8)
///     .build()
///     .expect("valid key comparison");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeyComparison {
    /// Logical key type; selects the comparison function.
    #[serde(default)]
    pub data_type: KeyDataType,
    /// Collation for `String` keys.
    #[serde(default)]
    pub collation: StringCollation,
    /// Largest raw key accepted, in bytes.
    #[serde(default = "default_max_key_size")]
    pub max_key_size_bytes: u32,
    /// When set, every `Binary` key must be exactly `max_key_size_bytes` long.
    #[serde(default)]
    pub is_fixed_length: bool,
}

#[bon::bon]
impl KeyComparison {
    /// Creates a key comparison descriptor with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any rule listed on the type is violated.
    #[builder]
    pub fn new(
        #[builder(default)] data_type: KeyDataType,
        #[builder(default)] collation: StringCollation,
        #[builder(default = default_max_key_size())] max_key_size_bytes: u32,
        #[builder(default)] is_fixed_length: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { data_type, collation, max_key_size_bytes, is_fixed_length };
        config.validate()?;
        Ok(config)
    }
}

impl KeyComparison {
    /// Validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_key_size_bytes == 0 || self.max_key_size_bytes > MAX_KEY_SIZE_LIMIT {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_key_size_bytes must be 1-{}, got {}",
                    MAX_KEY_SIZE_LIMIT, self.max_key_size_bytes
                ),
            });
        }
        if let Some(width) = self.data_type.fixed_width() {
            if self.max_key_size_bytes < width {
                return Err(ConfigError::Validation {
                    message: format!(
                        "max_key_size_bytes must be >= {width} for {:?} keys, got {}",
                        self.data_type, self.max_key_size_bytes
                    ),
                });
            }
        }
        if self.is_fixed_length && self.data_type == KeyDataType::String {
            return Err(ConfigError::Validation {
                message: "is_fixed_length is not supported for String keys".to_string(),
            });
        }
        if self.collation != StringCollation::Ordinal && self.data_type != KeyDataType::String {
            return Err(ConfigError::Validation {
                message: format!(
                    "collation {:?} requires String keys, got {:?}",
                    self.collation, self.data_type
                ),
            });
        }
        Ok(())
    }

    /// Packs the fields that affect key order into a single value.
    ///
    /// Two stores can exchange copy streams or checkpoints only if their
    /// fingerprints are equal.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        (u64::from(self.data_type.as_u8()) << 56)
            | (u64::from(self.collation as u8) << 48)
            | (u64::from(self.is_fixed_length) << 40)
            | u64::from(self.max_key_size_bytes)
    }
}

impl Default for KeyComparison {
    fn default() -> Self {
        Self {
            data_type: KeyDataType::default(),
            collation: StringCollation::default(),
            max_key_size_bytes: default_max_key_size(),
            is_fixed_length: false,
        }
    }
}

fn default_max_key_size() -> u32 {
    1024
}
