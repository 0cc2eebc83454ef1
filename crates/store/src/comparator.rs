//! Key validation and order-preserving normalization.
//!
//! Callers hand the store raw key bytes in the wire form of the configured
//! [`KeyDataType`]. The index never interprets those bytes directly: every
//! key is first mapped to a *sort key* whose unsigned lexicographic order is
//! the configured order. Two raw keys with the same sort key are the same key.
//!
//! | Type                      | Raw form              | Sort key                              |
//! |---------------------------|-----------------------|---------------------------------------|
//! | Binary                    | bytes                 | identity                              |
//! | Byte / UInt16/32/64 / Char| little-endian         | big-endian                            |
//! | Int16/32/64, DateTime, TimeSpan | little-endian   | big-endian, sign bit flipped          |
//! | Single / Double           | little-endian IEEE    | big-endian, total-order transform     |
//! | Guid                      | mixed-endian 16 bytes | big-endian fields, then tail bytes    |
//! | String (Ordinal)          | UTF-8                 | identity                              |
//! | String (OrdinalIgnoreCase)| UTF-8                 | UTF-8 of the lowercase form           |

use bytes::Bytes;
use strata_types::{KeyComparison, KeyDataType, StringCollation};

use crate::error::{Error, Result};

/// Validates raw keys and maps them to sort keys.
#[derive(Debug, Clone)]
pub struct KeyComparator {
    config: KeyComparison,
}

impl KeyComparator {
    /// Creates a comparator for the given descriptor.
    pub fn new(config: KeyComparison) -> Self {
        Self { config }
    }

    /// The descriptor this comparator was built from.
    pub fn config(&self) -> &KeyComparison {
        &self.config
    }

    /// Fingerprint of the ordering; see [`KeyComparison::fingerprint`].
    pub fn fingerprint(&self) -> u64 {
        self.config.fingerprint()
    }

    /// Validates a raw key without normalizing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] if the key exceeds `max_key_size_bytes`.
    /// Returns [`Error::InvalidArgument`] on a width mismatch for fixed-width
    /// types or invalid UTF-8 for `String` keys.
    pub fn validate(&self, raw: &[u8]) -> Result<()> {
        let max = self.config.max_key_size_bytes as usize;
        if raw.len() > max {
            return Err(Error::KeyTooLarge { size: raw.len(), max });
        }
        match self.config.data_type.fixed_width() {
            Some(width) if raw.len() != width as usize => {
                return Err(Error::InvalidArgument {
                    message: format!(
                        "{:?} key must be {width} bytes, got {}",
                        self.config.data_type,
                        raw.len()
                    ),
                });
            },
            _ => {},
        }
        if self.config.is_fixed_length
            && self.config.data_type == KeyDataType::Binary
            && raw.len() != max
        {
            return Err(Error::InvalidArgument {
                message: format!("fixed-length key must be {max} bytes, got {}", raw.len()),
            });
        }
        if self.config.data_type == KeyDataType::String && std::str::from_utf8(raw).is_err() {
            return Err(Error::InvalidArgument { message: "string key is not UTF-8".to_string() });
        }
        Ok(())
    }

    /// Validates `raw` and returns its sort key.
    ///
    /// When the sort key equals the raw bytes, the returned [`Bytes`] shares
    /// the caller-supplied allocation.
    ///
    /// # Errors
    ///
    /// See [`validate`](Self::validate).
    pub fn sort_key(&self, raw: &Bytes) -> Result<Bytes> {
        self.validate(raw)?;
        Ok(self.normalize(raw))
    }

    /// Sort key for a prefix-match bound.
    ///
    /// Prefixes are not subject to the fixed-length rule but are rejected for
    /// fixed-width types, where a byte prefix has no meaning in the
    /// configured order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for fixed-width key types or
    /// invalid UTF-8, and [`Error::KeyTooLarge`] for oversized prefixes.
    pub fn prefix_key(&self, raw: &Bytes) -> Result<Bytes> {
        if !self.config.data_type.supports_prefix() {
            return Err(Error::InvalidArgument {
                message: format!(
                    "prefix match is not supported for {:?} keys",
                    self.config.data_type
                ),
            });
        }
        let max = self.config.max_key_size_bytes as usize;
        if raw.len() > max {
            return Err(Error::KeyTooLarge { size: raw.len(), max });
        }
        if self.config.data_type == KeyDataType::String && std::str::from_utf8(raw).is_err() {
            return Err(Error::InvalidArgument { message: "string prefix is not UTF-8".to_string() });
        }
        Ok(self.normalize(raw))
    }

    fn normalize(&self, raw: &Bytes) -> Bytes {
        match self.config.data_type {
            KeyDataType::Binary | KeyDataType::Byte => raw.clone(),
            KeyDataType::String => match self.config.collation {
                StringCollation::Ordinal => raw.clone(),
                StringCollation::OrdinalIgnoreCase => {
                    // validate() guarantees UTF-8
                    let text = String::from_utf8_lossy(raw);
                    let lowered = text.to_lowercase();
                    if lowered.as_bytes() == raw.as_ref() {
                        raw.clone()
                    } else {
                        Bytes::from(lowered.into_bytes())
                    }
                },
            },
            KeyDataType::Char | KeyDataType::UInt16 | KeyDataType::UInt32 | KeyDataType::UInt64 => {
                Bytes::from(reversed(raw))
            },
            KeyDataType::Int16
            | KeyDataType::Int32
            | KeyDataType::Int64
            | KeyDataType::DateTime
            | KeyDataType::TimeSpan => {
                let mut out = reversed(raw);
                out[0] ^= 0x80;
                Bytes::from(out)
            },
            KeyDataType::Single | KeyDataType::Double => {
                let mut out = reversed(raw);
                if out[0] & 0x80 != 0 {
                    for byte in &mut out {
                        *byte = !*byte;
                    }
                } else {
                    out[0] ^= 0x80;
                }
                Bytes::from(out)
            },
            KeyDataType::Guid => {
                let mut out = Vec::with_capacity(16);
                out.extend(raw[0..4].iter().rev());
                out.extend(raw[4..6].iter().rev());
                out.extend(raw[6..8].iter().rev());
                out.extend_from_slice(&raw[8..16]);
                Bytes::from(out)
            },
        }
    }
}

/// Little-endian to big-endian byte order.
fn reversed(raw: &[u8]) -> Vec<u8> {
    raw.iter().rev().copied().collect()
}
