//! Typed key and value encoding.
//!
//! The store itself only sees bytes. These traits convert domain types into
//! the raw wire form expected for a [`KeyDataType`], so a typed wrapper can
//! sit on top of the byte-oriented core:
//! - fixed-width numerics: little-endian
//! - `DateTime` / `TimeSpan`: `i64` ticks of 100 ns (`DateTime` counts from 0001-01-01)
//! - `Guid`: mixed-endian 16-byte layout
//! - `String`: UTF-8
//!
//! Also hosts the varint and length-prefix helpers used by the checkpoint and
//! copy stream formats.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeDelta, Utc};
use strata_types::KeyDataType;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Ticks between 0001-01-01T00:00:00Z and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Ticks per second (one tick is 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Trait for types that can be used as keys in a typed store.
pub trait Key: Sized {
    /// The key data type this encoding produces.
    const DATA_TYPE: KeyDataType;

    /// Encode the key into a byte buffer.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decode a key from a byte slice.
    fn decode(buf: &[u8]) -> Option<Self>;

    /// Encode into a fresh buffer.
    fn to_key_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Trait for types that can be used as values in a typed store.
pub trait Value: Sized {
    /// Encode the value into a byte buffer.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decode a value from a byte slice.
    fn decode(buf: &[u8]) -> Option<Self>;

    /// Encode into a fresh buffer.
    fn to_value_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

// ============================================================================
// Integer Key Implementations
// ============================================================================

macro_rules! le_int_key {
    ($ty:ty, $data_type:expr, $read:ident) => {
        impl Key for $ty {
            const DATA_TYPE: KeyDataType = $data_type;

            fn encode(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            fn decode(buf: &[u8]) -> Option<Self> {
                if buf.len() == std::mem::size_of::<$ty>() {
                    Some(LittleEndian::$read(buf))
                } else {
                    None
                }
            }
        }
    };
}

le_int_key!(i16, KeyDataType::Int16, read_i16);
le_int_key!(u16, KeyDataType::UInt16, read_u16);
le_int_key!(i32, KeyDataType::Int32, read_i32);
le_int_key!(u32, KeyDataType::UInt32, read_u32);
le_int_key!(i64, KeyDataType::Int64, read_i64);
le_int_key!(u64, KeyDataType::UInt64, read_u64);
le_int_key!(f32, KeyDataType::Single, read_f32);
le_int_key!(f64, KeyDataType::Double, read_f64);

impl Key for u8 {
    const DATA_TYPE: KeyDataType = KeyDataType::Byte;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        match buf {
            [byte] => Some(*byte),
            _ => None,
        }
    }
}

// ============================================================================
// Time Key Implementations
// ============================================================================

impl Key for DateTime<Utc> {
    const DATA_TYPE: KeyDataType = KeyDataType::DateTime;

    fn encode(&self, buf: &mut Vec<u8>) {
        let ticks = UNIX_EPOCH_TICKS
            .saturating_add(self.timestamp().saturating_mul(TICKS_PER_SECOND))
            .saturating_add(i64::from(self.timestamp_subsec_nanos() / 100));
        buf.extend_from_slice(&ticks.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let ticks = <i64 as Key>::decode(buf)? - UNIX_EPOCH_TICKS;
        let secs = ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

impl Key for TimeDelta {
    const DATA_TYPE: KeyDataType = KeyDataType::TimeSpan;

    fn encode(&self, buf: &mut Vec<u8>) {
        let ticks = self
            .num_seconds()
            .saturating_mul(TICKS_PER_SECOND)
            .saturating_add(i64::from(self.subsec_nanos() / 100));
        buf.extend_from_slice(&ticks.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let ticks = <i64 as Key>::decode(buf)?;
        let secs = ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        TimeDelta::new(secs, nanos)
    }
}

// ============================================================================
// Guid / String / Bytes Key Implementations
// ============================================================================

impl Key for Uuid {
    const DATA_TYPE: KeyDataType = KeyDataType::Guid;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes_le());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = buf.try_into().ok()?;
        Some(Uuid::from_bytes_le(bytes))
    }
}

impl Key for String {
    const DATA_TYPE: KeyDataType = KeyDataType::String;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        std::str::from_utf8(buf).ok().map(|s| s.to_string())
    }
}

impl Key for Vec<u8> {
    const DATA_TYPE: KeyDataType = KeyDataType::Binary;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        Some(buf.to_vec())
    }
}

// ============================================================================
// Value Implementations
// ============================================================================

impl Value for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        Some(buf.to_vec())
    }
}

impl Value for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        String::from_utf8(buf.to_vec()).ok()
    }
}

impl Value for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() == 8 { Some(LittleEndian::read_u64(buf)) } else { None }
    }
}

// ============================================================================
// Encoding Utilities
// ============================================================================

/// Largest field a length prefix can describe.
pub const MAX_LENGTH_PREFIXED: usize = u32::MAX as usize;

/// Length prefix for a field of `len` bytes.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] above [`MAX_LENGTH_PREFIXED`].
pub fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidArgument {
        message: format!("field of {len} bytes exceeds the {MAX_LENGTH_PREFIXED} byte limit"),
    })
}

/// Encode a length-prefixed byte slice (used for variable-length fields).
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `data` is longer than
/// [`MAX_LENGTH_PREFIXED`]; nothing is written then.
pub fn encode_length_prefixed(data: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    encode_varint(length_prefix(data.len())?, buf);
    buf.extend_from_slice(data);
    Ok(())
}

/// Decode a length-prefixed byte slice. Returns (data, bytes_consumed).
pub fn decode_length_prefixed(buf: &[u8]) -> Option<(&[u8], usize)> {
    let (len, varint_size) = decode_varint(buf)?;
    let total_size = varint_size + len as usize;
    if buf.len() >= total_size { Some((&buf[varint_size..total_size], total_size)) } else { None }
}

/// Encode a u32 as a varint (1-5 bytes).
pub fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        if value < 0x80 {
            buf.push(value as u8);
            return;
        }
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
}

/// Decode a varint from a byte slice. Returns (value, bytes_consumed).
pub fn decode_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 5 {
            return None;
        }

        value |= ((byte & 0x7F) as u32) << shift;

        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }

        shift += 7;
    }

    None
}
