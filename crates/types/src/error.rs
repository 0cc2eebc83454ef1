//! Error classification shared by the store and its callers.
//!
//! Store errors are rich snafu enums local to each crate. Callers that only
//! need to branch on the *kind* of failure (retry, treat as a miss, tear
//! down the replica) use [`ErrorCode`] instead.
//!
//! | Range     | Domain    | Examples                                   |
//! |-----------|-----------|--------------------------------------------|
//! | 1000–1099 | Request   | Key not found, key exists, bad argument    |
//! | 1100–1199 | Ordering  | Sequence regression, write conflict        |
//! | 1200–1299 | Lifecycle | Closed, aborted, cancelled                 |
//! | 1300–1399 | Storage   | Corruption, I/O, capacity                  |

/// Machine-readable error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // --- Request errors (1000–1099) ---
    /// The target key is absent.
    KeyNotFound = 1000,
    /// Insert targeted a key that is already present.
    KeyExists = 1001,
    /// Malformed argument: bad key, out-of-bounds range, invalid config.
    ArgumentInvalid = 1002,
    /// Scan handle misuse (not opened, closed, or used concurrently).
    ScanState = 1003,

    // --- Ordering errors (1100–1199) ---
    /// Sequence number does not advance past the last committed one.
    SequenceRegression = 1100,
    /// Optimistic commit lost too many races.
    WriteConflict = 1101,
    /// Copy stream chunk arrived out of order or on a non-empty store.
    CopyProtocol = 1102,
    /// Requested version is no longer retained.
    VersionUnavailable = 1103,

    // --- Lifecycle errors (1200–1299) ---
    /// Store was closed.
    ObjectClosed = 1200,
    /// Store was aborted.
    Aborted = 1201,
    /// Caller cancelled the operation.
    Cancelled = 1202,

    // --- Storage errors (1300–1399) ---
    /// Persisted or in-memory state failed validation.
    Corrupted = 1300,
    /// Filesystem I/O failure.
    Io = 1301,
    /// Memory or storage budget exhausted.
    CapacityExceeded = 1302,
    /// Persisted state presence disagrees with the caller's expectation.
    StorageMismatch = 1303,
}

impl ErrorCode {
    /// Returns the numeric code value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Converts a numeric code to an `ErrorCode`, returning `None` for unknown values.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::KeyNotFound),
            1001 => Some(Self::KeyExists),
            1002 => Some(Self::ArgumentInvalid),
            1003 => Some(Self::ScanState),
            1100 => Some(Self::SequenceRegression),
            1101 => Some(Self::WriteConflict),
            1102 => Some(Self::CopyProtocol),
            1103 => Some(Self::VersionUnavailable),
            1200 => Some(Self::ObjectClosed),
            1201 => Some(Self::Aborted),
            1202 => Some(Self::Cancelled),
            1300 => Some(Self::Corrupted),
            1301 => Some(Self::Io),
            1302 => Some(Self::CapacityExceeded),
            1303 => Some(Self::StorageMismatch),
            _ => None,
        }
    }

    /// Whether this error is retryable.
    ///
    /// Retryable errors may succeed on a subsequent attempt without any
    /// corrective action by the caller.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::WriteConflict | Self::Io)
    }

    /// Whether the store can no longer serve requests after this error.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ObjectClosed | Self::Aborted | Self::Corrupted)
    }

    /// Suggested recovery action for this error code.
    #[must_use]
    pub const fn suggested_action(self) -> &'static str {
        match self {
            Self::KeyNotFound => "Expected for reads of absent keys. Insert the key first.",
            Self::KeyExists => "Use upsert or update to replace an existing key.",
            Self::ArgumentInvalid => "Fix the argument; the call had no effect.",
            Self::ScanState => "Open the scan before use and drive it from one caller at a time.",
            Self::SequenceRegression => {
                "Resume from last_committed_sequence_number() + 1. The mutation was not applied."
            },
            Self::WriteConflict => "Retry the mutation with a fresh sequence number.",
            Self::CopyProtocol => {
                "Restart the copy from a fresh stream into a freshly opened, empty store."
            },
            Self::VersionUnavailable => {
                "Request a sequence number at or after the last checkpoint."
            },
            Self::ObjectClosed | Self::Aborted => "Reopen the store; the handle is terminal.",
            Self::Cancelled => "The operation had no effect. Reissue it if still needed.",
            Self::Corrupted => "Discard the replica and rebuild it through a copy stream.",
            Self::Io => "Check disk space, permissions, and mount health. May be retryable.",
            Self::CapacityExceeded => "Raise max_memory_mb / max_storage_mb or delete data.",
            Self::StorageMismatch => {
                "Pass storage_exists matching the presence of persisted checkpoints."
            },
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [ErrorCode; 15] = [
        ErrorCode::KeyNotFound,
        ErrorCode::KeyExists,
        ErrorCode::ArgumentInvalid,
        ErrorCode::ScanState,
        ErrorCode::SequenceRegression,
        ErrorCode::WriteConflict,
        ErrorCode::CopyProtocol,
        ErrorCode::VersionUnavailable,
        ErrorCode::ObjectClosed,
        ErrorCode::Aborted,
        ErrorCode::Cancelled,
        ErrorCode::Corrupted,
        ErrorCode::Io,
        ErrorCode::CapacityExceeded,
        ErrorCode::StorageMismatch,
    ];

    #[test]
    fn test_error_code_u16_roundtrip() {
        for code in ALL {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0), None);
        assert_eq!(ErrorCode::from_u16(9999), None);
    }

    #[test]
    fn test_error_code_display_is_numeric() {
        assert_eq!(ErrorCode::KeyNotFound.to_string(), "1000");
        assert_eq!(ErrorCode::StorageMismatch.to_string(), "1303");
    }

    #[test]
    fn test_retryable_and_terminal_are_disjoint() {
        for code in ALL {
            assert!(!(code.is_retryable() && code.is_terminal()), "{code:?}");
            assert!(!code.suggested_action().is_empty());
        }
        assert!(ErrorCode::WriteConflict.is_retryable());
        assert!(ErrorCode::Aborted.is_terminal());
        assert!(!ErrorCode::KeyNotFound.is_terminal());
    }
}
