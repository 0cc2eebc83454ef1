//! Error types for the strata store.

use std::io;

use snafu::Snafu;
use strata_types::{ConfigError, ErrorCode};

/// Sequence number type.
pub type SequenceNumber = u64;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The target key is absent.
    #[snafu(display("Key not found"))]
    KeyNotFound,

    /// Insert targeted a key that is already present.
    #[snafu(display("Key already exists"))]
    KeyExists,

    /// Key exceeds the configured maximum size.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Malformed argument; the call had no effect.
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// Mutation sequence number does not advance past the last committed one.
    #[snafu(display(
        "Sequence number {sequence} must be greater than last committed {last_committed}"
    ))]
    SequenceRegression {
        /// The rejected sequence number.
        sequence: SequenceNumber,
        /// The store's last committed sequence number.
        last_committed: SequenceNumber,
    },

    /// Optimistic commit lost the race on every attempt.
    #[snafu(display("Write conflict after {attempts} attempts"))]
    WriteConflict {
        /// Number of commit attempts made.
        attempts: u32,
    },

    /// The caller cancelled the operation before it took effect.
    #[snafu(display("Operation cancelled"))]
    Cancelled,

    /// The store was closed.
    #[snafu(display("Store is closed"))]
    Closed,

    /// The store was aborted.
    #[snafu(display("Store is aborted"))]
    Aborted,

    /// A memory or storage budget would be exceeded.
    #[snafu(display("{resource} budget exceeded: {requested} bytes (limit {limit})"))]
    CapacityExceeded {
        /// Which budget (`memory` or `storage`).
        resource: &'static str,
        /// Bytes the operation would need.
        requested: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// Persisted state presence disagrees with `storage_exists`.
    #[snafu(display("Storage mismatch: storage_exists={expected_exists} disagrees with persisted state"))]
    StorageMismatch {
        /// What the caller asserted.
        expected_exists: bool,
    },

    /// The requested version is older than anything retained.
    #[snafu(display("Version {sequence} unavailable (oldest retained {oldest})"))]
    VersionUnavailable {
        /// Requested sequence number.
        sequence: SequenceNumber,
        /// Oldest retained sequence number.
        oldest: SequenceNumber,
    },

    /// Scan used before `open`.
    #[snafu(display("Scan is not open"))]
    ScanNotOpen,

    /// Scan `open` called twice.
    #[snafu(display("Scan is already open"))]
    ScanAlreadyOpen,

    /// Scan used after `close`.
    #[snafu(display("Scan is closed"))]
    ScanClosed,

    /// Two callers drove the same scan handle at once.
    #[snafu(display("Scan is in use by another caller"))]
    ScanBusy,

    /// Copy chunk arrived out of sequence.
    #[snafu(display("Copy chunk out of order: expected {expected}, found {found}"))]
    CopyOutOfOrder {
        /// Next chunk index the receiver expects.
        expected: u32,
        /// Chunk index received.
        found: u32,
    },

    /// Copy stream produced by an incompatible store.
    #[snafu(display("Incompatible copy stream: {reason}"))]
    CopyIncompatible {
        /// Description of the incompatibility.
        reason: String,
    },

    /// Copy data sent to a store that already holds state.
    #[snafu(display("Copy target is not a fresh store"))]
    CopyTargetNotEmpty,

    /// Persisted or in-memory state failed validation.
    #[snafu(display("Corrupted store: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Invalid magic number in a persisted file or stream.
    #[snafu(display("Invalid magic number"))]
    InvalidMagic,

    /// Unsupported persisted or encoded format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Operation record could not be encoded or decoded.
    #[snafu(display("Codec error: {source}"))]
    Codec {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// I/O error from the storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Configuration rejected at open time.
    #[snafu(display("Configuration error: {source}"))]
    Config {
        /// The underlying validation error.
        source: ConfigError,
    },
}

impl Error {
    /// Coarse classification of this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::KeyNotFound => ErrorCode::KeyNotFound,
            Self::KeyExists => ErrorCode::KeyExists,
            Self::KeyTooLarge { .. } | Self::InvalidArgument { .. } | Self::Config { .. } => {
                ErrorCode::ArgumentInvalid
            },
            Self::SequenceRegression { .. } => ErrorCode::SequenceRegression,
            Self::WriteConflict { .. } => ErrorCode::WriteConflict,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Closed => ErrorCode::ObjectClosed,
            Self::Aborted => ErrorCode::Aborted,
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::StorageMismatch { .. } => ErrorCode::StorageMismatch,
            Self::VersionUnavailable { .. } => ErrorCode::VersionUnavailable,
            Self::ScanNotOpen | Self::ScanAlreadyOpen | Self::ScanClosed | Self::ScanBusy => {
                ErrorCode::ScanState
            },
            Self::CopyOutOfOrder { .. }
            | Self::CopyIncompatible { .. }
            | Self::CopyTargetNotEmpty => ErrorCode::CopyProtocol,
            Self::Corrupted { .. }
            | Self::InvalidMagic
            | Self::UnsupportedVersion { .. }
            | Self::Codec { .. } => ErrorCode::Corrupted,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Whether this is the distinguished key-miss outcome.
    #[must_use]
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }
}

// Provide automatic conversion from io::Error to Error::Io for ergonomic ? usage
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config { source }
    }
}
