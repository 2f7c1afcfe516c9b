//! Error types for `streamlog`.

use crate::entry::LogData;

/// Result type for log storage operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors returned by the `streamlog` crate.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk data failed an integrity check (delimiter, checksum, or envelope
    /// decode). The affected segment is unreadable for the rest of the process.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Checksum mismatch detected while reading a record or header.
    #[error("checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch {
        /// Checksum stored in the record/header metadata.
        expected: i32,
        /// Checksum computed from the bytes that were read.
        actual: i32,
    },

    /// A segment file was written by a different engine version.
    #[error("segment version {found} does not match engine version {expected}")]
    VersionMismatch {
        /// Version found in the file header.
        found: i32,
        /// Version this engine writes.
        expected: i32,
    },

    /// A segment file was written without checksums and the engine is verifying.
    #[error("segment file {0} was not generated with checksums, can't verify")]
    UnverifiedSegment(String),

    /// Append to an address that already holds data (or a tombstone) without a
    /// rank that permits overwrite.
    #[error("overwrite rejected at address {0}")]
    Overwrite(u64),

    /// A ranked append lost to a higher-ranked record already at the address.
    #[error("append at address {address} outranked by existing record")]
    DataOutranked {
        /// The contested address.
        address: u64,
    },

    /// A ranked append tied an equally ranked record with a different payload;
    /// the address has already decided its value.
    #[error("value already adopted at address {address}")]
    ValueAdopted {
        /// The contested address.
        address: u64,
        /// The record the address has adopted.
        adopted: Box<LogData>,
    },

    /// A batch append violated the range contract (non-consecutive addresses or
    /// a span of more than two segments).
    #[error("invalid append range: {0}")]
    InvalidArgument(String),

    /// Encoding failed (context datastore serialization).
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding failed (context datastore deserialization).
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid state (operation not allowed in current state).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl LogError {
    /// True when this error indicates on-disk corruption (as opposed to a
    /// rejected operation or an environmental failure).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LogError::DataCorruption(_) | LogError::ChecksumMismatch { .. }
        )
    }
}
