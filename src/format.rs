//! On-disk wire format: protobuf messages, framing constants, checksums.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **File layout**: `MetadataBlock(LogHeader) | LogHeader | Record*`.
//! - **Record framing**: `u16 0x4C45 (big-endian) | MetadataBlock(LogEntry) | LogEntry`,
//!   no padding between records.
//! - **MetadataBlock**: protobuf-encoded [`Metadata`] with both `sfixed32` fields
//!   present, so every block serializes to exactly [`metadata_size()`] bytes.
//! - **Checksum**: CRC-32C over the serialized message bytes (stored as `i32`).
//! - **Trim sidecars**: concatenated length-delimited [`TrimEntry`] messages;
//!   each checksum is CRC-32C over the 8-byte big-endian address.

use std::sync::OnceLock;

use prost::Message;

/// On-disk format version written into every segment header.
pub const VERSION: i32 = 1;

/// Two-byte marker preceding every record frame (`"LE"` in ASCII, written
/// big-endian).
pub const RECORD_DELIMITER: u16 = 0x4C45;

/// Number of addresses a single segment file covers by default.
pub const RECORDS_PER_SEGMENT: u64 = 10_000;

/// Default minimum count of compactable tombstones before a sparse compaction
/// rewrites a segment.
pub const TRIM_THRESHOLD: u64 = RECORDS_PER_SEGMENT / 4;

/// Upper bound on a single record's payload; lengths beyond this are treated
/// as corruption rather than allocated.
pub const MAX_ENTRY_BYTES: i32 = 64 * 1024 * 1024;

/// Engine tuning knobs. The segment geometry is fixed for the lifetime of a
/// log directory; reopening with a different geometry misassigns addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// Addresses per segment file.
    pub records_per_segment: u64,
    /// Minimum pending-trim count before sparse compaction rewrites a segment.
    pub trim_threshold: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            records_per_segment: RECORDS_PER_SEGMENT,
            trim_threshold: TRIM_THRESHOLD,
        }
    }
}

/// Framing metadata preceding the file header and every record payload.
///
/// Both fields use `sfixed32`, so a fully populated `Metadata` always encodes
/// to the same number of bytes; scanners rely on that to slice the block
/// without a length prefix.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Metadata {
    /// CRC-32C of the serialized message that follows this block.
    #[prost(sfixed32, optional, tag = "1")]
    pub checksum: Option<i32>,
    /// Serialized length of the message that follows this block.
    #[prost(sfixed32, optional, tag = "2")]
    pub length: Option<i32>,
}

impl Metadata {
    /// Build the metadata block for `message_bytes`.
    pub fn for_bytes(message_bytes: &[u8]) -> Self {
        Self {
            checksum: Some(checksum_bytes(message_bytes)),
            length: Some(message_bytes.len() as i32),
        }
    }

}

/// Header written once at byte 0 of every segment file.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LogHeader {
    /// Engine format version.
    #[prost(int32, optional, tag = "1")]
    pub version: Option<i32>,
    /// Whether records in this file carry verifiable checksums.
    #[prost(bool, optional, tag = "2")]
    pub verify_checksum: Option<bool>,
}

impl LogHeader {
    /// Construct a header for the current engine.
    pub fn new(version: i32, verify_checksum: bool) -> Self {
        Self {
            version: Some(version),
            verify_checksum: Some(verify_checksum),
        }
    }

}

/// One tombstoned address, appended length-delimited to the `.pending` and
/// `.trimmed` sidecars.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct TrimEntry {
    /// CRC-32C of the 8-byte big-endian address.
    #[prost(sfixed32, optional, tag = "1")]
    pub checksum: Option<i32>,
    /// The tombstoned global address.
    #[prost(uint64, optional, tag = "2")]
    pub address: Option<u64>,
}

impl TrimEntry {
    /// Build a trim entry for `address`.
    pub fn new(address: u64) -> Self {
        Self {
            checksum: Some(checksum_address(address)),
            address: Some(address),
        }
    }

}

/// Payload classification carried in the record envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DataType {
    /// Regular log data.
    Data = 0,
    /// No payload written.
    Empty = 1,
    /// Hole-filling marker.
    Hole = 2,
    /// Logically deleted address (also the read-path sentinel).
    Trimmed = 3,
    /// Rank-only record (no payload, reserves the address).
    RankOnly = 4,
}

/// Kind of checkpoint record referenced by the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CheckpointEntryType {
    /// Checkpoint start marker.
    Start = 0,
    /// Continuation of checkpoint data.
    Continuation = 1,
    /// Checkpoint end marker.
    End = 2,
}

/// Rank attached to an entry, allowing conditional overwrite at an address.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct WireRank {
    /// Rank value; higher values win.
    #[prost(uint64, optional, tag = "1")]
    pub rank: Option<u64>,
    /// Most significant half of the proposer's UUID.
    #[prost(sfixed64, optional, tag = "2")]
    pub uuid_most_significant: Option<i64>,
    /// Least significant half of the proposer's UUID.
    #[prost(sfixed64, optional, tag = "3")]
    pub uuid_least_significant: Option<i64>,
}

/// Full record envelope as serialized on disk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    /// Payload classification.
    #[prost(enumeration = "DataType", optional, tag = "1")]
    pub data_type: Option<i32>,
    /// Opaque payload bytes.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    /// Global address of this record.
    #[prost(uint64, optional, tag = "3")]
    pub global_address: Option<u64>,
    /// Stream ids (UUID strings) this record belongs to.
    #[prost(string, repeated, tag = "4")]
    pub streams: Vec<String>,
    /// Per-stream backpointers (UUID string to previous address).
    #[prost(btree_map = "string, uint64", tag = "5")]
    pub backpointers: std::collections::BTreeMap<String, u64>,
    /// Optional overwrite rank.
    #[prost(message, optional, tag = "6")]
    pub rank: Option<WireRank>,
    /// Checkpoint record kind, when this entry is part of a checkpoint.
    #[prost(enumeration = "CheckpointEntryType", optional, tag = "7")]
    pub checkpoint_entry_type: Option<i32>,
    /// Most significant half of the checkpoint id.
    #[prost(sfixed64, optional, tag = "8")]
    pub checkpoint_id_most_significant: Option<i64>,
    /// Least significant half of the checkpoint id.
    #[prost(sfixed64, optional, tag = "9")]
    pub checkpoint_id_least_significant: Option<i64>,
    /// Least significant half of the checkpointed stream id.
    #[prost(sfixed64, optional, tag = "10")]
    pub checkpointed_stream_id_least_significant: Option<i64>,
    /// Most significant half of the checkpointed stream id.
    #[prost(sfixed64, optional, tag = "11")]
    pub checkpointed_stream_id_most_significant: Option<i64>,
    /// First address covered by the checkpointed stream.
    #[prost(sfixed64, optional, tag = "12")]
    pub checkpointed_stream_start_log_address: Option<i64>,
}

/// Projection of [`LogEntry`] that decodes only the global address. Sparse
/// compaction uses this to classify frames without materializing payloads;
/// unknown fields are skipped by the protobuf decoder.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct LogEntryMetadataOnly {
    /// Global address of the record.
    #[prost(uint64, optional, tag = "3")]
    pub global_address: Option<u64>,
}

/// Serialized width of a fully populated [`Metadata`] block, computed once
/// against a canonical instance.
pub fn metadata_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        Metadata {
            checksum: Some(-1),
            length: Some(-1),
        }
        .encoded_len()
    })
}

/// CRC-32C of `bytes`, as the signed value stored in metadata blocks.
pub fn checksum_bytes(bytes: &[u8]) -> i32 {
    crc32c::crc32c(bytes) as i32
}

/// CRC-32C of an address's 8-byte big-endian encoding (trim sidecar entries).
pub fn checksum_address(address: u64) -> i32 {
    crc32c::crc32c(&address.to_be_bytes()) as i32
}
