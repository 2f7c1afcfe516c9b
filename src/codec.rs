//! Pure record/header framing codec. No I/O happens here; segments and the
//! scanner feed it bytes and positions.

use byteorder::{BigEndian, WriteBytesExt};
use prost::Message;

use crate::error::{LogError, LogResult};
use crate::format::{
    metadata_size, LogEntry, LogHeader, Metadata, MAX_ENTRY_BYTES, RECORD_DELIMITER,
};

/// A record framed for disk: delimiter, metadata block, payload.
#[derive(Debug, Clone)]
pub struct FramedRecord {
    /// The complete frame bytes.
    pub bytes: Vec<u8>,
    /// CRC-32C of the payload bytes (as stored in the metadata block).
    pub checksum: i32,
    /// Payload length in bytes.
    pub length: i32,
}

/// Byte offset of the payload within a record frame (past delimiter and
/// metadata block).
pub fn payload_offset_in_frame() -> u64 {
    2 + metadata_size() as u64
}

/// Frame `entry` for appending: `u16 delimiter | metadata | payload`.
pub fn encode_record(entry: &LogEntry) -> FramedRecord {
    let payload = entry.encode_to_vec();
    let metadata = Metadata::for_bytes(&payload);

    let mut bytes = Vec::with_capacity(2 + metadata_size() + payload.len());
    // Vec<u8> writes are infallible.
    let _ = bytes.write_u16::<BigEndian>(RECORD_DELIMITER);
    bytes.extend_from_slice(&metadata.encode_to_vec());
    bytes.extend_from_slice(&payload);

    FramedRecord {
        bytes,
        checksum: metadata.checksum(),
        length: metadata.length(),
    }
}

/// Encode the file header block: `metadata | LogHeader`.
pub fn encode_header(version: i32, verify_checksum: bool) -> Vec<u8> {
    let header = LogHeader::new(version, verify_checksum).encode_to_vec();
    let metadata = Metadata::for_bytes(&header);
    let mut bytes = Vec::with_capacity(metadata_size() + header.len());
    bytes.extend_from_slice(&metadata.encode_to_vec());
    bytes.extend_from_slice(&header);
    bytes
}

/// Decode a metadata block from exactly [`metadata_size()`] bytes.
pub fn decode_metadata(bytes: &[u8]) -> LogResult<Metadata> {
    Metadata::decode(bytes)
        .map_err(|e| LogError::DataCorruption(format!("metadata block: {e}")))
}

/// Decode a file header from its serialized bytes.
pub fn decode_header(bytes: &[u8]) -> LogResult<LogHeader> {
    LogHeader::decode(bytes).map_err(|e| LogError::DataCorruption(format!("file header: {e}")))
}

/// Decode a record payload from exactly the bytes the metadata block claims.
/// An entry whose encoding runs past that window fails to decode here, which
/// is how over-length entries are rejected.
pub fn decode_entry(payload: &[u8]) -> LogResult<LogEntry> {
    LogEntry::decode(payload)
        .map_err(|e| LogError::DataCorruption(format!("record envelope: {e}")))
}

/// Validate a length field read from a metadata block before allocating.
pub fn validate_length(length: i32) -> LogResult<usize> {
    if length < 0 || length > MAX_ENTRY_BYTES {
        return Err(LogError::DataCorruption(format!(
            "implausible record length {length}"
        )));
    }
    Ok(length as usize)
}
