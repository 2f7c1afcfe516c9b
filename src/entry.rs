//! The payload envelope handed to and returned by the engine.
//!
//! [`LogData`] is the in-memory form of one log record: opaque payload bytes
//! plus stream membership, backpointers, an optional overwrite rank, and
//! optional checkpoint metadata. [`LogData`] converts to and from the wire
//! [`LogEntry`](crate::format::LogEntry); UUIDs are carried on the wire as
//! strings (streams, backpointers) or split 64-bit halves (rank, checkpoint).

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::error::{LogError, LogResult};
use crate::format::{CheckpointEntryType, DataType, LogEntry, WireRank};

/// Rank attached to an append, allowing a higher-ranked proposal to overwrite
/// an address that already holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRank {
    /// Rank value; ordering is decided on this value alone.
    pub rank: u64,
    /// Identity of the proposer (tie metadata, not an ordering key).
    pub uuid: Uuid,
}

impl DataRank {
    /// Build a rank with a fresh random proposer id.
    pub fn new(rank: u64) -> Self {
        Self {
            rank,
            uuid: Uuid::new_v4(),
        }
    }
}

/// Checkpoint metadata carried by checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Kind of checkpoint record.
    pub entry_type: CheckpointEntryType,
    /// Id of the checkpoint this record belongs to.
    pub checkpoint_id: Uuid,
    /// Stream the checkpoint covers.
    pub checkpointed_stream_id: Uuid,
    /// First address covered by the checkpointed stream.
    pub checkpointed_stream_start: i64,
}

/// One log record as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogData {
    /// Payload classification. [`DataType::Trimmed`] doubles as the read-path
    /// sentinel for logically deleted addresses.
    pub data_type: DataType,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
    /// Global address, populated on records read back from the log.
    pub global_address: Option<u64>,
    /// Streams this record belongs to.
    pub streams: BTreeSet<Uuid>,
    /// Per-stream backpointer to the previous address.
    pub backpointers: BTreeMap<Uuid, u64>,
    /// Optional overwrite rank.
    pub rank: Option<DataRank>,
    /// Optional checkpoint metadata.
    pub checkpoint: Option<CheckpointInfo>,
}

impl LogData {
    /// A regular data record carrying `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data_type: DataType::Data,
            data: data.into(),
            global_address: None,
            streams: BTreeSet::new(),
            backpointers: BTreeMap::new(),
            rank: None,
            checkpoint: None,
        }
    }

    /// The sentinel returned for logically deleted addresses. Also recognized
    /// in batched appends, where it advances the trim mark instead of being
    /// written.
    pub fn trimmed(address: u64) -> Self {
        Self {
            data_type: DataType::Trimmed,
            data: Vec::new(),
            global_address: Some(address),
            streams: BTreeSet::new(),
            backpointers: BTreeMap::new(),
            rank: None,
            checkpoint: None,
        }
    }

    /// True when this record is the trimmed sentinel.
    pub fn is_trimmed(&self) -> bool {
        self.data_type == DataType::Trimmed
    }

    /// Attach a rank.
    #[must_use]
    pub fn with_rank(mut self, rank: DataRank) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Convert into the wire envelope written at `address`.
    pub fn to_wire(&self, address: u64) -> LogEntry {
        let mut entry = LogEntry {
            data_type: Some(self.data_type as i32),
            data: Some(self.data.clone()),
            global_address: Some(address),
            streams: self.streams.iter().map(Uuid::to_string).collect(),
            backpointers: self
                .backpointers
                .iter()
                .map(|(id, addr)| (id.to_string(), *addr))
                .collect(),
            ..Default::default()
        };

        if let Some(rank) = &self.rank {
            let (msb, lsb) = rank.uuid.as_u64_pair();
            entry.rank = Some(WireRank {
                rank: Some(rank.rank),
                uuid_most_significant: Some(msb as i64),
                uuid_least_significant: Some(lsb as i64),
            });
        }

        if let Some(ckpt) = &self.checkpoint {
            let (ck_msb, ck_lsb) = ckpt.checkpoint_id.as_u64_pair();
            let (st_msb, st_lsb) = ckpt.checkpointed_stream_id.as_u64_pair();
            entry.checkpoint_entry_type = Some(ckpt.entry_type as i32);
            entry.checkpoint_id_most_significant = Some(ck_msb as i64);
            entry.checkpoint_id_least_significant = Some(ck_lsb as i64);
            entry.checkpointed_stream_id_most_significant = Some(st_msb as i64);
            entry.checkpointed_stream_id_least_significant = Some(st_lsb as i64);
            entry.checkpointed_stream_start_log_address = Some(ckpt.checkpointed_stream_start);
        }

        entry
    }

    /// Convert back from the wire envelope. Malformed contents (unknown data
    /// type, unparseable UUID strings) are corruption: these bytes passed the
    /// checksum, so they were written by a foreign or broken writer.
    pub fn from_wire(entry: &LogEntry) -> LogResult<Self> {
        let raw_type = entry.data_type.unwrap_or(DataType::Data as i32);
        let data_type = DataType::try_from(raw_type)
            .map_err(|_| LogError::DataCorruption(format!("unknown data type {raw_type}")))?;

        let mut streams = BTreeSet::new();
        for s in &entry.streams {
            streams.insert(parse_uuid(s)?);
        }

        let mut backpointers = BTreeMap::new();
        for (id, addr) in &entry.backpointers {
            backpointers.insert(parse_uuid(id)?, *addr);
        }

        let rank = entry.rank.as_ref().map(|r| DataRank {
            rank: r.rank.unwrap_or(0),
            uuid: Uuid::from_u64_pair(
                r.uuid_most_significant.unwrap_or(0) as u64,
                r.uuid_least_significant.unwrap_or(0) as u64,
            ),
        });

        let checkpoint = match entry.checkpoint_entry_type {
            None => None,
            Some(raw) => {
                let entry_type = CheckpointEntryType::try_from(raw).map_err(|_| {
                    LogError::DataCorruption(format!("unknown checkpoint entry type {raw}"))
                })?;
                Some(CheckpointInfo {
                    entry_type,
                    checkpoint_id: Uuid::from_u64_pair(
                        entry.checkpoint_id_most_significant.unwrap_or(0) as u64,
                        entry.checkpoint_id_least_significant.unwrap_or(0) as u64,
                    ),
                    checkpointed_stream_id: Uuid::from_u64_pair(
                        entry.checkpointed_stream_id_most_significant.unwrap_or(0) as u64,
                        entry.checkpointed_stream_id_least_significant.unwrap_or(0) as u64,
                    ),
                    checkpointed_stream_start: entry
                        .checkpointed_stream_start_log_address
                        .unwrap_or(-1),
                })
            }
        };

        Ok(Self {
            data_type,
            data: entry.data.clone().unwrap_or_default(),
            global_address: entry.global_address,
            streams,
            backpointers,
            rank,
            checkpoint,
        })
    }
}

fn parse_uuid(s: &str) -> LogResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| LogError::DataCorruption(format!("invalid uuid string {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogData {
        let mut d = LogData::new(b"payload".to_vec());
        d.streams.insert(Uuid::new_v4());
        d.streams.insert(Uuid::new_v4());
        d.backpointers.insert(Uuid::new_v4(), 17);
        d.rank = Some(DataRank {
            rank: 3,
            uuid: Uuid::new_v4(),
        });
        d.checkpoint = Some(CheckpointInfo {
            entry_type: CheckpointEntryType::Start,
            checkpoint_id: Uuid::new_v4(),
            checkpointed_stream_id: Uuid::new_v4(),
            checkpointed_stream_start: 5,
        });
        d
    }

    #[test]
    fn wire_roundtrip_preserves_envelope() {
        let data = sample();
        let wire = data.to_wire(99);
        let back = LogData::from_wire(&wire).unwrap();
        assert_eq!(back.global_address, Some(99));
        assert_eq!(back.data, data.data);
        assert_eq!(back.streams, data.streams);
        assert_eq!(back.backpointers, data.backpointers);
        assert_eq!(back.rank, data.rank);
        assert_eq!(back.checkpoint, data.checkpoint);
    }

    #[test]
    fn trimmed_sentinel_is_marked() {
        let t = LogData::trimmed(7);
        assert!(t.is_trimmed());
        assert_eq!(t.global_address, Some(7));
        assert!(!LogData::new(b"x".to_vec()).is_trimmed());
    }

    #[test]
    fn bad_uuid_string_is_corruption() {
        let mut wire = LogData::new(b"x".to_vec()).to_wire(0);
        wire.streams.push("not-a-uuid".into());
        let err = LogData::from_wire(&wire).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn unknown_data_type_is_corruption() {
        let mut wire = LogData::new(b"x".to_vec()).to_wire(0);
        wire.data_type = Some(999);
        let err = LogData::from_wire(&wire).unwrap_err();
        assert!(err.is_corruption());
    }
}
