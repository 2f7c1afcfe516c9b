//! `streamlog`: segmented append-only log storage engine.
//!
//! Persists a totally ordered sequence of records, addressed by a 64-bit
//! global address, across numbered segment files on local storage. Supports
//! single and batched appends, random reads, prefix trims, per-address
//! tombstones, and compaction that physically reclaims trimmed space.
//!
//! Scope:
//! - wire format and framing (`format`, `codec`)
//! - payload envelope (`entry`)
//! - segment files, their indices and sidecars (`segment`, `cache`)
//! - scan-based recovery (`scan`)
//! - per-segment locking (`lock`)
//! - the engine facade (`engine`), configured through a `ServerContext`
//!
//! Non-goal: replication, cluster membership, or the RPC surface fronting the
//! engine; those live with the surrounding server.
//!
//! ## Contract (what you can rely on)
//!
//! - **Integrity-checked by default**: every record carries a CRC-32C; scans
//!   and reads error loudly on delimiter, checksum, or envelope mismatches.
//!   The engine never attempts to heal corruption.
//! - **At-most-once per address**: an address holds one record; re-appends
//!   fail with `Overwrite` unless a higher rank permits the replacement.
//! - **Explicit durability**: appends are buffered; `sync(true)` is the
//!   barrier that forces every file touched since the previous sync. A
//!   successful append is *visible* to readers immediately but *durable* only
//!   after that barrier.
//! - **Trims are logical until compaction**: tombstoned addresses read as
//!   trimmed immediately; the bytes are reclaimed by `compact()`.

pub mod cache;
pub mod codec;
pub mod context;
pub mod engine;
pub mod entry;
pub mod error;
pub mod format;
pub mod lock;
pub mod scan;
pub mod segment;

pub use context::{FileBackedContext, ServerContext};
pub use engine::StreamLog;
pub use entry::{CheckpointInfo, DataRank, LogData};
pub use error::{LogError, LogResult};
pub use format::{DataType, LogConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn engine_smoke_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Arc::new(FileBackedContext::open(tmp.path()).unwrap());
        let log = StreamLog::open(ctx, LogConfig::default(), false).unwrap();

        log.append(0, &LogData::new(b"hello".to_vec())).unwrap();
        log.append(1, &LogData::new(b"world".to_vec())).unwrap();
        log.sync(true).unwrap();

        assert_eq!(log.read(0).unwrap().unwrap().data, b"hello");
        assert_eq!(log.read(1).unwrap().unwrap().data, b"world");
        assert_eq!(log.global_tail(), 1);
        assert_eq!(log.trim_mark(), 0);
        log.close();
    }

    #[test]
    fn reopen_recovers_tail() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let ctx = Arc::new(FileBackedContext::open(tmp.path()).unwrap());
            let log = StreamLog::open(ctx, LogConfig::default(), false).unwrap();
            for a in 0..5u64 {
                log.append(a, &LogData::new(vec![a as u8])).unwrap();
            }
            log.sync(true).unwrap();
            log.close();
        }

        let ctx = Arc::new(FileBackedContext::open(tmp.path()).unwrap());
        let log = StreamLog::open(ctx, LogConfig::default(), false).unwrap();
        assert_eq!(log.global_tail(), 4);
        assert_eq!(log.read(3).unwrap().unwrap().data, vec![3]);
    }
}
