//! Reader-writer lock table keyed by segment id.
//!
//! Writers (append, compaction rewrite) exclude all other access to their
//! segment; readers on the same segment run in parallel; any access to
//! different segments never contends. Lock entries are recycled once nothing
//! outside the table references them; two concurrent acquisitions for the
//! same id always observe the same lock instance (both resolve the entry
//! under the table mutex).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RawRwLock, RwLock};

/// Owned read guard for one segment's lock.
pub type SegmentReadGuard = parking_lot::lock_api::ArcRwLockReadGuard<RawRwLock, ()>;
/// Owned write guard for one segment's lock.
pub type SegmentWriteGuard = parking_lot::lock_api::ArcRwLockWriteGuard<RawRwLock, ()>;

/// Entries with no outstanding guards are swept once the table grows past
/// this many segments.
const RECYCLE_WATERMARK: usize = 64;

/// Table of per-segment reader-writer locks.
#[derive(Default)]
pub struct SegmentLocks {
    table: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
}

impl SegmentLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, segment: u64) -> Arc<RwLock<()>> {
        let mut table = self.table.lock();
        if table.len() > RECYCLE_WATERMARK {
            // Safe to drop: strong_count == 1 means only the table holds it,
            // so no guard is outstanding and no acquirer can race us here.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(
            table
                .entry(segment)
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Acquire the read side of `segment`'s lock.
    pub fn acquire_read(&self, segment: u64) -> SegmentReadGuard {
        self.entry(segment).read_arc()
    }

    /// Acquire the write side of `segment`'s lock.
    pub fn acquire_write(&self, segment: u64) -> SegmentWriteGuard {
        self.entry(segment).write_arc()
    }
}
