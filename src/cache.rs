//! Cache of open segments, keyed by segment id.
//!
//! Lookups lazily open (and fully scan) segments under the cache mutex, so at
//! most one scanner runs per segment on first touch. Callers get a retained
//! [`SegmentRef`] that releases its reference when dropped. Compaction evicts
//! entries without waiting for outstanding readers; those readers keep their
//! handle (and the underlying descriptors) alive until they drop it.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::LogResult;
use crate::segment::Segment;

/// A retained handle to an open segment. Dropping it releases the reference.
pub struct SegmentRef {
    segment: Arc<Segment>,
}

impl SegmentRef {
    fn retain(segment: Arc<Segment>) -> Self {
        segment.retain();
        Self { segment }
    }

    /// Clone the underlying shared segment without touching the ref count
    /// (used to park a segment in the dirty-channel set).
    pub fn share(&self) -> Arc<Segment> {
        Arc::clone(&self.segment)
    }
}

impl Deref for SegmentRef {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        if let Err(e) = self.segment.release() {
            tracing::error!(segment = self.segment.segment_id(), error = %e, "unbalanced release");
        }
    }
}

/// Concurrent map from segment id to open segment.
pub struct SegmentCache {
    dir: PathBuf,
    records_per_segment: u64,
    no_verify: bool,
    segments: Mutex<HashMap<u64, Arc<Segment>>>,
}

impl SegmentCache {
    /// Create a cache over the log directory `dir`.
    pub fn new(dir: PathBuf, records_per_segment: u64, no_verify: bool) -> Self {
        Self {
            dir,
            records_per_segment,
            no_verify,
            segments: Mutex::new(HashMap::new()),
        }
    }

    /// Segment id covering `address`.
    pub fn segment_for(&self, address: u64) -> u64 {
        address / self.records_per_segment
    }

    /// Retained handle to the segment covering `address`, opening and
    /// scanning it on first touch.
    pub fn get_for_address(&self, address: u64) -> LogResult<SegmentRef> {
        let segment_id = self.segment_for(address);
        let mut segments = self.segments.lock();
        let segment = match segments.get(&segment_id) {
            Some(s) => Arc::clone(s),
            None => {
                let opened = Arc::new(Segment::open(&self.dir, segment_id, self.no_verify)?);
                segments.insert(segment_id, Arc::clone(&opened));
                opened
            }
        };
        Ok(SegmentRef::retain(segment))
    }

    /// Snapshot of every currently open segment (no ref count taken).
    pub fn open_segments(&self) -> Vec<Arc<Segment>> {
        self.segments.lock().values().cloned().collect()
    }

    /// Remove a segment from the cache; the next access reopens and rescans
    /// it. Returns the removed entry, if any.
    pub fn remove(&self, segment_id: u64) -> Option<Arc<Segment>> {
        self.segments.lock().remove(&segment_id)
    }

    /// Drain every open segment (engine shutdown).
    pub fn drain(&self) -> Vec<Arc<Segment>> {
        self.segments.lock().drain().map(|(_, s)| s).collect()
    }
}
