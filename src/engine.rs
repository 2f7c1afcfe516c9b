//! The storage engine facade: append, read, trim, compact, sync.
//!
//! One [`StreamLog`] owns a log directory of numbered segment files. Appends
//! go through the segment cache to a per-segment write lock; reads share the
//! segment's read lock and never block reads of other segments. Durability is
//! explicit: appends enqueue their file into a dirty set, and `sync(true)`
//! forces everything enqueued so far.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{SegmentCache, SegmentRef};
use crate::codec::encode_record;
use crate::context::ServerContext;
use crate::entry::LogData;
use crate::error::{LogError, LogResult};
use crate::format::LogConfig;
use crate::lock::SegmentLocks;
use crate::scan::{read_log_header, scan_frames, scan_log};
use crate::segment::{segment_path, ChannelKind, Segment};

/// Segmented append-only log storage engine.
pub struct StreamLog {
    context: Arc<dyn ServerContext>,
    config: LogConfig,
    log_dir: PathBuf,
    no_verify: bool,
    cache: SegmentCache,
    locks: SegmentLocks,
    /// Highest address ever written, or -1 while the log is empty.
    global_tail: AtomicI64,
    /// Exclusive lower bound of readable addresses (the trim mark).
    starting_address: AtomicU64,
    /// Highest segment persisted to the server context.
    last_segment: Mutex<u64>,
    /// Files with buffered writes not yet forced to stable storage.
    dirty_channels: Mutex<HashMap<(u64, ChannelKind), Arc<Segment>>>,
    /// Serializes whole-engine compaction runs.
    compact_lock: Mutex<()>,
}

impl std::fmt::Debug for StreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLog")
            .field("log_dir", &self.log_dir)
            .field("no_verify", &self.no_verify)
            .field("global_tail", &self.global_tail)
            .field("starting_address", &self.starting_address)
            .finish_non_exhaustive()
    }
}

impl StreamLog {
    /// Open the engine over `<context.log_path()>/log/`, creating the
    /// directory as needed and recovering `global_tail` by scanning the tail
    /// segment (and its successor, which may have received writes the
    /// persisted tail watermark missed).
    pub fn open(
        context: Arc<dyn ServerContext>,
        config: LogConfig,
        no_verify: bool,
    ) -> LogResult<Self> {
        let log_dir = context.log_path().join("log");
        std::fs::create_dir_all(&log_dir)?;

        let starting_address = context.starting_address();
        let tail_segment = context.tail_segment();

        let engine = Self {
            cache: SegmentCache::new(log_dir.clone(), config.records_per_segment, no_verify),
            locks: SegmentLocks::new(),
            global_tail: AtomicI64::new(-1),
            starting_address: AtomicU64::new(starting_address),
            last_segment: Mutex::new(tail_segment),
            dirty_channels: Mutex::new(HashMap::new()),
            compact_lock: Mutex::new(()),
            context,
            config,
            log_dir,
            no_verify,
        };

        engine.seed_tail_from_segment(tail_segment * config.records_per_segment + 1)?;
        let successor = tail_segment + 1;
        if segment_path(&engine.log_dir, successor).exists() {
            engine.seed_tail_from_segment(successor * config.records_per_segment)?;
        }

        // A prefix trim can run ahead of the last write; catch the tail up.
        if engine.global_tail() < starting_address as i64 - 1 {
            engine.sync_tail_segment(starting_address - 1)?;
        }

        Ok(engine)
    }

    fn seed_tail_from_segment(&self, address: u64) -> LogResult<()> {
        let segment = self.cache.get_for_address(address)?;
        if let Some(max) = segment.max_known_address() {
            self.global_tail.fetch_max(max as i64, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Highest address ever successfully appended, or -1 if none.
    pub fn global_tail(&self) -> i64 {
        self.global_tail.load(Ordering::Acquire)
    }

    /// Current trim mark; every address below it reads as trimmed.
    pub fn trim_mark(&self) -> u64 {
        self.starting_address.load(Ordering::Acquire)
    }

    fn is_trimmed(&self, address: u64) -> bool {
        address < self.trim_mark()
    }

    fn segment_of(&self, address: u64) -> u64 {
        address / self.config.records_per_segment
    }

    fn mark_dirty(&self, segment: &SegmentRef, kind: ChannelKind) {
        self.dirty_channels
            .lock()
            .insert((segment.segment_id(), kind), segment.share());
    }

    fn sync_tail_segment(&self, address: u64) -> LogResult<()> {
        self.global_tail.fetch_max(address as i64, Ordering::AcqRel);
        let segment = self.segment_of(address);
        let mut last = self.last_segment.lock();
        if *last < segment {
            // Not atomic with the record write that prompted it; boot-time
            // recovery rescans around the persisted watermark to compensate.
            self.context.set_tail_segment(segment)?;
            *last = segment;
        }
        Ok(())
    }

    /// Append one record at `address`.
    ///
    /// Fails with [`LogError::Overwrite`] if the address is below the trim
    /// mark, or already holds a record and `entry` carries no rank. With a
    /// rank, the rank policy decides between replace, idempotent success,
    /// [`LogError::DataOutranked`], and [`LogError::ValueAdopted`].
    pub fn append(&self, address: u64, entry: &LogData) -> LogResult<()> {
        if self.is_trimmed(address) {
            return Err(LogError::Overwrite(address));
        }

        let segment = self.cache.get_for_address(address)?;

        // The existence check and the write must not be separable, or two
        // racing appends to the same address could both pass the check.
        let _write = self.locks.acquire_write(segment.segment_id());

        if segment.contains(address) || segment.is_trimmed(address) {
            let Some(new_rank) = entry.rank else {
                return Err(LogError::Overwrite(address));
            };
            self.assert_append_permitted(address, &segment, entry, new_rank.rank)?;
        }

        let framed = encode_record(&entry.to_wire(address));
        let meta = segment.append_record(&framed)?;
        self.mark_dirty(&segment, ChannelKind::Log);
        self.sync_tail_segment(address)?;
        segment.insert_known(address, meta);
        tracing::trace!(address, "written to disk");
        Ok(())
    }

    /// Rank policy for appends to an already-decided address (callers have
    /// checked that `entry` is ranked).
    fn assert_append_permitted(
        &self,
        address: u64,
        segment: &SegmentRef,
        entry: &LogData,
        new_rank: u64,
    ) -> LogResult<()> {
        let existing = match segment.read_record(address)? {
            Some(wire) => LogData::from_wire(&wire)?,
            // The record was compacted away; nothing left to outrank us.
            None => return Ok(()),
        };
        let Some(old_rank) = existing.rank else {
            // Unranked data adopts the incoming rank.
            return Ok(());
        };

        if new_rank > old_rank.rank {
            Ok(())
        } else if new_rank == old_rank.rank {
            if entry.data == existing.data {
                Ok(())
            } else {
                Err(LogError::ValueAdopted {
                    address,
                    adopted: Box::new(existing),
                })
            }
        } else {
            Err(LogError::DataOutranked { address })
        }
    }

    /// Append a consecutive run of records, spanning at most two segments.
    ///
    /// Entries marked trimmed advance the trim mark instead of being written;
    /// entries below the trim mark are dropped; addresses the target segment
    /// already knows are silently skipped (batch appends are idempotent).
    pub fn append_batch(&self, range: &[(u64, LogData)]) -> LogResult<()> {
        let entries = self.preprocess(range)?;
        if entries.is_empty() {
            tracing::info!("no entries to write");
            return Ok(());
        }
        self.verify_range(&entries)?;

        let (first_address, _) = entries[0];
        let (last_address, _) = *entries.last().expect("non-empty");
        let first = self.cache.get_for_address(first_address)?;
        let last = self.cache.get_for_address(last_address)?;

        let mut first_run = Vec::new();
        let mut last_run = Vec::new();
        for (address, entry) in entries {
            if self.segment_of(address) == first.segment_id() && !first.contains(address) {
                first_run.push((address, entry));
            } else if self.segment_of(address) == last.segment_id() && !last.contains(address) {
                last_run.push((address, entry));
            }
        }

        self.write_run(&first, &first_run)?;
        self.write_run(&last, &last_run)?;
        Ok(())
    }

    fn preprocess<'a>(&self, range: &'a [(u64, LogData)]) -> LogResult<Vec<(u64, &'a LogData)>> {
        let mut processed = Vec::with_capacity(range.len());
        for (address, entry) in range {
            if entry.is_trimmed() {
                // Already tracked by the trim mark; no need to write it.
                self.prefix_trim(*address)?;
            } else if self.is_trimmed(*address) {
                // A prefix trim raced ahead of this batch and covered it.
                continue;
            } else {
                processed.push((*address, entry));
            }
        }
        Ok(processed)
    }

    fn verify_range(&self, entries: &[(u64, &LogData)]) -> LogResult<()> {
        let first = entries[0].0;
        for (i, (address, _)) in entries.iter().enumerate() {
            if *address != first + i as u64 {
                return Err(LogError::InvalidArgument(format!(
                    "batch addresses are not consecutive at {address}"
                )));
            }
        }
        let last = entries[entries.len() - 1].0;
        if self.segment_of(last) - self.segment_of(first) > 1 {
            return Err(LogError::InvalidArgument(
                "write range spans more than two segments".into(),
            ));
        }
        Ok(())
    }

    fn write_run(&self, segment: &SegmentRef, run: &[(u64, &LogData)]) -> LogResult<()> {
        if run.is_empty() {
            return Ok(());
        }
        let records: Vec<_> = run
            .iter()
            .map(|(address, entry)| (*address, encode_record(&entry.to_wire(*address))))
            .collect();
        let last_address = run[run.len() - 1].0;

        let metas = {
            let _write = self.locks.acquire_write(segment.segment_id());
            let metas = segment.append_batch(&records)?;
            self.mark_dirty(segment, ChannelKind::Log);
            self.sync_tail_segment(last_address)?;
            metas
        };
        segment.extend_known(metas);
        Ok(())
    }

    /// Read the record at `address`. Returns the trimmed sentinel for
    /// addresses below the trim mark or carrying a pending tombstone, and
    /// `None` for addresses never written.
    pub fn read(&self, address: u64) -> LogResult<Option<LogData>> {
        if self.is_trimmed(address) {
            return Ok(Some(LogData::trimmed(address)));
        }

        let segment = self.cache.get_for_address(address)?;
        if segment.is_pending_trim(address) {
            return Ok(Some(LogData::trimmed(address)));
        }

        let _read = self.locks.acquire_read(segment.segment_id());
        match segment.read_record(address)? {
            Some(wire) => Ok(Some(LogData::from_wire(&wire)?)),
            None => Ok(None),
        }
    }

    /// Move the trim mark so that every address at or below `address` reads
    /// as trimmed. Idempotent: trimming below the current mark is a no-op.
    pub fn prefix_trim(&self, address: u64) -> LogResult<()> {
        if address < self.trim_mark() {
            tracing::warn!(address, "ignoring repeated prefix trim");
            return Ok(());
        }
        let new_starting_address = address + 1;
        self.context.set_starting_address(new_starting_address)?;
        // fetch_max keeps the mark monotone under racing trims.
        self.starting_address
            .fetch_max(new_starting_address, Ordering::AcqRel);
        self.sync_tail_segment(address)?;
        tracing::debug!(new_starting_address, "trimmed prefix");
        Ok(())
    }

    /// Place a tombstone on one address. The record stays on disk (and reads
    /// as trimmed) until a sparse compaction rewrites its segment. No-op for
    /// unknown or already-tombstoned addresses.
    pub fn trim(&self, address: u64) -> LogResult<()> {
        let segment = self.cache.get_for_address(address)?;
        if !segment.contains(address) || segment.is_pending_trim(address) {
            return Ok(());
        }
        segment.write_pending_trim(address)?;
        self.mark_dirty(&segment, ChannelKind::Pending);
        Ok(())
    }

    /// Reclaim space: with the trim mark still at zero, rewrite full segments
    /// that have accumulated enough tombstones (sparse compaction); once a
    /// prefix trim has happened, drop whole segments below the mark instead.
    pub fn compact(&self) -> LogResult<()> {
        let _serialize = self.compact_lock.lock();
        if self.trim_mark() == 0 {
            self.sparse_compact()
        } else {
            self.prefix_compact()
        }
    }

    fn prefix_compact(&self) -> LogResult<()> {
        // Only whole segments strictly below the mark's segment are dropped.
        let end_segment = (self.trim_mark() / self.config.records_per_segment) as i64 - 1;
        if end_segment <= 0 {
            tracing::debug!("only one segment detected, ignoring trim");
            return Ok(());
        }

        for segment in self.cache.open_segments() {
            if (segment.segment_id() as i64) <= end_segment {
                if segment.ref_count() != 0 {
                    tracing::warn!(
                        segment = segment.segment_id(),
                        ref_count = segment.ref_count(),
                        "segment is trimmed but still referenced, trimming anyway"
                    );
                }
                segment.close();
                self.cache.remove(segment.segment_id());
            }
        }

        let mut deleted_files = 0u64;
        let mut freed_bytes = 0u64;
        for dirent in std::fs::read_dir(&self.log_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let Some(parsed) = name.split('.').next().and_then(|s| s.parse::<u64>().ok()) else {
                tracing::warn!(file = %name, "ignoring file");
                continue;
            };
            if (parsed as i64) < end_segment {
                let size = dirent.metadata().map(|m| m.len()).unwrap_or(0);
                match std::fs::remove_file(dirent.path()) {
                    Ok(()) => {
                        deleted_files += 1;
                        freed_bytes += size;
                    }
                    Err(e) => {
                        tracing::error!(file = %name, error = %e, "couldn't delete file");
                    }
                }
            }
        }

        tracing::info!(
            deleted_files,
            freed_bytes,
            end_segment,
            "prefix compaction completed"
        );
        Ok(())
    }

    fn sparse_compact(&self) -> LogResult<()> {
        let full = self.config.records_per_segment as usize;
        for segment in self.cache.open_segments() {
            if segment.known_count() + segment.trimmed_count() != full {
                tracing::info!(
                    segment = segment.segment_id(),
                    "log segment still not complete, skipping"
                );
                continue;
            }

            let to_trim = segment.compactable_trims();
            if (to_trim.len() as u64) < self.config.trim_threshold {
                tracing::trace!(
                    pending = to_trim.len(),
                    threshold = self.config.trim_threshold,
                    "threshold not exceeded"
                );
                // Ends the whole pass, not just this segment.
                return Ok(());
            }

            tracing::info!(
                segment = segment.segment_id(),
                pending = to_trim.len(),
                "starting compaction"
            );
            if let Err(e) = self.rewrite_segment(&segment, &to_trim) {
                tracing::error!(
                    segment = segment.segment_id(),
                    error = %e,
                    "compact operation failed"
                );
            }
        }
        Ok(())
    }

    /// Rewrite one segment file without its tombstoned records:
    /// write `.copy` with the same header, stream surviving frames into it
    /// byte-for-byte, persist the applied trims to `.trimmed`, verify the
    /// copy end to end, atomically swap it in, and evict the segment so the
    /// next access reindexes.
    fn rewrite_segment(&self, segment: &Arc<Segment>, to_trim: &HashSet<u64>) -> LogResult<()> {
        use std::io::Write;

        let _write = self.locks.acquire_write(segment.segment_id());

        let source = segment.log_path().to_path_buf();
        let copy_path = {
            let mut name = source.file_name().map(|n| n.to_os_string()).unwrap_or_default();
            name.push(".copy");
            source.with_file_name(name)
        };

        {
            let header = read_log_header(&source)?;
            let mut copy = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&copy_path)?;
            copy.write_all(&crate::codec::encode_header(
                header.version(),
                header.verify_checksum(),
            ))?;

            scan_frames(&source, |frame, address| {
                if !to_trim.contains(&address) {
                    copy.write_all(frame)?;
                }
                Ok(())
            })?;
            copy.sync_all()?;
        }

        segment.write_trimmed(to_trim)?;

        // Verify the rewritten file before swapping it in; a stale `.copy`
        // left behind by a failure here is truncated by the next attempt.
        scan_log(&copy_path, self.no_verify, |_, _, _| {})?;
        std::fs::rename(&copy_path, &source)?;

        // Force the reload of the new segment.
        self.cache.remove(segment.segment_id());
        Ok(())
    }

    /// Force every dirty file to stable storage (when `force`), then clear
    /// the dirty set. Without `force` this only clears the set and provides
    /// no durability.
    pub fn sync(&self, force: bool) -> LogResult<()> {
        let channels: Vec<_> = self
            .dirty_channels
            .lock()
            .iter()
            .map(|((_, kind), segment)| (*kind, Arc::clone(segment)))
            .collect();
        if force {
            for (kind, segment) in &channels {
                segment.sync_channel(*kind)?;
            }
        }
        tracing::debug!(channels = channels.len(), "synced channels");
        self.dirty_channels.lock().clear();
        Ok(())
    }

    /// Close every open segment and drop the cache.
    pub fn close(&self) {
        for segment in self.cache.drain() {
            segment.close();
        }
    }
}
