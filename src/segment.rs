//! One open segment: the `.log` file plus its `.trimmed` / `.pending`
//! sidecars, the in-memory address index, and a reference count.
//!
//! A segment covers `records_per_segment` consecutive global addresses. The
//! `.log` file is append-only; its write position is tracked by an in-memory
//! cursor rather than by querying the append handle (append-mode position
//! semantics vary by platform). Reads open a fresh read-only handle and map
//! it for the duration of the read.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Buf;
use memmap2::Mmap;
use parking_lot::RwLock;
use prost::Message;

use crate::codec::{decode_entry, payload_offset_in_frame, FramedRecord};
use crate::error::{LogError, LogResult};
use crate::format::{checksum_bytes, LogEntry, TrimEntry, VERSION};
use crate::scan::scan_log;

/// Where a record's payload lives and how to verify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMeta {
    /// CRC-32C of the payload bytes.
    pub checksum: i32,
    /// Payload length in bytes.
    pub length: i32,
    /// Absolute byte offset of the payload within the `.log` file.
    pub offset: u64,
}

/// Which of a segment's files carries unsynced writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The primary `.log` file.
    Log,
    /// The `.pending` tombstone sidecar.
    Pending,
}

/// Path of the primary log file for `segment_id` under `dir`.
pub fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id}.log"))
}

/// Path of the confirmed-trims sidecar for a segment file.
pub fn trimmed_path(segment_path: &Path) -> PathBuf {
    sidecar(segment_path, "trimmed")
}

/// Path of the pending-trims sidecar for a segment file.
pub fn pending_path(segment_path: &Path) -> PathBuf {
    sidecar(segment_path, "pending")
}

fn sidecar(segment_path: &Path, suffix: &str) -> PathBuf {
    let mut name = segment_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    segment_path.with_file_name(name)
}

fn open_append(path: &Path) -> LogResult<File> {
    Ok(OpenOptions::new().append(true).create(true).open(path)?)
}

/// An open segment. Obtained from the segment cache as a retained handle;
/// every retain must be balanced by exactly one release.
pub struct Segment {
    segment_id: u64,
    log_path: PathBuf,
    log_file: File,
    trimmed_file: File,
    pending_file: File,
    /// Bytes written to `.log` so far (header included).
    write_cursor: AtomicU64,
    known_addresses: RwLock<HashMap<u64, AddressMeta>>,
    trimmed_addresses: RwLock<HashSet<u64>>,
    pending_trims: RwLock<HashSet<u64>>,
    ref_count: AtomicU32,
    no_verify: bool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("segment_id", &self.segment_id)
            .field("log_path", &self.log_path)
            .field("no_verify", &self.no_verify)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Open (or create) the segment's three files, writing and syncing the
    /// file header if `.log` is empty, then scan the log to rebuild the
    /// address index and stream both sidecars into their sets.
    pub fn open(dir: &Path, segment_id: u64, no_verify: bool) -> LogResult<Self> {
        let log_path = segment_path(dir, segment_id);
        let log_file = open_append(&log_path)?;
        let trimmed_file = open_append(&trimmed_path(&log_path))?;
        let pending_file = open_append(&pending_path(&log_path))?;

        if log_file.metadata()?.len() == 0 {
            let header = crate::codec::encode_header(VERSION, !no_verify);
            (&log_file).write_all(&header)?;
            log_file.sync_all()?;
            tracing::trace!(segment = segment_id, "opened new segment file, wrote header");
        }

        let segment = Self {
            segment_id,
            write_cursor: AtomicU64::new(log_file.metadata()?.len()),
            log_path,
            log_file,
            trimmed_file,
            pending_file,
            known_addresses: RwLock::new(HashMap::new()),
            trimmed_addresses: RwLock::new(HashSet::new()),
            pending_trims: RwLock::new(HashSet::new()),
            ref_count: AtomicU32::new(0),
            no_verify,
        };

        {
            let mut known = segment.known_addresses.write();
            scan_log(&segment.log_path, no_verify, |offset, md, entry| {
                known.insert(
                    entry.global_address.unwrap_or(0),
                    AddressMeta {
                        checksum: md.checksum(),
                        length: md.length(),
                        offset,
                    },
                );
            })?;
        }

        // Snapshot sidecar sizes from the open append handles, then read at
        // most that many bytes; concurrent tombstones land in a later load.
        let trimmed_len = segment.trimmed_file.metadata()?.len() as usize;
        let pending_len = segment.pending_file.metadata()?.len() as usize;
        *segment.trimmed_addresses.write() =
            load_trim_entries(&trimmed_path(&segment.log_path), trimmed_len)?;
        *segment.pending_trims.write() =
            load_trim_entries(&pending_path(&segment.log_path), pending_len)?;

        tracing::trace!(segment = segment_id, "opened segment");
        Ok(segment)
    }

    /// Segment id (global address / records-per-segment).
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Path of the primary `.log` file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Append one framed record. Callers must hold the segment's write lock.
    pub fn append_record(&self, framed: &FramedRecord) -> LogResult<AddressMeta> {
        let base = self.write_cursor.load(Ordering::Acquire);
        (&self.log_file).write_all(&framed.bytes)?;
        self.write_cursor
            .store(base + framed.bytes.len() as u64, Ordering::Release);
        Ok(AddressMeta {
            checksum: framed.checksum,
            length: framed.length,
            offset: base + payload_offset_in_frame(),
        })
    }

    /// Append a contiguous run of framed records as one buffered write,
    /// returning per-address metadata. Callers must hold the segment's write
    /// lock.
    pub fn append_batch(
        &self,
        records: &[(u64, FramedRecord)],
    ) -> LogResult<HashMap<u64, AddressMeta>> {
        let base = self.write_cursor.load(Ordering::Acquire);
        let total: usize = records.iter().map(|(_, f)| f.bytes.len()).sum();

        let mut buffer = Vec::with_capacity(total);
        let mut metas = HashMap::with_capacity(records.len());
        for (address, framed) in records {
            metas.insert(
                *address,
                AddressMeta {
                    checksum: framed.checksum,
                    length: framed.length,
                    offset: base + buffer.len() as u64 + payload_offset_in_frame(),
                },
            );
            buffer.extend_from_slice(&framed.bytes);
        }

        (&self.log_file).write_all(&buffer)?;
        self.write_cursor
            .store(base + buffer.len() as u64, Ordering::Release);
        Ok(metas)
    }

    /// Read the record at `address`, or `None` if the address is unknown to
    /// this segment. Verifies the stored checksum unless the engine runs in
    /// no-verify mode.
    pub fn read_record(&self, address: u64) -> LogResult<Option<LogEntry>> {
        let Some(meta) = self.known_addresses.read().get(&address).copied() else {
            return Ok(None);
        };

        let file = File::open(&self.log_path)?;
        let map = unsafe { Mmap::map(&file)? };

        let start = meta.offset as usize;
        let end = start + meta.length as usize;
        if end > map.len() {
            return Err(LogError::DataCorruption(format!(
                "record at address {address} extends past end of {}",
                self.log_path.display()
            )));
        }
        let payload = &map[start..end];

        if !self.no_verify {
            let actual = checksum_bytes(payload);
            if actual != meta.checksum {
                tracing::error!(address, "checksum mismatch while reading record");
                return Err(LogError::ChecksumMismatch {
                    expected: meta.checksum,
                    actual,
                });
            }
        }

        Ok(Some(decode_entry(payload)?))
    }

    /// Append a tombstone for `address` to the `.pending` sidecar and record
    /// it in memory.
    pub fn write_pending_trim(&self, address: u64) -> LogResult<()> {
        let bytes = TrimEntry::new(address).encode_length_delimited_to_vec();
        (&self.pending_file).write_all(&bytes)?;
        self.pending_trims.write().insert(address);
        Ok(())
    }

    /// Whether `address` has a record in this segment.
    pub fn contains(&self, address: u64) -> bool {
        self.known_addresses.read().contains_key(&address)
    }

    /// Metadata for `address`, when present.
    pub fn address_meta(&self, address: u64) -> Option<AddressMeta> {
        self.known_addresses.read().get(&address).copied()
    }

    /// Publish metadata for a freshly written record.
    pub fn insert_known(&self, address: u64, meta: AddressMeta) {
        self.known_addresses.write().insert(address, meta);
    }

    /// Publish metadata for a freshly written batch.
    pub fn extend_known(&self, metas: HashMap<u64, AddressMeta>) {
        self.known_addresses.write().extend(metas);
    }

    /// Number of records this segment knows.
    pub fn known_count(&self) -> usize {
        self.known_addresses.read().len()
    }

    /// Highest address this segment knows, if any.
    pub fn max_known_address(&self) -> Option<u64> {
        self.known_addresses.read().keys().max().copied()
    }

    /// Whether `address` was physically removed by a past compaction.
    pub fn is_trimmed(&self, address: u64) -> bool {
        self.trimmed_addresses.read().contains(&address)
    }

    /// Number of compacted-away addresses.
    pub fn trimmed_count(&self) -> usize {
        self.trimmed_addresses.read().len()
    }

    /// Whether `address` carries a pending tombstone.
    pub fn is_pending_trim(&self, address: u64) -> bool {
        self.pending_trims.read().contains(&address)
    }

    /// Record compacted-away addresses in the `.trimmed` sidecar and force it
    /// to stable storage. In-memory sets are not updated; compaction evicts
    /// the segment and the next open reloads the sidecar.
    pub fn write_trimmed(&self, addresses: &HashSet<u64>) -> LogResult<()> {
        let mut buffer = Vec::new();
        for address in addresses {
            buffer.extend_from_slice(&TrimEntry::new(*address).encode_length_delimited_to_vec());
        }
        (&self.trimmed_file).write_all(&buffer)?;
        self.trimmed_file.sync_all()?;
        Ok(())
    }

    /// Tombstones not yet applied by compaction: pending minus trimmed.
    pub fn compactable_trims(&self) -> HashSet<u64> {
        let trimmed = self.trimmed_addresses.read();
        self.pending_trims
            .read()
            .iter()
            .filter(|a| !trimmed.contains(a))
            .copied()
            .collect()
    }

    /// Increment the reference count.
    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the reference count; decrementing past zero is an error.
    pub fn release(&self) -> LogResult<()> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| {
                LogError::InvalidState(format!(
                    "ref count underflow on segment {}",
                    self.segment_id
                ))
            })?;
        Ok(())
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Force one of the segment's files to stable storage.
    pub fn sync_channel(&self, kind: ChannelKind) -> LogResult<()> {
        match kind {
            ChannelKind::Log => self.log_file.sync_all()?,
            ChannelKind::Pending => self.pending_file.sync_all()?,
        }
        Ok(())
    }

    /// Force and logically close all three files and drop the indices. The
    /// descriptors themselves close when the last handle to this segment is
    /// dropped, so in-flight readers keep working against the old file.
    pub fn close(&self) {
        for (name, file) in [
            ("log", &self.log_file),
            ("trimmed", &self.trimmed_file),
            ("pending", &self.pending_file),
        ] {
            if let Err(e) = file.sync_all() {
                tracing::warn!(
                    segment = self.segment_id,
                    channel = name,
                    error = %e,
                    "error syncing channel on close"
                );
            }
        }
        self.known_addresses.write().clear();
        self.trimmed_addresses.write().clear();
        self.pending_trims.write().clear();
    }
}

fn load_trim_entries(path: &Path, snapshot_len: usize) -> LogResult<HashSet<u64>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    let mut buf = &bytes[..snapshot_len.min(bytes.len())];

    let mut out = HashSet::new();
    while buf.has_remaining() {
        let entry = TrimEntry::decode_length_delimited(&mut buf)
            .map_err(|e| LogError::DataCorruption(format!("trim sidecar {}: {e}", path.display())))?;
        out.insert(entry.address());
    }
    Ok(out)
}
