//! The server context: the engine's window onto externally owned state.
//!
//! The surrounding server decides where the log lives and durably remembers
//! two watermarks for it: `starting_address` (the trim mark) and
//! `tail_segment` (the highest segment a write has reached). The engine only
//! ever talks to the [`ServerContext`] trait; [`FileBackedContext`] is the
//! concrete implementation used by tests and embeddings, persisting both
//! watermarks in one postcard-encoded datastore file with a
//! write-temp / fsync / rename / fsync-parent sequence.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LogError, LogResult};

/// External state and configuration the engine depends on.
pub trait ServerContext: Send + Sync {
    /// Root directory under which the engine creates its `log/` directory.
    fn log_path(&self) -> &Path;

    /// Current trim mark (exclusive lower bound of readable addresses).
    fn starting_address(&self) -> u64;

    /// Persist a new trim mark.
    fn set_starting_address(&self, address: u64) -> LogResult<()>;

    /// Highest segment id known to have been written.
    fn tail_segment(&self) -> u64;

    /// Persist a new tail segment.
    fn set_tail_segment(&self, segment: u64) -> LogResult<()>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct DataStore {
    starting_address: u64,
    tail_segment: u64,
}

/// File-backed [`ServerContext`].
pub struct FileBackedContext {
    root: PathBuf,
    store_path: PathBuf,
    state: Mutex<DataStore>,
}

impl FileBackedContext {
    const STORE_FILE: &'static str = "datastore.bin";

    /// Open (or initialize) a context rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> LogResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let store_path = root.join(Self::STORE_FILE);

        let state = match std::fs::read(&store_path) {
            Ok(bytes) => postcard::from_bytes(&bytes)
                .map_err(|e| LogError::Decode(format!("context datastore: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DataStore::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            root,
            store_path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: DataStore) -> LogResult<()> {
        let bytes = postcard::to_allocvec(&state)
            .map_err(|e| LogError::Encode(format!("context datastore: {e}")))?;

        let tmp = self.store_path.with_extension("bin.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.store_path)?;
        // Make the rename itself durable.
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

impl ServerContext for FileBackedContext {
    fn log_path(&self) -> &Path {
        &self.root
    }

    fn starting_address(&self) -> u64 {
        self.state.lock().starting_address
    }

    fn set_starting_address(&self, address: u64) -> LogResult<()> {
        let mut state = self.state.lock();
        state.starting_address = address;
        self.persist(*state)
    }

    fn tail_segment(&self) -> u64 {
        self.state.lock().tail_segment
    }

    fn set_tail_segment(&self, segment: u64) -> LogResult<()> {
        let mut state = self.state.lock();
        state.tail_segment = segment;
        self.persist(*state)
    }
}
