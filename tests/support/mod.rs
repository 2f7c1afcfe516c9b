//! Shared harness for engine scenario tests.
//!
//! Important: this file lives under `tests/support/` so it is **not** compiled
//! as a standalone integration test target.

use std::path::Path;
use std::sync::Arc;

use streamlog::{FileBackedContext, LogConfig, StreamLog};

/// Open an engine rooted at `root` with a small segment geometry.
pub fn open_log(root: &Path, records_per_segment: u64, trim_threshold: u64) -> StreamLog {
    let ctx = Arc::new(FileBackedContext::open(root).unwrap());
    StreamLog::open(
        ctx,
        LogConfig {
            records_per_segment,
            trim_threshold,
        },
        false,
    )
    .unwrap()
}

/// Path of the `log/` directory the engine writes under `root`.
pub fn log_dir(root: &Path) -> std::path::PathBuf {
    root.join("log")
}

/// Path of one segment file under `root`.
pub fn segment_file(root: &Path, segment_id: u64) -> std::path::PathBuf {
    log_dir(root).join(format!("{segment_id}.log"))
}
