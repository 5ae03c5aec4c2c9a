//! Per-sandbox lock around the ephemeral-commit protocol.
//!
//! An advisory `flock(2)` on `<clone_root>/boxen/<id>/compare.lock` via
//! `fs2`. It serializes diffs across threads and processes alike, and the
//! OS drops it if the holder dies.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::{Error, Result};

/// Lock file name inside a sandbox directory.
pub const COMPARE_LOCK_FILE: &str = "compare.lock";

/// An exclusive compare lock, held until dropped.
#[derive(Debug)]
pub struct CompareLock {
    _file: File,
}

impl CompareLock {
    /// Blocks until the lock in `sandbox_dir` is held.
    pub fn acquire(sandbox_dir: &Path) -> Result<Self> {
        let path = sandbox_dir.join(COMPARE_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.lock_exclusive()
            .map_err(|e| Error::Git(format!("failed to lock {}: {}", path.display(), e)))?;
        tracing::debug!(path = ?path, "acquired compare lock");

        Ok(Self { _file: file })
    }
}
