//! Copy-on-write clone management.
//!
//! A sandbox's working tree lives at `<clone_root>/boxen/<id>/app` and is
//! produced by a [`ClonePrimitive`]. The production primitive asks the host
//! filesystem for a reflink (Linux) or `clonefile` (macOS) duplicate, which
//! is constant-time in the size of the source tree. There is deliberately no
//! fallback to a byte copy.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::SandboxId;

/// Name of the per-sandbox directory holding the working tree.
pub const APP_DIR: &str = "app";

/// Durable description of a sandbox clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRecord {
    /// Sandbox that owns the clone.
    pub sandbox_id: SandboxId,
    /// Absolute path of the directory that was cloned.
    pub host_source_path: PathBuf,
    /// Absolute path of the clone, `<clone_root>/boxen/<id>/app`.
    pub clone_root_path: PathBuf,
    /// When the clone was made.
    pub created_at: DateTime<Utc>,
}

/// Directory that holds everything belonging to one sandbox.
pub fn sandbox_dir(clone_root: &Path, id: &SandboxId) -> PathBuf {
    clone_root.join("boxen").join(id.as_str())
}

/// Path of a sandbox's working tree.
pub fn clone_path(clone_root: &Path, id: &SandboxId) -> PathBuf {
    sandbox_dir(clone_root, id).join(APP_DIR)
}

/// Filesystem operation that duplicates a directory tree.
pub trait ClonePrimitive: Send + Sync {
    /// Duplicates `source` to `dest`. `dest` does not exist yet; its parent does.
    fn clone_tree(&self, source: &Path, dest: &Path) -> std::result::Result<(), String>;

    /// Short name for logging.
    fn name(&self) -> &str;
}

/// Copy-on-write duplication through `cp`.
///
/// Uses `cp -c -R` on macOS (APFS `clonefile`) and
/// `cp -a --reflink=always` elsewhere (btrfs, XFS, bcachefs). Both fail
/// outright on filesystems without copy-on-write support.
#[derive(Debug, Clone, Default)]
pub struct ReflinkClone;

impl ReflinkClone {
    fn args(source: &Path, dest: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = if cfg!(target_os = "macos") {
            vec!["-c".into(), "-R".into()]
        } else {
            vec!["-a".into(), "--reflink=always".into()]
        };
        args.push(source.as_os_str().to_owned());
        args.push(dest.as_os_str().to_owned());
        args
    }
}

impl ClonePrimitive for ReflinkClone {
    fn clone_tree(&self, source: &Path, dest: &Path) -> std::result::Result<(), String> {
        let output = Command::new("cp")
            .args(Self::args(source, dest))
            .output()
            .map_err(|e| format!("failed to run cp: {}", e))?;

        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "reflink"
    }
}

/// Creates and destroys sandbox clones under a clone root.
#[derive(Clone)]
pub struct CloneManager {
    primitive: Arc<dyn ClonePrimitive>,
}

impl Default for CloneManager {
    fn default() -> Self {
        Self::new(Arc::new(ReflinkClone))
    }
}

impl CloneManager {
    /// Creates a manager that clones with `primitive`.
    pub fn new(primitive: Arc<dyn ClonePrimitive>) -> Self {
        Self { primitive }
    }

    /// Clones `source` into `<clone_root>/boxen/<id>/app`.
    pub fn create_clone(
        &self,
        source: &Path,
        clone_root: &Path,
        id: &SandboxId,
    ) -> Result<CloneRecord> {
        let source = std::fs::canonicalize(source)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| Error::SourceNotFound(source.to_path_buf()))?;

        let dest = clone_path(clone_root, id);
        if dest.exists() {
            if !is_empty_dir(&dest)? {
                return Err(Error::CloneExists(dest));
            }
            // cp needs a missing destination to copy the tree as `app`.
            std::fs::remove_dir(&dest)?;
        }
        std::fs::create_dir_all(sandbox_dir(clone_root, id))?;

        tracing::debug!(
            source = ?source,
            dest = ?dest,
            primitive = self.primitive.name(),
            "cloning source tree"
        );

        if let Err(reason) = self.primitive.clone_tree(&source, &dest) {
            remove_tree(&dest)?;
            return Err(Error::ClonePrimitiveFailed {
                source_path: source,
                reason,
            });
        }

        let record = CloneRecord {
            sandbox_id: id.clone(),
            host_source_path: source,
            clone_root_path: dest,
            created_at: Utc::now(),
        };

        tracing::info!(
            sandbox_id = %id,
            path = ?record.clone_root_path,
            "created sandbox clone"
        );

        Ok(record)
    }

    /// Removes a clone tree. Missing paths are not an error.
    pub fn destroy_clone(&self, record: &CloneRecord) -> Result<()> {
        remove_tree(&record.clone_root_path)?;
        tracing::info!(
            sandbox_id = %record.sandbox_id,
            path = ?record.clone_root_path,
            "destroyed sandbox clone"
        );
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(std::fs::read_dir(path)?.next().is_none())
}

/// Recursively removes `path`, tolerating its absence.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
        Ok(_) => Ok(std::fs::remove_file(path)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
