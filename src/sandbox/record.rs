//! The sandbox aggregate and its on-disk metadata.
//!
//! Metadata lives next to the clone at `<clone_root>/boxen/<id>/sandbox.json`
//! so the directory listing under `boxen/` stays the only index of sandboxes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::container::ContainerHandle;
use crate::error::Result;
use crate::git::RemotePair;

use super::{CloneRecord, SandboxId, SandboxState};

/// Metadata file name inside a sandbox directory.
pub const METADATA_FILE: &str = "sandbox.json";

/// A sandbox: its clone, remotes, container and lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub clone_record: CloneRecord,
    /// `None` when the host directory is not a git repository.
    pub remotes: Option<RemotePair>,
    pub container: Option<ContainerHandle>,
    /// Image the container was created from.
    pub image: Option<String>,
    /// Last known state. Re-derived from the runtime on attach.
    pub state: SandboxState,
}

impl Sandbox {
    /// Working tree of the sandbox.
    pub fn clone_path(&self) -> &Path {
        &self.clone_record.clone_root_path
    }

    /// Directory the sandbox was cloned from.
    pub fn host_path(&self) -> &Path {
        &self.clone_record.host_source_path
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SandboxState) -> Result<()> {
        self.state = self.state.transition(next)?;
        tracing::debug!(sandbox_id = %self.id, state = %self.state, "sandbox state changed");
        Ok(())
    }
}

/// Path of the metadata file for a sandbox directory.
pub fn metadata_path(sandbox_dir: &Path) -> PathBuf {
    sandbox_dir.join(METADATA_FILE)
}

/// Writes metadata atomically (temp file + rename).
pub fn save(sandbox_dir: &Path, sandbox: &Sandbox) -> Result<()> {
    let path = metadata_path(sandbox_dir);
    let tmp = sandbox_dir.join(format!(".{}.tmp", METADATA_FILE));
    let json = serde_json::to_string_pretty(sandbox)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Reads metadata, `None` if the file does not exist.
pub fn load(sandbox_dir: &Path) -> Result<Option<Sandbox>> {
    let path = metadata_path(sandbox_dir);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample(dir: &Path) -> Sandbox {
        let id = SandboxId::new("demo").unwrap();
        Sandbox {
            id: id.clone(),
            clone_record: CloneRecord {
                sandbox_id: id,
                host_source_path: PathBuf::from("/work/proj"),
                clone_root_path: dir.join("app"),
                created_at: Utc::now(),
            },
            remotes: None,
            container: Some(ContainerHandle::new("c0ffee")),
            image: Some("alpine:3".to_string()),
            state: SandboxState::Stopped,
        }
    }

    #[test]
    fn metadata_survives_a_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let sandbox = sample(dir.path());

        save(dir.path(), &sandbox).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();

        assert_eq!(loaded, sandbox);
        assert!(!dir.path().join(".sandbox.json.tmp").exists());
    }

    #[test]
    fn missing_metadata_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(metadata_path(dir.path()), "{not json").unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(crate::error::Error::Metadata(_))
        ));
    }

    #[test]
    fn transition_is_checked() {
        let dir = TempDir::new().unwrap();
        let mut sandbox = sample(dir.path());
        sandbox.transition(SandboxState::Running).unwrap();
        assert!(sandbox.transition(SandboxState::Removed).is_err());
        assert_eq!(sandbox.state, SandboxState::Running);
    }
}
