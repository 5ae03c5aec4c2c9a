//! Bidirectional remotes between a host directory and its sandbox clone.
//!
//! The remote URLs are plain filesystem paths. They resolve from the host
//! only; inside the container's mount namespace neither path exists.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::SandboxId;

use super::command::{git, is_repository};

/// Remote configured inside the clone, pointing at the host directory.
pub const CLONE_REMOTE: &str = "origin-host-workdir";

/// Prefix of the remote configured in the host, pointing at the clone.
pub const HOST_REMOTE_PREFIX: &str = "sandbox-clone-";

/// Name of the host-side remote for a sandbox.
pub fn host_remote_name(id: &SandboxId) -> String {
    format!("{}{}", HOST_REMOTE_PREFIX, id)
}

/// Which way a remote points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteDirection {
    /// Configured in the host, fetches from the clone.
    HostToClone,
    /// Configured in the clone, fetches from the host.
    CloneToHost,
}

/// One configured remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLink {
    pub direction: RemoteDirection,
    pub remote_name: String,
    pub remote_url: PathBuf,
}

/// The two remotes wired for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePair {
    /// `origin-host-workdir` inside the clone.
    pub clone_side: RemoteLink,
    /// `sandbox-clone-<id>` inside the host directory.
    pub host_side: RemoteLink,
}

/// Returns the URL of `name` in `repo`, `None` if absent or unreadable.
pub fn remote_url(repo: &Path, name: &str) -> Option<String> {
    if !repo.is_dir() {
        return None;
    }
    match git(repo, ["remote", "get-url", name]) {
        Ok(out) if out.success => Some(out.stdout.trim().to_string()),
        _ => None,
    }
}

fn add_remote(repo: &Path, name: &str, url: &Path) -> Result<()> {
    let out = git(
        repo,
        [
            std::ffi::OsStr::new("remote"),
            std::ffi::OsStr::new("add"),
            std::ffi::OsStr::new(name),
            url.as_os_str(),
        ],
    )?;
    if !out.success {
        return Err(Error::RemoteWiring(format!(
            "git remote add {} in {}: {}",
            name,
            repo.display(),
            out.stderr.trim()
        )));
    }
    Ok(())
}

/// Removes `name` from `repo`. Returns whether a remote was removed.
fn remove_remote(repo: &Path, name: &str) -> Result<bool> {
    if remote_url(repo, name).is_none() {
        return Ok(false);
    }
    git(repo, ["remote", "remove", name])?.into_stdout("git remote remove")?;
    Ok(true)
}

/// Wires the remote pair between `host` and `clone`.
///
/// Returns `None` without touching anything when `host` is not a repository.
/// Either both remotes are added or neither is.
pub fn wire_remotes(host: &Path, clone: &Path, id: &SandboxId) -> Result<Option<RemotePair>> {
    if !is_repository(host) {
        tracing::info!(host = ?host, "host is not a git repository, skipping remote wiring");
        return Ok(None);
    }
    if !is_repository(clone) {
        return Err(Error::NotARepository(clone.to_path_buf()));
    }

    let host_remote = host_remote_name(id);

    add_remote(clone, CLONE_REMOTE, host)?;

    if let Err(e) = add_remote(host, &host_remote, clone) {
        tracing::warn!(
            sandbox_id = %id,
            error = %e,
            "host-side remote failed, rolling back clone-side remote"
        );
        if let Err(rollback) = remove_remote(clone, CLONE_REMOTE) {
            tracing::error!(error = %rollback, clone = ?clone, "failed to roll back clone-side remote");
        }
        return Err(e);
    }

    tracing::info!(
        sandbox_id = %id,
        clone_remote = CLONE_REMOTE,
        host_remote = %host_remote,
        "wired sandbox remotes"
    );

    Ok(Some(RemotePair {
        clone_side: RemoteLink {
            direction: RemoteDirection::CloneToHost,
            remote_name: CLONE_REMOTE.to_string(),
            remote_url: host.to_path_buf(),
        },
        host_side: RemoteLink {
            direction: RemoteDirection::HostToClone,
            remote_name: host_remote,
            remote_url: clone.to_path_buf(),
        },
    }))
}

/// Removes both remotes. Sides that are already gone, including a deleted
/// host directory, are skipped.
pub fn unwire_remotes(host: &Path, clone: &Path, id: &SandboxId) -> Result<()> {
    let host_remote = host_remote_name(id);

    if remove_remote(host, &host_remote)? {
        tracing::info!(sandbox_id = %id, host = ?host, "removed host-side remote");
    } else {
        tracing::debug!(sandbox_id = %id, host = ?host, "host-side remote already absent");
    }

    if remove_remote(clone, CLONE_REMOTE)? {
        tracing::info!(sandbox_id = %id, clone = ?clone, "removed clone-side remote");
    }

    Ok(())
}

/// Reports which sides of the pair currently exist: `(clone_side, host_side)`.
pub fn remotes_present(host: &Path, clone: &Path, id: &SandboxId) -> (bool, bool) {
    (
        remote_url(clone, CLONE_REMOTE).is_some(),
        remote_url(host, &host_remote_name(id)).is_some(),
    )
}

/// Reconstructs the pair from git config, if both sides are present.
pub fn read_remotes(host: &Path, clone: &Path, id: &SandboxId) -> Option<RemotePair> {
    let host_remote = host_remote_name(id);
    let clone_url = remote_url(clone, CLONE_REMOTE)?;
    let host_url = remote_url(host, &host_remote)?;
    Some(RemotePair {
        clone_side: RemoteLink {
            direction: RemoteDirection::CloneToHost,
            remote_name: CLONE_REMOTE.to_string(),
            remote_url: PathBuf::from(clone_url),
        },
        host_side: RemoteLink {
            direction: RemoteDirection::HostToClone,
            remote_name: host_remote,
            remote_url: PathBuf::from(host_url),
        },
    })
}
