//! Comparing a sandbox clone against its host directory.
//!
//! Git can only fetch commits, so showing uncommitted work needs an
//! ephemeral commit in the clone: stage everything, commit on top of HEAD,
//! fetch that commit into the host, diff, then reset the clone back to the
//! recorded HEAD with `--mixed` so the work tree is untouched. The reset runs
//! on every exit path; if it fails the error is fatal, because a clone left
//! with an extra commit silently skews every later comparison.

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sandbox::{sandbox_dir, Registry, SandboxId};

use super::command::{git, resolve_commit};
use super::lock::CompareLock;
use super::remote::{host_remote_name, remote_url};

const EPHEMERAL_MESSAGE: &str = "sandcastle: ephemeral snapshot of uncommitted changes";

/// Returns the raw `git status` report of a clone.
pub fn status_at(clone: &Path) -> Result<String> {
    git(clone, ["status"])?.into_stdout("git status")
}

/// Returns the raw `git log` report of a clone.
pub fn log_at(clone: &Path) -> Result<String> {
    git(clone, ["log", "--no-color"])?.into_stdout("git log")
}

fn ensure_remote(host: &Path, remote: &str) -> Result<()> {
    if remote_url(host, remote).is_none() {
        return Err(Error::RemoteNotWired {
            remote: remote.to_string(),
            host_path: host.to_path_buf(),
        });
    }
    Ok(())
}

fn fetch(host: &Path, remote: &str, refspec: Option<&str>) -> Result<()> {
    let mut args = vec!["fetch", "--quiet", "--no-tags", remote];
    args.extend(refspec);
    let out = git(host, &args)?;
    if !out.success {
        return Err(Error::FetchFailed {
            remote: remote.to_string(),
            reason: out.stderr.trim().to_string(),
        });
    }
    Ok(())
}

fn diff(host: &Path, [from, to]: [&str; 2]) -> Result<String> {
    git(host, ["diff", "--no-color", from, to])?.into_stdout("git diff")
}

/// Picks the remote-tracking ref to compare against.
///
/// An explicit branch must exist. Otherwise the branch named after the
/// sandbox is preferred, then `default_branch`.
fn resolve_base(
    host: &Path,
    remote: &str,
    id: &SandboxId,
    requested: Option<&str>,
    default_branch: &str,
) -> Result<String> {
    let candidates: Vec<&str> = match requested {
        Some(branch) => vec![branch],
        None => vec![id.as_str(), default_branch],
    };

    for branch in &candidates {
        let tracking = format!("refs/remotes/{}/{}", remote, branch);
        if resolve_commit(host, &tracking)?.is_some() {
            return Ok(tracking);
        }
    }

    Err(Error::NoSuchBranch(
        candidates.first().copied().unwrap_or(default_branch).to_string(),
    ))
}

/// Diffs host HEAD against the committed state of a sandbox branch.
pub fn diff_committed(
    host: &Path,
    id: &SandboxId,
    branch: Option<&str>,
    default_branch: &str,
) -> Result<String> {
    let remote = host_remote_name(id);
    ensure_remote(host, &remote)?;
    fetch(host, &remote, None)?;
    let base = resolve_base(host, &remote, id, branch, default_branch)?;
    tracing::debug!(sandbox_id = %id, base = %base, "diffing committed sandbox state");
    diff(host, ["HEAD", base.as_str()])
}

/// Diffs a base branch of the sandbox against the clone's work tree,
/// including uncommitted and untracked changes.
///
/// The base resolves like [`diff_committed`]. Callers must serialize calls
/// per clone, see [`CompareLock`].
pub fn diff_uncommitted(
    host: &Path,
    clone: &Path,
    id: &SandboxId,
    branch: Option<&str>,
    default_branch: &str,
) -> Result<String> {
    let remote = host_remote_name(id);
    ensure_remote(host, &remote)?;

    // Tracking refs must be read before the ephemeral commit lands on the
    // sandbox branch.
    fetch(host, &remote, None)?;
    let tracking = resolve_base(host, &remote, id, branch, default_branch)?;
    let base = resolve_commit(host, &tracking)?
        .ok_or_else(|| Error::NoSuchBranch(tracking.clone()))?;
    tracing::debug!(sandbox_id = %id, base = %tracking, "diffing uncommitted sandbox state");

    with_ephemeral_commit(clone, |commit| {
        fetch(host, &remote, Some("HEAD"))?;
        diff(host, [base.as_str(), commit])
    })
}

/// Runs `compare` against an ephemeral commit of the clone's work tree and
/// resets the clone afterwards. A failed reset wins over any result.
fn with_ephemeral_commit<T>(clone: &Path, compare: impl FnOnce(&str) -> Result<T>) -> Result<T> {
    let snapshot = EphemeralCommit::create(clone)?;
    let result = compare(snapshot.commit());
    let reset = snapshot.unwind();

    match (result, reset) {
        (_, Err(fatal)) => Err(fatal),
        (result, Ok(())) => result,
    }
}

fn reset_to(clone: &Path, head: &str) -> Result<()> {
    let out = git(clone, ["reset", "--quiet", "--mixed", head])?;
    if !out.success {
        return Err(Error::EphemeralResetFailed {
            clone_path: clone.to_path_buf(),
            head: head.to_string(),
            reason: out.stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// A temporary commit on top of a clone's HEAD.
///
/// [`EphemeralCommit::unwind`] resets the clone; if the value is dropped
/// without unwinding (a panic between create and unwind) the reset still
/// runs and failures are logged.
struct EphemeralCommit<'a> {
    clone: &'a Path,
    head: String,
    commit: String,
    unwound: bool,
}

impl<'a> EphemeralCommit<'a> {
    fn create(clone: &'a Path) -> Result<Self> {
        let head = resolve_commit(clone, "HEAD")?.ok_or(Error::EphemeralCommitFailed {
            stage: "record HEAD",
            reason: "clone has no commits".to_string(),
        })?;

        let staged = git(clone, ["add", "--all"])?;
        if !staged.success {
            reset_to(clone, &head)?;
            return Err(Error::EphemeralCommitFailed {
                stage: "stage",
                reason: staged.stderr.trim().to_string(),
            });
        }

        let committed = git(
            clone,
            [
                "-c",
                "user.name=sandcastle",
                "-c",
                "user.email=sandcastle@localhost",
                "-c",
                "commit.gpgsign=false",
                "-c",
                "core.hooksPath=/dev/null",
                "commit",
                "--quiet",
                "--no-verify",
                "--allow-empty",
                "-m",
                EPHEMERAL_MESSAGE,
            ],
        )?;
        if !committed.success {
            reset_to(clone, &head)?;
            return Err(Error::EphemeralCommitFailed {
                stage: "commit",
                reason: committed.stderr.trim().to_string(),
            });
        }

        let commit = match resolve_commit(clone, "HEAD") {
            Ok(Some(commit)) if commit != head => commit,
            _ => {
                reset_to(clone, &head)?;
                return Err(Error::EphemeralCommitFailed {
                    stage: "commit",
                    reason: "HEAD did not advance".to_string(),
                });
            }
        };

        tracing::debug!(clone = ?clone, head = %head, commit = %commit, "created ephemeral commit");

        Ok(Self {
            clone,
            head,
            commit,
            unwound: false,
        })
    }

    fn commit(&self) -> &str {
        &self.commit
    }

    fn unwind(mut self) -> Result<()> {
        self.unwound = true;
        let result = reset_to(self.clone, &self.head);
        if let Err(e) = &result {
            tracing::error!(error = %e, "ephemeral commit reset failed");
        }
        result
    }
}

impl Drop for EphemeralCommit<'_> {
    fn drop(&mut self) {
        if !self.unwound {
            if let Err(e) = reset_to(self.clone, &self.head) {
                tracing::error!(error = %e, clone = ?self.clone, "failed to reset ephemeral commit on drop");
            }
        }
    }
}

/// Status, log and diff against sandboxes known to a [`Registry`].
pub struct GitCompare {
    registry: Arc<Registry>,
}

impl GitCompare {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Raw `git status` of the sandbox clone.
    pub fn status(&self, id: &SandboxId) -> Result<String> {
        let sandbox = self.registry.lookup(id)?;
        status_at(sandbox.clone_path())
    }

    /// Raw `git log` of the sandbox clone.
    pub fn log(&self, id: &SandboxId) -> Result<String> {
        let sandbox = self.registry.lookup(id)?;
        log_at(sandbox.clone_path())
    }

    /// Diff of the sandbox against a base branch.
    ///
    /// `branch` defaults to the branch named after the sandbox, then the
    /// configured default branch. Without `include_uncommitted` host HEAD is
    /// diffed against the base; with it the base is diffed against the
    /// clone's work tree while holding the sandbox's [`CompareLock`].
    pub fn diff(
        &self,
        id: &SandboxId,
        branch: Option<&str>,
        include_uncommitted: bool,
    ) -> Result<String> {
        let sandbox = self.registry.lookup(id)?;
        let host = sandbox.host_path();
        let config = self.registry.config();

        if !include_uncommitted {
            return diff_committed(host, id, branch, &config.default_branch);
        }

        let _lock = CompareLock::acquire(&sandbox_dir(&config.clone_root, id))?;
        diff_uncommitted(host, sandbox.clone_path(), id, branch, &config.default_branch)
    }
}
