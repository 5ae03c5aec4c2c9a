//! Thin wrapper around the `git` binary.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Captured result of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Returns stdout on success, an [`Error::Git`] naming the command otherwise.
    pub fn into_stdout(self, what: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(Error::Git(format!("{}: {}", what, self.stderr.trim())))
        }
    }
}

/// Runs `git <args>` in `dir`.
///
/// Environment that would redirect git to another repository is cleared so
/// the command always acts on `dir`.
pub fn git<I, S>(dir: &Path, args: I) -> Result<GitOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    tracing::debug!(cwd = ?dir, args = ?args, "running git");

    let output = Command::new("git")
        .current_dir(dir)
        .args(&args)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .env_remove("GIT_INDEX_FILE")
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()?;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Returns whether `path` is the top level of a git work tree.
pub fn is_repository(path: &Path) -> bool {
    if !path.join(".git").exists() {
        return false;
    }
    match git(path, ["rev-parse", "--show-toplevel"]) {
        Ok(out) if out.success => {
            let top = Path::new(out.stdout.trim());
            match (std::fs::canonicalize(top), std::fs::canonicalize(path)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Resolves `rev` to a commit hash, `None` if it does not resolve.
pub fn resolve_commit(dir: &Path, rev: &str) -> Result<Option<String>> {
    let spec = format!("{}^{{commit}}", rev);
    let out = git(dir, ["rev-parse", "--verify", "--quiet", spec.as_str()])?;
    if out.success {
        Ok(Some(out.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}
