//! Error types for sandbox lifecycle, git bridging and comparison.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox ID is not usable as a directory name or ref component.
    #[error("invalid sandbox id '{id}': {reason}")]
    InvalidSandboxId { id: String, reason: String },

    /// No sandbox with this ID exists under the clone root.
    #[error("sandbox '{0}' not found")]
    SandboxNotFound(String),

    /// Could not find a free sandbox ID.
    #[error("failed to allocate a sandbox id after {0} attempts")]
    IdAllocationFailed(u32),

    /// The clone source is not a directory.
    #[error("source directory not found: {0}")]
    SourceNotFound(PathBuf),

    /// The clone target already has content.
    #[error("clone target already exists and is not empty: {0}")]
    CloneExists(PathBuf),

    /// The copy-on-write primitive failed.
    #[error("copy-on-write clone of {source_path} failed: {reason}")]
    ClonePrimitiveFailed { source_path: PathBuf, reason: String },

    /// A directory is not a git repository.
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    /// Adding the remote pair failed (any partial wiring was rolled back).
    #[error("failed to wire remotes: {0}")]
    RemoteWiring(String),

    /// The host-side remote for the sandbox is missing.
    #[error("remote '{remote}' is not configured in {host_path}")]
    RemoteNotWired { remote: String, host_path: PathBuf },

    /// Fetching from the sandbox clone failed.
    #[error("fetch from '{remote}' failed: {reason}")]
    FetchFailed { remote: String, reason: String },

    /// The requested base branch does not exist on the sandbox remote.
    #[error("branch '{0}' does not resolve")]
    NoSuchBranch(String),

    /// The temporary commit could not be created.
    #[error("ephemeral commit failed during {stage}: {reason}")]
    EphemeralCommitFailed { stage: &'static str, reason: String },

    /// The clone could not be reset after an ephemeral commit.
    #[error(
        "FATAL: could not reset {clone_path} back to {head} after ephemeral commit: {reason}; \
         run `git reset --mixed {head}` in the clone before comparing again"
    )]
    EphemeralResetFailed {
        clone_path: PathBuf,
        head: String,
        reason: String,
    },

    /// Other git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// The container runtime reported an error.
    #[error("container runtime {operation} failed: {message}{}", guidance_suffix(.guidance))]
    Runtime {
        operation: &'static str,
        message: String,
        guidance: Option<String>,
    },

    /// The sandbox has no container yet.
    #[error("sandbox '{0}' has no container")]
    NoContainer(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("cannot move sandbox from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Sandbox metadata could not be read or written.
    #[error("sandbox metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

fn guidance_suffix(guidance: &Option<String>) -> String {
    match guidance {
        Some(hint) => format!(" ({})", hint),
        None => String::new(),
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
