//! Container runtime contract.
//!
//! The registry drives containers through the [`ContainerRuntime`] trait and
//! never talks to a runtime directly. [`CliRuntime`] implements it by shelling
//! out to a docker-compatible CLI. Every call may block on an external
//! process, so all of them are async.

mod cli;
mod snapshot;

pub use cli::CliRuntime;
pub use snapshot::{ContainerSnapshot, ContainerStatus};

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Runtime-assigned identifier of a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    /// Read-write bind mount.
    pub fn read_write(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: Option<u32>,
    pub memory: Option<String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub resources: Resources,
    pub env: Vec<(String, String)>,
    pub workdir: Option<PathBuf>,
    /// Command that keeps the container alive; empty uses the image default.
    pub command: Vec<String>,
}

/// How a stream of the exec'd process is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Share the caller's terminal.
    #[default]
    Inherit,
    /// Discard.
    Null,
}

/// A command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub env: Vec<(String, String)>,
    pub workdir: Option<PathBuf>,
    pub stdin: StreamMode,
    pub stdout: StreamMode,
    pub stderr: StreamMode,
}

impl ExecSpec {
    /// An interactive terminal session running `command`.
    pub fn interactive(command: Vec<String>) -> Self {
        Self {
            command,
            interactive: true,
            tty: true,
            ..Self::default()
        }
    }
}

/// Options for [`ContainerRuntime::stream_logs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep streaming new output.
    pub follow: bool,
    /// Show the container's boot log instead of its stdio.
    pub boot: bool,
}

/// How a runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process exited; `None` when it was killed by a signal.
    Exited(Option<i32>),
    /// The cancellation token fired first and the process was stopped.
    DeadlineExceeded,
    /// The reader went away and the process was stopped.
    Abandoned,
}

impl WaitOutcome {
    pub fn success(self) -> bool {
        matches!(self, WaitOutcome::Exited(Some(0)))
    }
}

/// Completion handle of a runtime process.
///
/// Dropping the handle without waiting aborts the watcher task, which kills
/// the underlying process.
#[derive(Debug)]
pub struct ProcessHandle {
    task: Option<JoinHandle<Result<WaitOutcome>>>,
}

impl ProcessHandle {
    /// Wraps a task that resolves when the process is done.
    pub fn from_task(task: JoinHandle<Result<WaitOutcome>>) -> Self {
        Self { task: Some(task) }
    }

    /// A handle that has already finished with `outcome`.
    pub fn finished(outcome: WaitOutcome) -> Self {
        Self::from_task(tokio::spawn(async move { Ok(outcome) }))
    }

    /// Waits for the process to end.
    pub async fn wait(mut self) -> Result<WaitOutcome> {
        let Some(task) = self.task.take() else {
            return Ok(WaitOutcome::Abandoned);
        };
        task.await.map_err(|e| Error::Runtime {
            operation: "wait",
            message: format!("process watcher failed: {}", e),
            guidance: None,
        })?
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A container log stream.
///
/// Lines are drained by a background task into `lines`. The drain is best
/// effort: on cancellation it stops without flushing what is still buffered
/// in the pipe.
#[derive(Debug)]
pub struct LogStream {
    pub lines: mpsc::Receiver<String>,
    pub process: ProcessHandle,
}

/// Operations the sandbox core needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks the runtime is up.
    async fn status(&self) -> Result<()>;

    /// Builds `dockerfile` with `context` and tags the image `tag`.
    async fn build(&self, dockerfile: &Path, context: &Path, tag: &str) -> Result<()>;

    /// Creates (but does not start) a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Returns a snapshot, or `None` if the container does not exist.
    async fn inspect(&self, handle: &ContainerHandle) -> Result<Option<ContainerSnapshot>>;

    /// Starts `exec` inside the container. Await the returned handle for the
    /// exit outcome; firing `cancel` stops the process.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        exec: &ExecSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessHandle>;

    /// Streams container logs until EOF, cancellation, or the receiver is dropped.
    async fn stream_logs(
        &self,
        handle: &ContainerHandle,
        options: LogOptions,
        cancel: CancellationToken,
    ) -> Result<LogStream>;
}
