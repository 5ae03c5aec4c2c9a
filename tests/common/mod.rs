//! Shared fixtures for integration tests: a temp git repo, a byte-copying
//! clone primitive and an in-memory container runtime.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sandcastle::{
    CloneManager, ClonePrimitive, ContainerHandle, ContainerRuntime, ContainerSnapshot,
    ContainerSpec, Error, ExecSpec, LogOptions, LogStream, ProcessHandle, Registry, Result,
    SandConfig, WaitOutcome,
};

/// Runs git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Helper to create a temp git repo on `main` with one commit.
pub fn create_temp_git_repo() -> TempDir {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let path = temp_dir.path();

    git(path, &["init", "--quiet"]);
    git(path, &["config", "user.email", "test@test.com"]);
    git(path, &["config", "user.name", "Test User"]);
    git(path, &["config", "commit.gpgsign", "false"]);
    std::fs::write(path.join("README.md"), "# Test Repo\n").expect("failed to write README");
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "Initial commit"]);
    git(path, &["branch", "-M", "main"]);

    temp_dir
}

/// Clones with a plain `cp -a`; CI filesystems rarely support reflinks.
pub struct CopyPrimitive;

impl ClonePrimitive for CopyPrimitive {
    fn clone_tree(&self, source: &Path, dest: &Path) -> std::result::Result<(), String> {
        let output = Command::new("cp")
            .arg("-a")
            .arg(source)
            .arg(dest)
            .output()
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).to_string())
        }
    }

    fn name(&self) -> &str {
        "copy"
    }
}

/// What the fake runtime has been asked to do.
#[derive(Debug, Default)]
pub struct FakeState {
    /// When set, `status`, `stop` and `remove` fail as if the runtime were
    /// not started.
    pub down: bool,
    /// Container name to status string (`created`, `running`, `stopped`).
    pub containers: HashMap<String, String>,
    pub created: Vec<ContainerSpec>,
    pub built: Vec<(PathBuf, String)>,
    pub execs: Vec<ExecSpec>,
    pub calls: Vec<String>,
    /// Exit code returned by every exec.
    pub exec_exit: i32,
    pub log_lines: Vec<String>,
}

/// In-memory [`ContainerRuntime`]. Handles are container names.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake runtime state poisoned")
    }

    fn record(&self, call: impl Into<String>) {
        self.state().calls.push(call.into());
    }

    fn check_up(&self, operation: &'static str) -> Result<()> {
        if self.state().down {
            return Err(Error::Runtime {
                operation,
                message: "runtime is not running".to_string(),
                guidance: Some("start the runtime".to_string()),
            });
        }
        Ok(())
    }

    fn set_status(&self, handle: &ContainerHandle, status: &str) -> Result<()> {
        let mut state = self.state();
        match state.containers.get_mut(handle.as_str()) {
            Some(current) => {
                *current = status.to_string();
                Ok(())
            }
            None => Err(Error::Runtime {
                operation: "lookup",
                message: format!("no such container: {}", handle),
                guidance: None,
            }),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn status(&self) -> Result<()> {
        self.record("status");
        self.check_up("status")
    }

    async fn build(&self, dockerfile: &Path, _context: &Path, tag: &str) -> Result<()> {
        self.record(format!("build {}", tag));
        self.state()
            .built
            .push((dockerfile.to_path_buf(), tag.to_string()));
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record(format!("create {}", spec.name));
        let mut state = self.state();
        state
            .containers
            .insert(spec.name.clone(), "created".to_string());
        state.created.push(spec.clone());
        Ok(ContainerHandle::new(spec.name.clone()))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.record(format!("start {}", handle));
        self.set_status(handle, "running")
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.record(format!("stop {}", handle));
        self.check_up("stop")?;
        self.set_status(handle, "stopped")
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.record(format!("remove {}", handle));
        self.check_up("remove")?;
        self.state().containers.remove(handle.as_str());
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<Option<ContainerSnapshot>> {
        let status = self.state().containers.get(handle.as_str()).cloned();
        match status {
            Some(status) => Ok(Some(ContainerSnapshot::from_value(json!({
                "id": handle.as_str(),
                "status": status,
            }))?)),
            None => Ok(None),
        }
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        exec: &ExecSpec,
        _cancel: CancellationToken,
    ) -> Result<ProcessHandle> {
        self.record(format!("exec {}", handle));
        let mut state = self.state();
        state.execs.push(exec.clone());
        Ok(ProcessHandle::finished(WaitOutcome::Exited(Some(
            state.exec_exit,
        ))))
    }

    async fn stream_logs(
        &self,
        handle: &ContainerHandle,
        options: LogOptions,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        self.record(format!("logs {}", handle));
        let lines = self.state().log_lines.clone();
        let (tx, rx) = mpsc::channel(16);

        let task: JoinHandle<Result<WaitOutcome>> = tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    return Ok(WaitOutcome::Abandoned);
                }
            }
            if !options.follow {
                return Ok(WaitOutcome::Exited(Some(0)));
            }
            tokio::select! {
                _ = cancel.cancelled() => Ok(WaitOutcome::DeadlineExceeded),
                _ = tx.closed() => Ok(WaitOutcome::Abandoned),
            }
        });

        Ok(LogStream {
            lines: rx,
            process: ProcessHandle::from_task(task),
        })
    }
}

/// A registry rooted in its own temp dir, backed by [`FakeRuntime`].
pub struct TestRegistry {
    pub root: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<Registry>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(SandConfig) -> SandConfig) -> Self {
        let root = TempDir::new().expect("failed to create clone root");
        let runtime = FakeRuntime::new();
        let config = adjust(SandConfig::new(root.path()));
        let registry = Registry::new(config, runtime.clone())
            .with_clone_manager(CloneManager::new(Arc::new(CopyPrimitive)));

        Self {
            root,
            runtime,
            registry: Arc::new(registry),
        }
    }
}
