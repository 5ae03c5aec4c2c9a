//! Container runtime backed by a docker-compatible command-line tool.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::{
    ContainerHandle, ContainerRuntime, ContainerSnapshot, ContainerSpec, ExecSpec, LogOptions,
    LogStream, ProcessHandle, StreamMode, WaitOutcome,
};

/// Stderr fragments that mean the runtime daemon/service is down.
const NOT_RUNNING_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "xpc connection error",
    "apiserver is not running",
    "connection refused",
    "system start",
];

/// Runtime that shells out to `container` (Apple), `docker` or `podman`.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    /// Creates a runtime driving `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Returns the CLI binary name.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_apple_container(&self) -> bool {
        Path::new(&self.binary)
            .file_name()
            .is_some_and(|name| name == "container")
    }

    fn start_hint(&self) -> String {
        if self.is_apple_container() {
            "start the runtime with `container system start`".to_string()
        } else {
            format!("start the {} daemon and retry", self.binary)
        }
    }

    fn status_args(&self) -> Vec<String> {
        if self.is_apple_container() {
            vec!["system".to_string(), "status".to_string()]
        } else {
            vec!["info".to_string()]
        }
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

        if let Some(cpus) = spec.resources.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &spec.resources.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target.display());
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("--volume".to_string());
            args.push(volume);
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(workdir) = &spec.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.display().to_string());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    fn exec_args(handle: &ContainerHandle, exec: &ExecSpec) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if exec.interactive {
            args.push("--interactive".to_string());
        }
        if exec.tty {
            args.push("--tty".to_string());
        }
        for (key, value) in &exec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(workdir) = &exec.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.display().to_string());
        }
        args.push(handle.to_string());
        args.extend(exec.command.iter().cloned());
        args
    }

    fn logs_args(&self, handle: &ContainerHandle, options: LogOptions) -> Vec<String> {
        let mut args = vec!["logs".to_string()];
        if options.follow {
            args.push("--follow".to_string());
        }
        if options.boot {
            if self.is_apple_container() {
                args.push("--boot".to_string());
            } else {
                tracing::warn!(cli = %self.binary, "boot logs are not supported, showing stdio");
            }
        }
        args.push(handle.to_string());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        tracing::debug!(cli = %self.binary, args = ?args, "running container command");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, operation: &'static str, err: std::io::Error) -> Error {
        let guidance = if err.kind() == std::io::ErrorKind::NotFound {
            Some(format!(
                "install `{}` or set container_cli to another runtime",
                self.binary
            ))
        } else {
            None
        };
        Error::Runtime {
            operation,
            message: format!("failed to run {}: {}", self.binary, err),
            guidance,
        }
    }

    fn failure(&self, operation: &'static str, stderr: &str) -> Error {
        let lowered = stderr.to_ascii_lowercase();
        let guidance = NOT_RUNNING_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
            .then(|| self.start_hint());
        Error::Runtime {
            operation,
            message: stderr.trim().to_string(),
            guidance,
        }
    }

    /// Runs a short command to completion and returns its stdout.
    async fn run(&self, operation: &'static str, args: &[String]) -> Result<String> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(operation, e))?;

        if !output.status.success() {
            return Err(self.failure(operation, &String::from_utf8_lossy(&output.stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_not_found(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("no such") || lowered.contains("not found")
}

fn stdio(mode: StreamMode) -> Stdio {
    match mode {
        StreamMode::Inherit => Stdio::inherit(),
        StreamMode::Null => Stdio::null(),
    }
}

async fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill runtime process");
    }
}

/// Watches `child` until it exits or one of the tokens fires.
fn watch(
    mut child: Child,
    cancel: CancellationToken,
    abandoned: CancellationToken,
) -> ProcessHandle {
    ProcessHandle::from_task(tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => status
                .map(|status| WaitOutcome::Exited(status.code()))
                .map_err(Error::from),
            _ = cancel.cancelled() => {
                stop_child(&mut child).await;
                Ok(WaitOutcome::DeadlineExceeded)
            }
            _ = abandoned.cancelled() => {
                stop_child(&mut child).await;
                Ok(WaitOutcome::Abandoned)
            }
        }
    }))
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn status(&self) -> Result<()> {
        self.run("status", &self.status_args()).await.map_err(|e| match e {
            // Any status failure means the runtime is unusable.
            Error::Runtime {
                operation,
                message,
                guidance: None,
            } => Error::Runtime {
                operation,
                message,
                guidance: Some(self.start_hint()),
            },
            other => other,
        })?;
        Ok(())
    }

    async fn build(&self, dockerfile: &Path, context: &Path, tag: &str) -> Result<()> {
        let args = vec![
            "build".to_string(),
            "--tag".to_string(),
            tag.to_string(),
            "--file".to_string(),
            dockerfile.display().to_string(),
            context.display().to_string(),
        ];
        tracing::info!(tag = %tag, dockerfile = ?dockerfile, "building sandbox image");
        self.run("build", &args).await?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let stdout = self.run("create", &Self::create_args(spec)).await?;
        let id = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or(spec.name.as_str());
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.run("start", &["start".to_string(), handle.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.run("stop", &["stop".to_string(), handle.to_string()])
            .await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.run("remove", &["rm".to_string(), handle.to_string()])
            .await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<Option<ContainerSnapshot>> {
        let stdout = match self
            .run("inspect", &["inspect".to_string(), handle.to_string()])
            .await
        {
            Ok(stdout) => stdout,
            Err(Error::Runtime { message, .. }) if is_not_found(&message) => return Ok(None),
            Err(e) => return Err(e),
        };

        // apple/container prints `[]` for unknown IDs.
        Ok(ContainerSnapshot::parse_all(&stdout)?.into_iter().next())
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        exec: &ExecSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessHandle> {
        let child = self
            .command(&Self::exec_args(handle, exec))
            .stdin(stdio(exec.stdin))
            .stdout(stdio(exec.stdout))
            .stderr(stdio(exec.stderr))
            .spawn()
            .map_err(|e| self.spawn_error("exec", e))?;

        Ok(watch(child, cancel, CancellationToken::new()))
    }

    async fn stream_logs(
        &self,
        handle: &ContainerHandle,
        options: LogOptions,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        let mut child = self
            .command(&self.logs_args(handle, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| self.spawn_error("logs", e))?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Runtime {
            operation: "logs",
            message: "log process has no stdout".to_string(),
            guidance: None,
        })?;

        let (tx, rx) = mpsc::channel(256);
        let abandoned = CancellationToken::new();
        let drain_cancel = cancel.clone();
        let drain_abandoned = abandoned.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    _ = tx.closed() => {
                        tracing::debug!("log reader dropped, stopping stream");
                        drain_abandoned.cancel();
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            tokio::select! {
                                sent = tx.send(line) => {
                                    if sent.is_err() {
                                        tracing::debug!("log reader dropped, stopping stream");
                                        drain_abandoned.cancel();
                                        break;
                                    }
                                }
                                _ = drain_cancel.cancelled() => break,
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "error reading container logs");
                            break;
                        }
                    },
                }
            }
        });

        Ok(LogStream {
            lines: rx,
            process: watch(child, cancel, abandoned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Mount, Resources};
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandcastle-demo".to_string(),
            image: "alpine:3".to_string(),
            mounts: vec![Mount::read_write("/tmp/sand/boxen/demo/app", "/app")],
            resources: Resources {
                cpus: Some(2),
                memory: Some("4G".to_string()),
            },
            env: vec![("SANDCASTLE_ID".to_string(), "demo".to_string())],
            workdir: Some(PathBuf::from("/app")),
            command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }

    #[test]
    fn create_args_mount_clone_read_write() {
        let args = CliRuntime::create_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name sandcastle-demo"));
        assert!(joined.contains("--volume /tmp/sand/boxen/demo/app:/app"));
        assert!(!joined.contains(":ro"));
        assert!(joined.contains("--cpus 2 --memory 4G"));
        assert!(joined.ends_with("alpine:3 sleep infinity"));
    }

    #[test]
    fn exec_args_put_handle_before_command() {
        let exec = ExecSpec {
            env: vec![("A".to_string(), "1".to_string())],
            workdir: Some(PathBuf::from("/app")),
            ..ExecSpec::interactive(vec!["/bin/zsh".to_string()])
        };
        let args = CliRuntime::exec_args(&ContainerHandle::new("abc"), &exec);
        assert_eq!(
            args,
            vec!["exec", "--interactive", "--tty", "--env", "A=1", "--workdir", "/app", "abc", "/bin/zsh"]
        );
    }

    #[test]
    fn boot_logs_only_for_apple_container() {
        let handle = ContainerHandle::new("abc");
        let options = LogOptions {
            follow: true,
            boot: true,
        };
        assert_eq!(
            CliRuntime::new("container").logs_args(&handle, options),
            vec!["logs", "--follow", "--boot", "abc"]
        );
        assert_eq!(
            CliRuntime::new("docker").logs_args(&handle, options),
            vec!["logs", "--follow", "abc"]
        );
    }

    #[test]
    fn status_command_depends_on_runtime() {
        assert_eq!(
            CliRuntime::new("/usr/local/bin/container").status_args(),
            vec!["system", "status"]
        );
        assert_eq!(CliRuntime::new("podman").status_args(), vec!["info"]);
    }

    #[test]
    fn daemon_down_failures_carry_guidance() {
        let runtime = CliRuntime::new("docker");
        let err = runtime.failure(
            "create",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock.",
        );
        match err {
            Error::Runtime { guidance, message, .. } => {
                assert!(guidance.unwrap().contains("docker daemon"));
                assert!(message.starts_with("Cannot connect"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = runtime.failure("create", "invalid reference format");
        assert!(matches!(err, Error::Runtime { guidance: None, .. }));
    }

    /// A stand-in runtime binary: records its PID and then sleeps silently,
    /// whatever arguments it is given.
    fn sleeping_runtime(dir: &Path) -> (CliRuntime, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let pid_file = dir.join("pid");
        let script = dir.join("fake-runtime");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = CliRuntime::new(script.display().to_string());
        assert_eq!(runtime.binary(), script.display().to_string());
        (runtime, pid_file)
    }

    async fn read_pid(pid_file: &Path) -> String {
        for _ in 0..100 {
            if let Ok(pid) = std::fs::read_to_string(pid_file) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("runtime script never started");
    }

    fn is_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .stderr(Stdio::null())
            .status()
            .unwrap()
            .success()
    }

    #[tokio::test]
    async fn cancelled_exec_is_killed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runtime, pid_file) = sleeping_runtime(dir.path());
        let exec = ExecSpec {
            command: vec!["true".to_string()],
            stdin: StreamMode::Null,
            stdout: StreamMode::Null,
            stderr: StreamMode::Null,
            ..ExecSpec::default()
        };
        let cancel = CancellationToken::new();

        let process = runtime
            .exec(&ContainerHandle::new("demo"), &exec, cancel.clone())
            .await
            .unwrap();
        let pid = read_pid(&pid_file).await;
        assert!(is_alive(&pid));

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("exec was not stopped")
            .unwrap();

        assert_eq!(outcome, WaitOutcome::DeadlineExceeded);
        assert!(!is_alive(&pid));
    }

    #[tokio::test]
    async fn dropped_reader_abandons_silent_log_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let (runtime, pid_file) = sleeping_runtime(dir.path());
        let options = LogOptions {
            follow: true,
            boot: false,
        };

        let LogStream { lines, process } = runtime
            .stream_logs(&ContainerHandle::new("demo"), options, CancellationToken::new())
            .await
            .unwrap();
        let pid = read_pid(&pid_file).await;
        drop(lines);

        let outcome = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("log stream kept running without a reader")
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Abandoned);
        assert!(!is_alive(&pid));
    }

    #[tokio::test]
    async fn missing_binary_is_a_runtime_error() {
        let runtime = CliRuntime::new("sandcastle-no-such-runtime-binary");
        let err = runtime.status().await.unwrap_err();
        match err {
            Error::Runtime { operation, guidance, .. } => {
                assert_eq!(operation, "status");
                assert!(guidance.unwrap().contains("install"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
