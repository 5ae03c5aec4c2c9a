//! Sandbox registry and lifecycle.
//!
//! The registry allocates sandbox IDs, composes the clone manager, the git
//! remote bridge and the container runtime, and persists each sandbox next to
//! its clone. The directory listing under `<clone_root>/boxen` is the only
//! record of which sandboxes exist, so every lookup goes back to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::backoff::PollBackoff;
use crate::config::SandConfig;
use crate::container::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStatus, ExecSpec, LogOptions,
    LogStream, Mount, Resources, WaitOutcome,
};
use crate::error::{Error, Result};
use crate::git::command::{git, is_repository};
use crate::git::remote::{read_remotes, remote_url, remotes_present, unwire_remotes, wire_remotes};
use crate::git::CLONE_REMOTE;

use super::clone::{clone_path, remove_tree, sandbox_dir};
use super::record::{self, Sandbox};
use super::{CloneManager, CloneRecord, SandboxId, SandboxState};

/// Attempts at finding an unused generated ID.
pub const MAX_ID_ATTEMPTS: u32 = 8;

/// Told to processes inside the container via `SANDCASTLE_GIT_NOTE`.
pub const IN_CONTAINER_GIT_NOTE: &str = "the git remotes origin-host-workdir and sandbox-clone-* \
     are host filesystem paths and cannot be reached from inside this container";

/// Name given to a sandbox's container.
pub fn container_name(id: &SandboxId) -> String {
    format!("sandcastle-{}", id)
}

/// Owns the mapping from sandbox IDs to sandboxes under one clone root.
pub struct Registry {
    config: SandConfig,
    clones: CloneManager,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Registry {
    /// Creates a registry that clones with reflinks.
    pub fn new(config: SandConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            clones: CloneManager::default(),
            runtime,
        }
    }

    /// Replaces the clone manager.
    pub fn with_clone_manager(mut self, clones: CloneManager) -> Self {
        self.clones = clones;
        self
    }

    pub fn config(&self) -> &SandConfig {
        &self.config
    }

    fn sandbox_dir(&self, id: &SandboxId) -> PathBuf {
        sandbox_dir(&self.config.clone_root, id)
    }

    fn persist(&self, sandbox: &Sandbox) -> Result<()> {
        record::save(&self.sandbox_dir(&sandbox.id), sandbox)
    }

    /// Reserves a sandbox directory for `requested`, or for a fresh ID.
    fn claim_id(&self, requested: Option<SandboxId>) -> Result<SandboxId> {
        std::fs::create_dir_all(self.config.boxen_dir())?;

        if let Some(id) = requested {
            let path = clone_path(&self.config.clone_root, &id);
            if path.exists() {
                return Err(Error::CloneExists(path));
            }
            std::fs::create_dir_all(self.sandbox_dir(&id))?;
            return Ok(id);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = SandboxId::generate();
            match std::fs::create_dir(self.sandbox_dir(&id)) {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::debug!(sandbox_id = %id, "sandbox id collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::IdAllocationFailed(MAX_ID_ATTEMPTS))
    }

    /// Clones `cwd` into a new sandbox and wires git remotes if `cwd` is a
    /// repository. The returned sandbox is in the `Cloned` state.
    ///
    /// Nothing is left behind on failure.
    pub fn new_sandbox(&self, cwd: &Path, requested: Option<SandboxId>) -> Result<Sandbox> {
        let id = self.claim_id(requested)?;
        let result = self.populate(cwd, &id);
        if result.is_err() {
            if let Err(e) = remove_tree(&self.sandbox_dir(&id)) {
                tracing::error!(sandbox_id = %id, error = %e, "failed to remove sandbox directory");
            }
        }
        result
    }

    fn populate(&self, cwd: &Path, id: &SandboxId) -> Result<Sandbox> {
        let clone_record = self
            .clones
            .create_clone(cwd, &self.config.clone_root, id)?;
        let host = clone_record.host_source_path.clone();
        let clone = clone_record.clone_root_path.clone();

        if is_repository(&host) {
            let out = git(&clone, ["checkout", "--quiet", "-b", id.as_str()])?;
            if !out.success {
                tracing::warn!(
                    sandbox_id = %id,
                    error = %out.stderr.trim(),
                    "could not create sandbox branch in clone"
                );
            }
        }

        let remotes = match wire_remotes(&host, &clone, id) {
            Ok(remotes) => remotes,
            Err(e) => {
                self.clones.destroy_clone(&clone_record)?;
                return Err(e);
            }
        };

        let mut sandbox = Sandbox {
            id: id.clone(),
            clone_record,
            remotes,
            container: None,
            image: None,
            state: SandboxState::Unregistered,
        };
        sandbox.transition(SandboxState::Cloned)?;
        self.persist(&sandbox)?;

        tracing::info!(sandbox_id = %id, clone = ?clone, host = ?host, "created sandbox");
        Ok(sandbox)
    }

    /// Reads a sandbox from disk without consulting the container runtime.
    ///
    /// A clone whose metadata file is missing is rebuilt from the clone's
    /// `origin-host-workdir` remote. Never writes.
    pub fn lookup(&self, id: &SandboxId) -> Result<Sandbox> {
        let clone = clone_path(&self.config.clone_root, id);
        if !clone.is_dir() {
            return Err(Error::SandboxNotFound(id.to_string()));
        }

        if let Some(sandbox) = record::load(&self.sandbox_dir(id))? {
            return Ok(sandbox);
        }

        let Some(host) = remote_url(&clone, CLONE_REMOTE) else {
            tracing::warn!(sandbox_id = %id, clone = ?clone, "clone has no metadata and no host remote");
            return Err(Error::SandboxNotFound(id.to_string()));
        };
        let host = PathBuf::from(host);
        tracing::info!(sandbox_id = %id, host = ?host, "rebuilt sandbox metadata from git config");

        let created_at = std::fs::metadata(&clone)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Sandbox {
            id: id.clone(),
            remotes: read_remotes(&host, &clone, id),
            clone_record: CloneRecord {
                sandbox_id: id.clone(),
                host_source_path: host,
                clone_root_path: clone,
                created_at,
            },
            container: None,
            image: None,
            state: SandboxState::Cloned,
        })
    }

    /// Re-enters an existing sandbox.
    ///
    /// Remotes are left alone when present and only re-wired when both
    /// sides are gone. A recorded container is re-inspected: if it no longer
    /// exists the sandbox resumes as `Cloned`.
    pub async fn attach_sandbox(&self, id: &SandboxId) -> Result<Sandbox> {
        let mut sandbox = self.lookup(id)?;
        let before = sandbox.clone();

        self.reconcile_remotes(&mut sandbox)?;

        sandbox.state = match sandbox.container.clone() {
            None => SandboxState::Cloned,
            Some(handle) => {
                self.runtime.status().await?;
                match self.runtime.inspect(&handle).await? {
                    None => {
                        tracing::warn!(
                            sandbox_id = %id,
                            container = %handle,
                            "recorded container no longer exists"
                        );
                        sandbox.container = None;
                        SandboxState::Cloned
                    }
                    Some(snapshot) => match snapshot.status {
                        ContainerStatus::Running => SandboxState::Running,
                        ContainerStatus::Created => SandboxState::ContainerCreated,
                        _ => SandboxState::Stopped,
                    },
                }
            }
        };

        if sandbox != before {
            self.persist(&sandbox)?;
        }

        tracing::info!(sandbox_id = %id, state = %sandbox.state, "attached to sandbox");
        Ok(sandbox)
    }

    fn reconcile_remotes(&self, sandbox: &mut Sandbox) -> Result<()> {
        let host = sandbox.host_path().to_path_buf();
        let clone = sandbox.clone_path().to_path_buf();

        match remotes_present(&host, &clone, &sandbox.id) {
            (true, true) => {
                sandbox.remotes = read_remotes(&host, &clone, &sandbox.id);
            }
            (false, false) if is_repository(&host) && is_repository(&clone) => {
                tracing::info!(sandbox_id = %sandbox.id, "re-wiring missing remotes");
                sandbox.remotes = wire_remotes(&host, &clone, &sandbox.id)?;
            }
            (false, false) => {
                sandbox.remotes = None;
            }
            (clone_side, host_side) => {
                tracing::warn!(
                    sandbox_id = %sandbox.id,
                    clone_side,
                    host_side,
                    "sandbox remotes are only partially present"
                );
            }
        }
        Ok(())
    }

    /// Lists sandbox IDs that have a clone on disk.
    pub fn list(&self) -> Result<Vec<SandboxId>> {
        let entries = match std::fs::read_dir(self.config.boxen_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.path().join(super::clone::APP_DIR).is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match SandboxId::new(name) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::debug!(error = %e, "skipping foreign directory"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Creates the sandbox's container with the clone mounted read-write.
    /// Does nothing if a container already exists.
    pub async fn create_container(&self, sandbox: &mut Sandbox) -> Result<()> {
        if sandbox.container.is_some() {
            return Ok(());
        }
        sandbox.state.transition(SandboxState::ContainerCreated)?;

        self.runtime.status().await?;

        let image = match &self.config.dockerfile {
            Some(dockerfile) => {
                let tag = container_name(&sandbox.id);
                let context = dockerfile
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| sandbox.clone_path());
                self.runtime.build(dockerfile, context, &tag).await?;
                tag
            }
            None => self.config.image.clone(),
        };

        let spec = ContainerSpec {
            name: container_name(&sandbox.id),
            image: image.clone(),
            mounts: vec![Mount::read_write(
                sandbox.clone_path(),
                &self.config.mount_target,
            )],
            resources: Resources {
                cpus: self.config.cpus,
                memory: self.config.memory.clone(),
            },
            env: vec![("SANDCASTLE_ID".to_string(), sandbox.id.to_string())],
            workdir: Some(self.config.mount_target.clone()),
            command: vec!["sleep".to_string(), "infinity".to_string()],
        };

        let handle = self.runtime.create(&spec).await?;
        tracing::info!(sandbox_id = %sandbox.id, container = %handle, image = %image, "created container");

        sandbox.transition(SandboxState::ContainerCreated)?;
        sandbox.container = Some(handle);
        sandbox.image = Some(image);
        self.persist(sandbox)
    }

    fn handle(sandbox: &Sandbox) -> Result<ContainerHandle> {
        sandbox
            .container
            .clone()
            .ok_or_else(|| Error::NoContainer(sandbox.id.to_string()))
    }

    /// Starts the container and waits for the runtime to report it running.
    pub async fn start_container(&self, sandbox: &mut Sandbox) -> Result<()> {
        let handle = Self::handle(sandbox)?;
        if sandbox.state.is_running() {
            return Ok(());
        }
        sandbox.state.transition(SandboxState::Running)?;

        self.runtime.start(&handle).await?;
        self.wait_running(&handle).await?;

        sandbox.transition(SandboxState::Running)?;
        tracing::info!(sandbox_id = %sandbox.id, container = %handle, "started container");
        self.persist(sandbox)
    }

    async fn wait_running(&self, handle: &ContainerHandle) -> Result<()> {
        if self.config.start_timeout_secs == 0 {
            return Ok(());
        }
        let budget = Duration::from_secs(self.config.start_timeout_secs);
        let mut backoff = PollBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
            budget,
        );

        loop {
            if let Some(snapshot) = self.runtime.inspect(handle).await? {
                if snapshot.is_running() {
                    return Ok(());
                }
            }
            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(Error::Runtime {
                        operation: "start",
                        message: format!(
                            "container {} did not report running within {}s",
                            handle,
                            budget.as_secs()
                        ),
                        guidance: None,
                    })
                }
            }
        }
    }

    /// Runs the configured shell interactively in the container and blocks
    /// until it exits. The sandbox is `Attached` for the duration.
    pub async fn shell_exec(
        &self,
        sandbox: &mut Sandbox,
        cancel: CancellationToken,
    ) -> Result<WaitOutcome> {
        let handle = Self::handle(sandbox)?;
        sandbox.transition(SandboxState::Attached)?;

        let exec = ExecSpec {
            env: vec![
                ("SANDCASTLE_ID".to_string(), sandbox.id.to_string()),
                (
                    "SANDCASTLE_GIT_NOTE".to_string(),
                    IN_CONTAINER_GIT_NOTE.to_string(),
                ),
            ],
            workdir: Some(self.config.mount_target.clone()),
            ..ExecSpec::interactive(
                self.config
                    .shell
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            )
        };

        let outcome = match self.runtime.exec(&handle, &exec, cancel).await {
            Ok(process) => process.wait().await,
            Err(e) => Err(e),
        };

        sandbox.transition(SandboxState::Running)?;
        if let Ok(outcome) = &outcome {
            tracing::info!(sandbox_id = %sandbox.id, outcome = ?outcome, "shell session ended");
        }
        outcome
    }

    /// Streams the container's logs.
    pub async fn stream_logs(
        &self,
        sandbox: &Sandbox,
        options: LogOptions,
        cancel: CancellationToken,
    ) -> Result<LogStream> {
        let handle = Self::handle(sandbox)?;
        self.runtime.stream_logs(&handle, options, cancel).await
    }

    /// Removes a sandbox by ID, whether or not the runtime is reachable.
    ///
    /// Stopping and removing the container are best effort: failures are
    /// logged with the container name so it can be removed by hand, and the
    /// clone, remotes and sandbox directory are deleted regardless.
    pub async fn remove_sandbox(&self, id: &SandboxId) -> Result<()> {
        let mut sandbox = self.lookup(id)?;

        if let Some(handle) = sandbox.container.take() {
            if let Err(e) = self.runtime.stop(&handle).await {
                tracing::warn!(sandbox_id = %id, container = %handle, error = %e, "could not stop container");
            }
            if let Err(e) = self.runtime.remove(&handle).await {
                tracing::warn!(
                    sandbox_id = %id,
                    container = %handle,
                    error = %e,
                    "could not remove container, remove it manually"
                );
            }
        }

        self.cleanup(&mut sandbox, true).await
    }

    /// Stops the container if it is up. With `remove`, also deletes the
    /// container, unwires remotes and destroys the clone; without it the
    /// clone and remotes stay so the sandbox can be attached again.
    ///
    /// Every step is attempted; the first failure is returned.
    pub async fn cleanup(&self, sandbox: &mut Sandbox, remove: bool) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Some(handle) = sandbox.container.clone() {
            if matches!(
                sandbox.state,
                SandboxState::Running | SandboxState::Attached | SandboxState::ContainerCreated
            ) {
                match self.runtime.stop(&handle).await {
                    Ok(()) => {
                        if sandbox.state == SandboxState::Attached {
                            sandbox.transition(SandboxState::Running)?;
                        }
                        sandbox.transition(SandboxState::Stopped)?;
                        tracing::info!(sandbox_id = %sandbox.id, container = %handle, "stopped container");
                    }
                    Err(e) => {
                        tracing::error!(sandbox_id = %sandbox.id, error = %e, "failed to stop container");
                        first_error = Some(e);
                    }
                }
            }
        }

        if !remove {
            if let Err(e) = self.persist(sandbox) {
                first_error.get_or_insert(e);
            }
            return first_error.map_or(Ok(()), Err);
        }

        if let Some(handle) = sandbox.container.take() {
            if let Err(e) = self.runtime.remove(&handle).await {
                tracing::error!(sandbox_id = %sandbox.id, error = %e, "failed to remove container");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = unwire_remotes(sandbox.host_path(), sandbox.clone_path(), &sandbox.id) {
            tracing::error!(sandbox_id = %sandbox.id, error = %e, "failed to unwire remotes");
            first_error.get_or_insert(e);
        }
        sandbox.remotes = None;

        if let Err(e) = self.clones.destroy_clone(&sandbox.clone_record) {
            first_error.get_or_insert(e);
        }
        if let Err(e) = remove_tree(&self.sandbox_dir(&sandbox.id)) {
            first_error.get_or_insert(e);
        }

        sandbox.state = SandboxState::Removed;
        tracing::info!(sandbox_id = %sandbox.id, "removed sandbox");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::CliRuntime;
    use crate::git::command::tests::create_temp_git_repo;
    use crate::sandbox::clone::tests::CopyPrimitive;
    use tempfile::TempDir;

    /// Registry for disk-only operations; the runtime is never invoked.
    fn registry(root: &Path) -> Registry {
        Registry::new(
            SandConfig::new(root),
            Arc::new(CliRuntime::new("sandcastle-test-unused")),
        )
        .with_clone_manager(CloneManager::new(Arc::new(CopyPrimitive)))
    }

    #[test]
    fn new_sandbox_generates_id_and_persists() {
        let host = create_temp_git_repo();
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());

        let sandbox = registry.new_sandbox(host.path(), None).unwrap();

        assert_eq!(sandbox.state, SandboxState::Cloned);
        assert_eq!(sandbox.id.as_str().len(), 8);
        assert!(record::metadata_path(&registry.sandbox_dir(&sandbox.id)).is_file());
        assert_eq!(registry.lookup(&sandbox.id).unwrap(), sandbox);
    }

    #[test]
    fn clone_checks_out_branch_named_after_sandbox() {
        let host = create_temp_git_repo();
        let root = TempDir::new().unwrap();
        let id = SandboxId::new("demo").unwrap();

        let sandbox = registry(root.path())
            .new_sandbox(host.path(), Some(id))
            .unwrap();

        let branch = git(sandbox.clone_path(), ["rev-parse", "--abbrev-ref", "HEAD"])
            .unwrap()
            .stdout;
        assert_eq!(branch.trim(), "demo");
    }

    #[test]
    fn requested_id_must_be_unused() {
        let host = create_temp_git_repo();
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());
        let id = SandboxId::new("demo").unwrap();

        registry.new_sandbox(host.path(), Some(id.clone())).unwrap();
        let err = registry.new_sandbox(host.path(), Some(id.clone())).unwrap_err();

        assert!(matches!(err, Error::CloneExists(_)));
        assert!(registry.lookup(&id).is_ok());
    }

    #[test]
    fn non_repository_source_still_makes_a_sandbox() {
        let host = TempDir::new().unwrap();
        std::fs::write(host.path().join("notes.txt"), "plain dir").unwrap();
        let root = TempDir::new().unwrap();

        let sandbox = registry(root.path()).new_sandbox(host.path(), None).unwrap();

        assert!(sandbox.remotes.is_none());
        assert!(sandbox.clone_path().join("notes.txt").is_file());
    }

    #[test]
    fn failed_wiring_leaves_nothing_behind() {
        let host = create_temp_git_repo();
        crate::git::command::tests::run(
            host.path(),
            &["remote", "add", "sandbox-clone-demo", "/elsewhere"],
        );
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());
        let id = SandboxId::new("demo").unwrap();

        let err = registry.new_sandbox(host.path(), Some(id.clone())).unwrap_err();

        assert!(matches!(err, Error::RemoteWiring(_)));
        assert!(!registry.sandbox_dir(&id).exists());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn missing_source_leaves_nothing_behind() {
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());
        let err = registry
            .new_sandbox(&root.path().join("missing"), None)
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound(_)));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn lookup_of_unknown_id_does_not_touch_disk() {
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());
        let err = registry
            .lookup(&SandboxId::new("ghost").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::SandboxNotFound(_)));
        assert!(!root.path().join("boxen").exists());
    }

    #[test]
    fn lookup_rebuilds_metadata_from_git_config() {
        let host = create_temp_git_repo();
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());
        let sandbox = registry
            .new_sandbox(host.path(), Some(SandboxId::new("demo").unwrap()))
            .unwrap();
        std::fs::remove_file(record::metadata_path(&registry.sandbox_dir(&sandbox.id))).unwrap();

        let rebuilt = registry.lookup(&sandbox.id).unwrap();

        assert_eq!(rebuilt.host_path(), sandbox.host_path());
        assert_eq!(rebuilt.clone_path(), sandbox.clone_path());
        assert_eq!(rebuilt.remotes, sandbox.remotes);
        assert_eq!(rebuilt.state, SandboxState::Cloned);
    }

    #[test]
    fn list_only_reports_directories_with_clones() {
        let host = create_temp_git_repo();
        let root = TempDir::new().unwrap();
        let registry = registry(root.path());
        registry
            .new_sandbox(host.path(), Some(SandboxId::new("b").unwrap()))
            .unwrap();
        registry
            .new_sandbox(host.path(), Some(SandboxId::new("a").unwrap()))
            .unwrap();
        std::fs::create_dir_all(root.path().join("boxen/empty")).unwrap();

        let ids: Vec<String> = registry.list().unwrap().into_iter().map(String::from).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
