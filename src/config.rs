//! Sandbox configuration.
//!
//! Every setting the registry needs is carried in an explicit [`SandConfig`]
//! value. It is read from a TOML file when one exists and then overridden by
//! command-line flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the optional config file inside the clone root.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration for the sandbox registry and its container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandConfig {
    /// Root directory that holds `boxen/<id>/app` clones.
    #[serde(default = "default_clone_root")]
    pub clone_root: PathBuf,

    /// Container image reference used when no Dockerfile is given.
    #[serde(default = "default_image")]
    pub image: String,

    /// Dockerfile to build the sandbox image from.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,

    /// Shell launched for interactive sessions.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Branch compared against when the sandbox branch does not exist.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Container CLI binary (`container`, `docker`, `podman`).
    #[serde(default = "default_container_cli")]
    pub container_cli: String,

    /// Absolute in-container path the clone is mounted at.
    #[serde(default = "default_mount_target")]
    pub mount_target: PathBuf,

    /// CPU limit passed to the runtime.
    #[serde(default)]
    pub cpus: Option<u32>,

    /// Memory limit passed to the runtime (e.g. `4G`).
    #[serde(default)]
    pub memory: Option<String>,

    /// How long to wait for a started container to report running.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

fn default_clone_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".sandcastle"),
        _ => std::env::temp_dir().join("sandcastle"),
    }
}

fn default_image() -> String {
    "ghcr.io/sandcastle/default:latest".to_string()
}

fn default_shell() -> String {
    "/bin/zsh".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_container_cli() -> String {
    "container".to_string()
}

fn default_mount_target() -> PathBuf {
    PathBuf::from("/app")
}

fn default_start_timeout_secs() -> u64 {
    30
}

impl Default for SandConfig {
    fn default() -> Self {
        Self {
            clone_root: default_clone_root(),
            image: default_image(),
            dockerfile: None,
            shell: default_shell(),
            default_branch: default_branch(),
            container_cli: default_container_cli(),
            mount_target: default_mount_target(),
            cpus: None,
            memory: None,
            start_timeout_secs: default_start_timeout_secs(),
        }
    }
}

impl SandConfig {
    /// Creates a configuration rooted at `clone_root` with defaults elsewhere.
    pub fn new(clone_root: impl Into<PathBuf>) -> Self {
        Self {
            clone_root: clone_root.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Loads `<clone_root>/config.toml` if it exists, defaults otherwise.
    ///
    /// The clone root itself is not read from that file.
    pub fn load_from_root(clone_root: &Path) -> Result<Self> {
        let path = clone_root.join(CONFIG_FILE_NAME);
        let mut config = if path.is_file() {
            tracing::debug!(path = ?path, "loading config");
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.clone_root = clone_root.to_path_buf();
        Ok(config)
    }

    /// Sets the image reference.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the interactive shell.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the Dockerfile to build from.
    pub fn with_dockerfile(mut self, dockerfile: impl Into<PathBuf>) -> Self {
        self.dockerfile = Some(dockerfile.into());
        self
    }

    /// Sets the fallback comparison branch.
    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    /// Directory that holds one subdirectory per sandbox.
    pub fn boxen_dir(&self) -> PathBuf {
        self.clone_root.join("boxen")
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !self.clone_root.is_absolute() {
            result.add_error(format!(
                "clone_root '{}' must be an absolute path",
                self.clone_root.display()
            ));
        }

        if !self.mount_target.is_absolute() {
            result.add_error(format!(
                "mount_target '{}' must be an absolute path",
                self.mount_target.display()
            ));
        }

        if self.image.trim().is_empty() && self.dockerfile.is_none() {
            result.add_error("image cannot be empty unless a dockerfile is given");
        }

        if self.shell.trim().is_empty() {
            result.add_error("shell cannot be empty");
        }

        if self.default_branch.trim().is_empty() {
            result.add_error("default_branch cannot be empty");
        }

        if self.container_cli.trim().is_empty() {
            result.add_error("container_cli cannot be empty");
        }

        if let Some(dockerfile) = &self.dockerfile {
            if !dockerfile.is_file() {
                result.add_warning(format!(
                    "dockerfile '{}' does not exist",
                    dockerfile.display()
                ));
            }
        }

        if self.cpus == Some(0) {
            result.add_error("cpus must be at least 1");
        }

        if self.start_timeout_secs == 0 {
            result.add_warning("start_timeout_secs = 0 skips waiting for the container to run");
        }

        result
    }
}
