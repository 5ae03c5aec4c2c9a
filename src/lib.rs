//! Sandcastle - copy-on-write container sandboxes for a working directory
//!
//! This library clones a host directory into an isolated copy-on-write tree,
//! runs a container over that tree, and bridges the clone back to the host
//! repository with plain git remotes so changes made in the sandbox can be
//! inspected and diffed from the host.

pub mod backoff;
pub mod config;
pub mod container;
pub mod error;
pub mod git;
pub mod sandbox;

pub use config::{SandConfig, Validate, ValidationResult};
pub use container::{
    CliRuntime, ContainerHandle, ContainerRuntime, ContainerSnapshot, ContainerSpec,
    ContainerStatus, ExecSpec, LogOptions, LogStream, Mount, ProcessHandle, Resources, StreamMode,
    WaitOutcome,
};
pub use error::{Error, Result};
pub use git::{GitCompare, RemoteDirection, RemoteLink, RemotePair};
pub use sandbox::{
    CloneManager, ClonePrimitive, CloneRecord, ReflinkClone, Registry, Sandbox, SandboxId,
    SandboxState,
};
