//! Sandbox lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a sandbox is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxState {
    /// No clone exists yet.
    #[default]
    Unregistered,
    /// Clone and remotes exist, no container.
    Cloned,
    /// Container exists but has not been started.
    ContainerCreated,
    /// Container is running.
    Running,
    /// An interactive session is attached to the running container.
    Attached,
    /// Container is stopped; clone and remotes are intact.
    Stopped,
    /// Container, clone and remotes are gone.
    Removed,
}

impl SandboxState {
    /// Returns whether moving to `next` is allowed.
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Unregistered, Cloned)
                | (Cloned, ContainerCreated)
                | (ContainerCreated, Running)
                | (Running, Attached)
                | (Attached, Running)
                | (Running, Stopped)
                | (ContainerCreated, Stopped)
                // restart of a previously stopped container on attach
                | (Stopped, Running)
                | (Stopped, Removed)
                | (Cloned, Removed)
        )
    }

    /// Returns `next` if the transition is allowed.
    pub fn transition(self, next: SandboxState) -> Result<SandboxState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Returns whether a container is up.
    pub fn is_running(self) -> bool {
        matches!(self, SandboxState::Running | SandboxState::Attached)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Unregistered => "unregistered",
            SandboxState::Cloned => "cloned",
            SandboxState::ContainerCreated => "container-created",
            SandboxState::Running => "running",
            SandboxState::Attached => "attached",
            SandboxState::Stopped => "stopped",
            SandboxState::Removed => "removed",
        };
        f.write_str(name)
    }
}
