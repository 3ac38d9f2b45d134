//! Domain primitive types used across the Capstan workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container.
///
/// Legal transitions are linear with one loop:
/// `Creating → Created → Running ⇄ Paused`, and any live state may reach
/// `Stopped` when the init process exits. The lifecycle manager enforces
/// the transitions; this enum only names the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// The bootstrap handshake is in progress.
    Creating,
    /// Bootstrap finished; the workload has not been exec'd yet.
    Created,
    /// The workload process is running.
    Running,
    /// The container's cgroup is frozen.
    Paused,
    /// The init process has exited.
    Stopped,
}

impl ContainerStatus {
    /// Whether a process is expected to exist for this state.
    ///
    /// A record is persisted only after its init process has been spawned,
    /// so every state short of `Stopped` names a process that at least
    /// existed. `Creating` is live: a record abandoned mid-bootstrap must
    /// still reconcile against the kernel like any other.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Creating | Self::Created | Self::Running | Self::Paused)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How an init process ended, as observed by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when the process was killed.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// An exit via `exit(code)`.
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// An exit caused by a signal.
    #[must_use]
    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited({code})"),
            (None, Some(signal)) => write!(f, "signaled({signal})"),
            (None, None) => write!(f, "unknown"),
        }
    }
}
