//! Wire enums: which backend implements a unit, what kind of unit it is, and
//! the lifecycle states of a process-backed unit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KindError;

// =============================================================================
// Backend Kind
// =============================================================================

/// Subsystem implementing a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Legacy backend: every unit is an OS process.
    Process,
    /// Next-generation backend: units live inside the SPDK service.
    Spdk,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Spdk => "spdk",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" | "v1" => Ok(BackendKind::Process),
            "spdk" | "v2" => Ok(BackendKind::Spdk),
            other => Err(KindError::UnknownBackend(other.to_string())),
        }
    }
}

/// Numeric wire encoding used by the cluster manager (`0` legacy, `1` SPDK).
impl TryFrom<i32> for BackendKind {
    type Error = KindError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BackendKind::Process),
            1 => Ok(BackendKind::Spdk),
            other => Err(KindError::UnknownBackend(other.to_string())),
        }
    }
}

// =============================================================================
// Instance Kind
// =============================================================================

/// Role of a unit within a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Engine,
    Replica,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Engine => "engine",
            InstanceKind::Replica => "replica",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engine" => Ok(InstanceKind::Engine),
            "replica" => Ok(InstanceKind::Replica),
            other => Err(KindError::UnknownInstance(other.to_string())),
        }
    }
}

// =============================================================================
// Process State
// =============================================================================

/// Lifecycle state of a process-backed unit.
///
/// `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Error => "error",
        }
    }

    /// Returns true for `Stopped` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Error)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ProcessState::Starting),
            "running" => Ok(ProcessState::Running),
            "stopping" => Ok(ProcessState::Stopping),
            "stopped" => Ok(ProcessState::Stopped),
            "error" => Ok(ProcessState::Error),
            other => Err(KindError::UnknownState(other.to_string())),
        }
    }
}
