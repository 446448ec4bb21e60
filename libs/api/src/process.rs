//! Types of the local process-management service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::kinds::ProcessState;

/// What to run and which ports it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub port_count: i32,
    /// Argument prefixes completed with an allocated port, one per port.
    #[serde(default)]
    pub port_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub port_start: i32,
    #[serde(default)]
    pub port_end: i32,
    #[serde(default)]
    pub conditions: HashMap<String, bool>,
}

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub spec: ProcessSpec,
    pub status: ProcessStatus,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReplaceRequest {
    pub spec: ProcessSpec,
    #[serde(default)]
    pub terminate_signal: String,
}
