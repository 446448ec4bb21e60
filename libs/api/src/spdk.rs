//! Types of the SPDK engine/replica service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Engines
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCreateRequest {
    pub name: String,
    pub volume_name: String,
    pub frontend: String,
    pub size: u64,
    #[serde(default)]
    pub replica_address_map: HashMap<String, String>,
    pub port_count: i32,
}

/// An engine as reported by the SPDK service. Engines expose a single port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engine {
    pub name: String,
    #[serde(default)]
    pub volume_name: String,
    #[serde(default)]
    pub frontend: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub replica_address_map: HashMap<String, String>,
    #[serde(default)]
    pub port: i32,
    pub state: String,
    #[serde(default)]
    pub error_msg: String,
}

// =============================================================================
// Replicas
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCreateRequest {
    pub name: String,
    pub disk_name: String,
    pub disk_uuid: String,
    pub size: u64,
    #[serde(default)]
    pub expose_required: bool,
    pub port_count: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub name: String,
    #[serde(default)]
    pub disk_name: String,
    #[serde(default)]
    pub disk_uuid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub port_start: i32,
    #[serde(default)]
    pub port_end: i32,
    pub state: String,
    #[serde(default)]
    pub error_msg: String,
}
