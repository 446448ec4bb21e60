//! The uniform instance surface exposed to the cluster manager.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::kinds::{BackendKind, InstanceKind, ProcessState};

// =============================================================================
// Specs
// =============================================================================

/// Binary and arguments of a process-backed unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstanceSpec {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Backend-specific spec of an SPDK engine or replica.
///
/// Engines use `frontend`, `size` and `replica_address_map`; replicas use
/// `disk_name`, `disk_uuid`, `size` and `expose_required`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpdkInstanceSpec {
    #[serde(default)]
    pub replica_address_map: HashMap<String, String>,
    #[serde(default)]
    pub disk_name: String,
    #[serde(default)]
    pub disk_uuid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub expose_required: bool,
    #[serde(default)]
    pub frontend: String,
}

/// Spec of a unit.
///
/// `kind` is the raw wire string (`engine`, `replica`, or empty when the
/// backend does not know it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub volume_name: String,
    #[serde(default)]
    pub port_count: i32,
    #[serde(default)]
    pub port_args: Vec<String>,
    #[serde(default)]
    pub process: Option<ProcessInstanceSpec>,
    #[serde(default)]
    pub spdk: Option<SpdkInstanceSpec>,
}

impl InstanceSpec {
    /// Minimal spec carrying only a name and backend.
    pub fn named(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            backend,
            volume_name: String::new(),
            port_count: 0,
            port_args: Vec::new(),
            process: None,
            spdk: None,
        }
    }

    /// Set the instance kind.
    pub fn with_kind(mut self, kind: InstanceKind) -> Self {
        self.kind = kind.as_str().to_string();
        self
    }
}

// =============================================================================
// Status / Response
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: String,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub port_start: i32,
    #[serde(default)]
    pub port_end: i32,
    #[serde(default)]
    pub conditions: HashMap<String, bool>,
}

/// A unit as reported to the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceResponse {
    pub spec: InstanceSpec,
    pub status: InstanceStatus,
    #[serde(default)]
    pub deleted: bool,
}

impl InstanceResponse {
    /// Terminal response for a unit whose backend deletion returns no body.
    pub fn deleted(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            spec: InstanceSpec::named(name, backend),
            status: InstanceStatus {
                state: ProcessState::Stopped.as_str().to_string(),
                ..Default::default()
            },
            deleted: true,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCreateRequest {
    pub spec: InstanceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDeleteRequest {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub disk_uuid: String,
    #[serde(default)]
    pub cleanup_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGetRequest {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReplaceRequest {
    pub spec: InstanceSpec,
    /// Signal name (`SIGTERM`, `SIGHUP`, ...) sent to the replaced process.
    #[serde(default)]
    pub terminate_signal: String,
}

/// Same addressing fields as a get.
pub type InstanceLogRequest = InstanceGetRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceListResponse {
    pub instances: HashMap<String, InstanceResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_commit: String,
    pub build_date: String,
    pub api_version: i64,
    pub api_min_version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_response() {
        let resp = InstanceResponse::deleted("vol-a-r-0", BackendKind::Spdk);
        assert!(resp.deleted);
        assert_eq!(resp.spec.name, "vol-a-r-0");
        assert_eq!(resp.status.state, "stopped");
        assert!(resp.status.conditions.is_empty());
    }

    #[test]
    fn test_create_request_json_shape() {
        let json = r#"{
            "spec": {
                "name": "vol-a-r-0",
                "type": "replica",
                "backend": "spdk",
                "port_count": 1,
                "spdk": {"disk_name": "disk-1", "disk_uuid": "uuid-1", "size": 1024}
            }
        }"#;

        let req: InstanceCreateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.spec.kind, "replica");
        assert_eq!(req.spec.backend, BackendKind::Spdk);
        assert!(req.spec.process.is_none());
        let spdk = req.spec.spdk.unwrap();
        assert_eq!(spdk.disk_uuid, "uuid-1");
        assert!(!spdk.expose_required);
    }
}
