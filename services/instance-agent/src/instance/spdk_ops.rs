//! Adapter for SPDK-backed instances.
//!
//! Engines and replicas live in the SPDK service. Replace and log are not
//! supported for this backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use strata_api::spdk::{Engine, EngineCreateRequest, Replica, ReplicaCreateRequest};
use strata_api::{
    BackendKind, InstanceCreateRequest, InstanceDeleteRequest, InstanceGetRequest, InstanceKind,
    InstanceLogRequest, InstanceReplaceRequest, InstanceResponse, InstanceSpec, InstanceStatus,
    SpdkInstanceSpec,
};
use tonic::Status;
use tracing::{debug, info};

use crate::backend::{LogStream, Scoped, SpdkClient, SpdkConnector};
use crate::instance::InstanceOps;

/// Serves instances through the SPDK service.
pub struct SpdkOps {
    connector: Arc<dyn SpdkConnector>,
}

impl SpdkOps {
    pub fn new(connector: Arc<dyn SpdkConnector>) -> Self {
        Self { connector }
    }

    async fn client(&self) -> Result<Scoped<dyn SpdkClient>, Status> {
        let client = self
            .connector
            .connect()
            .await
            .map_err(|e| Status::internal(format!("failed to create SPDK client: {e:#}")))?;
        Ok(Scoped::new(client))
    }
}

fn instance_kind(raw: &str) -> Result<InstanceKind, Status> {
    raw.parse()
        .map_err(|e: strata_api::KindError| Status::invalid_argument(e.to_string()))
}

fn spdk_spec(spec: &InstanceSpec) -> Result<&SpdkInstanceSpec, Status> {
    spec.spdk.as_ref().ok_or_else(|| {
        Status::invalid_argument(format!(
            "SPDK spec is required for SPDK-backed instance {}",
            spec.name
        ))
    })
}

pub(crate) fn engine_to_instance(e: Engine) -> InstanceResponse {
    InstanceResponse {
        spec: InstanceSpec::named(e.name, BackendKind::Spdk).with_kind(InstanceKind::Engine),
        status: InstanceStatus {
            state: e.state,
            error_msg: e.error_msg,
            port_start: e.port,
            port_end: e.port,
            conditions: HashMap::new(),
        },
        deleted: false,
    }
}

pub(crate) fn replica_to_instance(r: Replica) -> InstanceResponse {
    InstanceResponse {
        spec: InstanceSpec::named(r.name, BackendKind::Spdk).with_kind(InstanceKind::Replica),
        status: InstanceStatus {
            state: r.state,
            error_msg: r.error_msg,
            port_start: r.port_start,
            port_end: r.port_end,
            conditions: HashMap::new(),
        },
        deleted: false,
    }
}

#[async_trait]
impl InstanceOps for SpdkOps {
    async fn create(&self, req: InstanceCreateRequest) -> Result<InstanceResponse, Status> {
        let kind = instance_kind(&req.spec.kind)?;
        let spdk = spdk_spec(&req.spec)?;
        let client = self.client().await?;

        match kind {
            InstanceKind::Engine => {
                let engine = client
                    .engine_create(EngineCreateRequest {
                        name: req.spec.name.clone(),
                        volume_name: req.spec.volume_name.clone(),
                        frontend: spdk.frontend.clone(),
                        size: spdk.size,
                        replica_address_map: spdk.replica_address_map.clone(),
                        port_count: req.spec.port_count,
                    })
                    .await?;
                Ok(engine_to_instance(engine))
            }
            InstanceKind::Replica => {
                let replica = client
                    .replica_create(ReplicaCreateRequest {
                        name: req.spec.name.clone(),
                        disk_name: spdk.disk_name.clone(),
                        disk_uuid: spdk.disk_uuid.clone(),
                        size: spdk.size,
                        expose_required: spdk.expose_required,
                        port_count: req.spec.port_count,
                    })
                    .await?;
                Ok(replica_to_instance(replica))
            }
        }
    }

    async fn delete(&self, req: InstanceDeleteRequest) -> Result<InstanceResponse, Status> {
        let kind = instance_kind(&req.kind)?;

        match kind {
            InstanceKind::Engine if req.cleanup_required => {
                self.client().await?.engine_delete(&req.name).await?;
            }
            InstanceKind::Engine => {
                info!(name = %req.name, "skipping engine delete without cleanup");
            }
            InstanceKind::Replica => {
                self.client()
                    .await?
                    .replica_delete(&req.name, req.cleanup_required)
                    .await?;
            }
        }

        Ok(InstanceResponse::deleted(req.name, BackendKind::Spdk))
    }

    async fn get(&self, req: InstanceGetRequest) -> Result<InstanceResponse, Status> {
        let kind = instance_kind(&req.kind)?;
        let client = self.client().await?;

        match kind {
            InstanceKind::Engine => Ok(engine_to_instance(client.engine_get(&req.name).await?)),
            InstanceKind::Replica => Ok(replica_to_instance(client.replica_get(&req.name).await?)),
        }
    }

    async fn list(&self, instances: &mut HashMap<String, InstanceResponse>) -> Result<(), Status> {
        let client = self.client().await?;

        let replicas = client.replica_list().await?;
        debug!(count = replicas.len(), "listed SPDK replicas");
        for replica in replicas.into_values() {
            instances.insert(replica.name.clone(), replica_to_instance(replica));
        }

        let engines = client.engine_list().await?;
        debug!(count = engines.len(), "listed SPDK engines");
        for engine in engines.into_values() {
            instances.insert(engine.name.clone(), engine_to_instance(engine));
        }
        Ok(())
    }

    async fn replace(&self, _req: InstanceReplaceRequest) -> Result<InstanceResponse, Status> {
        Err(Status::unimplemented("SPDK-backed instance replace is not supported"))
    }

    async fn log(&self, _req: InstanceLogRequest) -> Result<LogStream, Status> {
        Err(Status::unimplemented("SPDK-backed instance log is not supported"))
    }
}
