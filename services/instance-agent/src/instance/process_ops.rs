//! Adapter for process-backed instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use strata_api::process::{ProcessResponse, ProcessSpec};
use strata_api::{
    BackendKind, InstanceCreateRequest, InstanceDeleteRequest, InstanceGetRequest,
    InstanceLogRequest, InstanceReplaceRequest, InstanceResponse, InstanceSpec, InstanceStatus,
    ProcessInstanceSpec,
};
use tonic::Status;
use tracing::debug;

use crate::backend::{hold_client, LogStream, ProcessManagerClient, ProcessManagerConnector, Scoped};
use crate::instance::{until_error, InstanceOps};

/// Serves instances through the process manager.
pub struct ProcessOps {
    connector: Arc<dyn ProcessManagerConnector>,
}

impl ProcessOps {
    pub fn new(connector: Arc<dyn ProcessManagerConnector>) -> Self {
        Self { connector }
    }

    async fn client(&self) -> Result<Scoped<dyn ProcessManagerClient>, Status> {
        let client = self.connector.connect().await.map_err(|e| {
            Status::internal(format!("failed to create process manager client: {e:#}"))
        })?;
        Ok(Scoped::new(client))
    }
}

fn process_spec(spec: &InstanceSpec) -> Result<ProcessSpec, Status> {
    let process = spec.process.as_ref().ok_or_else(|| {
        Status::invalid_argument(format!(
            "process spec is required for process-backed instance {}",
            spec.name
        ))
    })?;

    Ok(ProcessSpec {
        name: spec.name.clone(),
        binary: process.binary.clone(),
        args: process.args.clone(),
        port_count: spec.port_count,
        port_args: spec.port_args.clone(),
    })
}

/// Process responses leave the instance kind empty; the cluster manager
/// knows what it asked for.
pub(crate) fn process_to_instance(p: ProcessResponse) -> InstanceResponse {
    InstanceResponse {
        spec: InstanceSpec {
            name: p.spec.name,
            kind: String::new(),
            backend: BackendKind::Process,
            volume_name: String::new(),
            port_count: p.spec.port_count,
            port_args: p.spec.port_args,
            process: Some(ProcessInstanceSpec {
                binary: p.spec.binary,
                args: p.spec.args,
            }),
            spdk: None,
        },
        status: InstanceStatus {
            state: p.status.state.as_str().to_string(),
            error_msg: p.status.error_msg,
            port_start: p.status.port_start,
            port_end: p.status.port_end,
            conditions: p.status.conditions,
        },
        deleted: p.deleted,
    }
}

#[async_trait]
impl InstanceOps for ProcessOps {
    async fn create(&self, req: InstanceCreateRequest) -> Result<InstanceResponse, Status> {
        let spec = process_spec(&req.spec)?;
        let client = self.client().await?;
        Ok(process_to_instance(client.process_create(spec).await?))
    }

    async fn delete(&self, req: InstanceDeleteRequest) -> Result<InstanceResponse, Status> {
        let client = self.client().await?;
        Ok(process_to_instance(client.process_delete(&req.name).await?))
    }

    async fn get(&self, req: InstanceGetRequest) -> Result<InstanceResponse, Status> {
        let client = self.client().await?;
        Ok(process_to_instance(client.process_get(&req.name).await?))
    }

    async fn list(&self, instances: &mut HashMap<String, InstanceResponse>) -> Result<(), Status> {
        let client = self.client().await?;
        let processes = client.process_list().await?;
        debug!(count = processes.len(), "listed processes");

        for (name, process) in processes {
            instances.insert(name, process_to_instance(process));
        }
        Ok(())
    }

    async fn replace(&self, req: InstanceReplaceRequest) -> Result<InstanceResponse, Status> {
        let spec = process_spec(&req.spec)?;
        let client = self.client().await?;
        Ok(process_to_instance(
            client
                .process_replace(spec, &req.terminate_signal)
                .await?,
        ))
    }

    async fn log(&self, req: InstanceLogRequest) -> Result<LogStream, Status> {
        let client = self.client().await?;
        let lines = client.process_log(&req.name).await?;
        Ok(until_error(hold_client(lines, client)))
    }
}
