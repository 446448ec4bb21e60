//! In-process client for the process manager.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use strata_api::process::{ProcessResponse, ProcessSpec};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::backend::{
    close_aware, BackendClient, LogStream, NotifyStream, ProcessManagerClient,
    ProcessManagerConnector,
};
use crate::process::ProcessManager;

/// Talks to a [`ProcessManager`] living in the same agent.
pub struct LocalProcessManagerClient {
    manager: Arc<ProcessManager>,
    closed: CancellationToken,
}

impl LocalProcessManagerClient {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        Self {
            manager,
            closed: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            return Err(Status::cancelled("process manager client is closed"));
        }
        Ok(())
    }
}

impl BackendClient for LocalProcessManagerClient {
    fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl ProcessManagerClient for LocalProcessManagerClient {
    async fn process_create(&self, spec: ProcessSpec) -> Result<ProcessResponse, Status> {
        self.ensure_open()?;
        Ok(self.manager.create(spec).await?)
    }

    async fn process_delete(&self, name: &str) -> Result<ProcessResponse, Status> {
        self.ensure_open()?;
        Ok(self.manager.delete(name).await?)
    }

    async fn process_get(&self, name: &str) -> Result<ProcessResponse, Status> {
        self.ensure_open()?;
        Ok(self.manager.get(name).await?)
    }

    async fn process_list(&self) -> Result<HashMap<String, ProcessResponse>, Status> {
        self.ensure_open()?;
        Ok(self.manager.list().await)
    }

    async fn process_replace(
        &self,
        spec: ProcessSpec,
        terminate_signal: &str,
    ) -> Result<ProcessResponse, Status> {
        self.ensure_open()?;
        Ok(self.manager.replace(spec, terminate_signal).await?)
    }

    async fn process_log(&self, name: &str) -> Result<LogStream, Status> {
        self.ensure_open()?;
        let lines = self.manager.log(name).await?;
        Ok(close_aware(lines, self.closed.clone()))
    }

    async fn process_watch(&self) -> Result<NotifyStream, Status> {
        self.ensure_open()?;
        Ok(close_aware(self.manager.watch(), self.closed.clone()))
    }
}

/// Opens [`LocalProcessManagerClient`]s over one shared manager.
#[derive(Clone)]
pub struct LocalProcessManagerConnector {
    manager: Arc<ProcessManager>,
}

impl LocalProcessManagerConnector {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ProcessManagerConnector for LocalProcessManagerConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ProcessManagerClient>> {
        Ok(Arc::new(LocalProcessManagerClient::new(Arc::clone(
            &self.manager,
        ))))
    }
}
