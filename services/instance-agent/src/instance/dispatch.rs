//! Routes instance requests to the adapter for their backend kind.

use std::collections::HashMap;
use std::sync::Arc;

use strata_api::{
    BackendKind, InstanceCreateRequest, InstanceDeleteRequest, InstanceGetRequest,
    InstanceListResponse, InstanceLogRequest, InstanceReplaceRequest, InstanceResponse,
    KindError, VersionResponse,
};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info};

use crate::backend::{LogStream, NotifyStream, ProcessManagerConnector, SpdkConnector};
use crate::instance::watch::{watch_instances, WatchConfig};
use crate::instance::{InstanceOps, ProcessOps, SpdkOps};
use crate::version::version_info;

/// Parse a wire backend kind. Unknown kinds are `unimplemented`.
pub fn parse_backend_kind(raw: &str) -> Result<BackendKind, Status> {
    raw.parse().map_err(unsupported)
}

/// Same as [`parse_backend_kind`] for the numeric encoding.
pub fn backend_kind_from_i32(raw: i32) -> Result<BackendKind, Status> {
    BackendKind::try_from(raw).map_err(unsupported)
}

fn unsupported(e: KindError) -> Status {
    Status::unimplemented(e.to_string())
}

/// Front door of the agent.
///
/// The adapter table is fixed at construction. A backend with no adapter
/// answers every request with `unimplemented`.
pub struct InstanceDispatcher {
    ops: HashMap<BackendKind, Arc<dyn InstanceOps>>,
    process: Arc<dyn ProcessManagerConnector>,
    spdk: Option<Arc<dyn SpdkConnector>>,
    spdk_enabled: bool,
    shutdown: CancellationToken,
    watch_config: WatchConfig,
}

impl InstanceDispatcher {
    /// Build the dispatcher. Without an SPDK connector only process-backed
    /// instances are served. `spdk_enabled` controls whether list and watch
    /// include the SPDK backend.
    pub fn new(
        process: Arc<dyn ProcessManagerConnector>,
        spdk: Option<Arc<dyn SpdkConnector>>,
        spdk_enabled: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let mut ops: HashMap<BackendKind, Arc<dyn InstanceOps>> = HashMap::new();
        ops.insert(
            BackendKind::Process,
            Arc::new(ProcessOps::new(Arc::clone(&process))),
        );
        if let Some(connector) = &spdk {
            ops.insert(BackendKind::Spdk, Arc::new(SpdkOps::new(Arc::clone(connector))));
        }

        Self {
            ops,
            process,
            spdk,
            spdk_enabled,
            shutdown,
            watch_config: WatchConfig::default(),
        }
    }

    pub fn with_watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    fn ops(&self, backend: BackendKind) -> Result<&Arc<dyn InstanceOps>, Status> {
        self.ops
            .get(&backend)
            .ok_or_else(|| Status::unimplemented(format!("unsupported backend kind {backend}")))
    }

    fn spdk_listed(&self) -> bool {
        self.spdk_enabled && self.ops.contains_key(&BackendKind::Spdk)
    }

    pub async fn instance_create(
        &self,
        req: InstanceCreateRequest,
    ) -> Result<InstanceResponse, Status> {
        info!(
            name = %req.spec.name,
            instance_type = %req.spec.kind,
            backend = %req.spec.backend,
            "creating instance"
        );
        self.ops(req.spec.backend)?.create(req).await
    }

    pub async fn instance_delete(
        &self,
        req: InstanceDeleteRequest,
    ) -> Result<InstanceResponse, Status> {
        info!(
            name = %req.name,
            instance_type = %req.kind,
            backend = %req.backend,
            disk_uuid = %req.disk_uuid,
            cleanup_required = req.cleanup_required,
            "deleting instance"
        );
        self.ops(req.backend)?.delete(req).await
    }

    pub async fn instance_get(&self, req: InstanceGetRequest) -> Result<InstanceResponse, Status> {
        debug!(
            name = %req.name,
            instance_type = %req.kind,
            backend = %req.backend,
            "getting instance"
        );
        self.ops(req.backend)?.get(req).await
    }

    /// Instances of every listed backend, keyed by name. Process instances
    /// go in first, so an SPDK instance with the same name wins.
    pub async fn instance_list(&self) -> Result<InstanceListResponse, Status> {
        let mut instances = HashMap::new();

        self.ops(BackendKind::Process)?.list(&mut instances).await?;
        if self.spdk_listed() {
            self.ops(BackendKind::Spdk)?.list(&mut instances).await?;
        }

        debug!(count = instances.len(), "listed instances");
        Ok(InstanceListResponse { instances })
    }

    pub async fn instance_replace(
        &self,
        req: InstanceReplaceRequest,
    ) -> Result<InstanceResponse, Status> {
        info!(
            name = %req.spec.name,
            instance_type = %req.spec.kind,
            backend = %req.spec.backend,
            terminate_signal = %req.terminate_signal,
            "replacing instance"
        );
        self.ops(req.spec.backend)?.replace(req).await
    }

    pub async fn instance_log(&self, req: InstanceLogRequest) -> Result<LogStream, Status> {
        info!(
            name = %req.name,
            instance_type = %req.kind,
            backend = %req.backend,
            "streaming instance log"
        );
        self.ops(req.backend)?.log(req).await
    }

    /// One empty notification per change on any watched backend. The stream
    /// ends with an error once a backend keeps failing, and with `cancelled`
    /// when the agent shuts down.
    pub async fn instance_watch(&self) -> Result<NotifyStream, Status> {
        let spdk = if self.spdk_listed() {
            self.spdk.as_deref()
        } else {
            None
        };
        watch_instances(self.process.as_ref(), spdk, &self.shutdown, self.watch_config).await
    }

    pub fn version_get(&self) -> VersionResponse {
        version_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tonic::Code;

    #[rstest]
    #[case("process", BackendKind::Process)]
    #[case("v1", BackendKind::Process)]
    #[case("spdk", BackendKind::Spdk)]
    #[case("v2", BackendKind::Spdk)]
    fn test_parse_backend_kind(#[case] raw: &str, #[case] expected: BackendKind) {
        assert_eq!(parse_backend_kind(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("v3")]
    #[case("")]
    fn test_unknown_backend_is_unimplemented(#[case] raw: &str) {
        let err = parse_backend_kind(raw).unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[test]
    fn test_numeric_backend_kind() {
        assert_eq!(backend_kind_from_i32(1).unwrap(), BackendKind::Spdk);
        assert_eq!(backend_kind_from_i32(7).unwrap_err().code(), Code::Unimplemented);
    }
}
