//! Test harness for instance agent integration tests.
//!
//! Wires a dispatcher over a real process manager (with a mock executor and
//! health checker) and a mock SPDK service.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use strata_api::{
    BackendKind, InstanceCreateRequest, InstanceDeleteRequest, InstanceGetRequest, InstanceKind,
    InstanceResponse, InstanceSpec, ProcessInstanceSpec, SpdkInstanceSpec,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use strata_instance_agent::backend::{
    LocalProcessManagerConnector, MockSpdkService, ProcessManagerConnector, SpdkConnector,
};
use strata_instance_agent::instance::{InstanceDispatcher, WatchConfig};
use strata_instance_agent::process::manager::ManagerConfig;
use strata_instance_agent::process::{
    MockExecutor, MockHealthChecker, PortRange, ProcessManager, ProcessTiming,
};

/// Poll interval of the `wait_*` helpers.
const POLL: Duration = Duration::from_millis(5);

/// Polls before a `wait_*` helper gives up.
const POLL_ATTEMPTS: usize = 400;

pub struct Agent {
    pub dispatcher: InstanceDispatcher,
    pub manager: Arc<ProcessManager>,
    pub executor: Arc<MockExecutor>,
    pub spdk: MockSpdkService,
    pub shutdown: CancellationToken,
    pub logs: TempDir,
}

pub struct AgentBuilder {
    executor: MockExecutor,
    health: MockHealthChecker,
    spdk: bool,
    spdk_enabled: bool,
    port_range: PortRange,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            executor: MockExecutor::new(),
            health: MockHealthChecker::healthy(Duration::from_millis(10)),
            spdk: true,
            spdk_enabled: true,
            port_range: PortRange::new(10000, 10009),
        }
    }

    pub fn executor(mut self, executor: MockExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn health(mut self, health: MockHealthChecker) -> Self {
        self.health = health;
        self
    }

    /// Keep the SPDK adapter but leave SPDK out of list and watch.
    pub fn spdk_disabled(mut self) -> Self {
        self.spdk_enabled = false;
        self
    }

    /// Build the dispatcher without an SPDK adapter at all.
    pub fn without_spdk(mut self) -> Self {
        self.spdk = false;
        self
    }

    pub fn port_range(mut self, start: i32, end: i32) -> Self {
        self.port_range = PortRange::new(start, end);
        self
    }

    pub fn build(self) -> Agent {
        let logs = tempfile::tempdir().expect("create log dir");
        let executor = Arc::new(self.executor);
        let manager = ProcessManager::new(
            ManagerConfig {
                logs_dir: logs.path().to_path_buf(),
                port_range: self.port_range,
                timing: ProcessTiming::fast(),
            },
            executor.clone(),
            Arc::new(self.health),
        );

        let spdk = MockSpdkService::new();
        let process: Arc<dyn ProcessManagerConnector> =
            Arc::new(LocalProcessManagerConnector::new(Arc::clone(&manager)));
        let spdk_connector: Option<Arc<dyn SpdkConnector>> = if self.spdk {
            Some(Arc::new(spdk.clone()))
        } else {
            None
        };

        let shutdown = CancellationToken::new();
        let dispatcher =
            InstanceDispatcher::new(process, spdk_connector, self.spdk_enabled, shutdown.clone())
                .with_watch_config(fast_watch());

        Agent {
            dispatcher,
            manager,
            executor,
            spdk,
            shutdown,
            logs,
        }
    }
}

pub fn fast_watch() -> WatchConfig {
    WatchConfig {
        retry_interval: Duration::from_millis(1),
        max_failures: 10,
        buffer: 1024,
    }
}

// =============================================================================
// Requests
// =============================================================================

pub fn process_create(name: &str, port_count: i32) -> InstanceCreateRequest {
    InstanceCreateRequest {
        spec: process_spec(name, port_count, &["controller", name]),
    }
}

pub fn process_spec(name: &str, port_count: i32, args: &[&str]) -> InstanceSpec {
    let mut spec = InstanceSpec::named(name, BackendKind::Process).with_kind(InstanceKind::Engine);
    spec.port_count = port_count;
    if port_count > 0 {
        spec.port_args = vec!["--listen,localhost:".to_string()];
    }
    spec.process = Some(ProcessInstanceSpec {
        binary: "/usr/local/bin/strata-engine".to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    });
    spec
}

pub fn replica_create(name: &str) -> InstanceCreateRequest {
    let mut spec = InstanceSpec::named(name, BackendKind::Spdk).with_kind(InstanceKind::Replica);
    spec.port_count = 1;
    spec.spdk = Some(SpdkInstanceSpec {
        disk_name: "nvme-disk-1".to_string(),
        disk_uuid: "6c7b1d1e-0000-4000-8000-000000000001".to_string(),
        size: 10 << 30,
        ..Default::default()
    });
    InstanceCreateRequest { spec }
}

pub fn get(name: &str, kind: &str, backend: BackendKind) -> InstanceGetRequest {
    InstanceGetRequest {
        name: name.to_string(),
        kind: kind.to_string(),
        backend,
    }
}

pub fn delete(
    name: &str,
    kind: &str,
    backend: BackendKind,
    cleanup_required: bool,
) -> InstanceDeleteRequest {
    InstanceDeleteRequest {
        name: name.to_string(),
        kind: kind.to_string(),
        backend,
        disk_uuid: String::new(),
        cleanup_required,
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Wait until the process-backed instance reports `state`.
pub async fn wait_for_state(agent: &Agent, name: &str, state: &str) -> InstanceResponse {
    let mut last = None;
    for _ in 0..POLL_ATTEMPTS {
        let resp = agent
            .dispatcher
            .instance_get(get(name, "engine", BackendKind::Process))
            .await
            .expect("instance exists");
        if resp.status.state == state {
            return resp;
        }
        last = Some(resp.status.state);
        tokio::time::sleep(POLL).await;
    }
    panic!("instance {name} never reached {state}, last state {last:?}");
}

/// Wait until the process-backed instance has left the registry.
pub async fn wait_for_gone(agent: &Agent, name: &str) {
    for _ in 0..POLL_ATTEMPTS {
        let result = agent
            .dispatcher
            .instance_get(get(name, "engine", BackendKind::Process))
            .await;
        if let Err(status) = result {
            assert_eq!(status.code(), Code::NotFound);
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("instance {name} is still registered");
}

/// Retry `op` while it fails with `code`.
pub async fn retry_while<T, F, Fut>(code: Code, mut op: F) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Status>>,
{
    for _ in 0..POLL_ATTEMPTS {
        match op().await {
            Err(status) if status.code() == code => tokio::time::sleep(POLL).await,
            other => return other,
        }
    }
    op().await
}

/// Wait until `cond` holds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..POLL_ATTEMPTS {
        if cond() {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("timed out waiting for {what}");
}
