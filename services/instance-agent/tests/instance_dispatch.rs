//! Integration tests for the instance surface.
//!
//! Requests go through the dispatcher into the process manager or the mock
//! SPDK service, the same path a cluster manager request takes.

mod common;

use std::time::Duration;

use futures_util::StreamExt;
use nix::sys::signal::Signal;
use strata_api::spdk::Engine;
use strata_api::{BackendKind, InstanceReplaceRequest};
use tonic::Code;

use common::{
    delete, get, process_create, process_spec, replica_create, retry_while, wait_for_gone,
    wait_for_state, wait_until, AgentBuilder,
};
use strata_instance_agent::process::MockHealthChecker;

#[tokio::test]
async fn test_probe_failure_ends_in_error_and_deletes() {
    let agent = AgentBuilder::new()
        .health(MockHealthChecker::unhealthy(Duration::from_millis(20)))
        .build();

    let created = agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 1))
        .await
        .unwrap();
    assert_eq!(created.status.state, "starting");
    assert_eq!(created.status.port_start, 10000);
    assert_eq!(created.status.port_end, 10000);
    assert_eq!(created.spec.backend, BackendKind::Process);

    let failed = wait_for_state(&agent, "vol-a-e-0", "error").await;
    assert!(!failed.status.error_msg.is_empty());

    let cmd = agent.executor.last_command().unwrap();
    assert_eq!(cmd.signals(), vec![Signal::SIGINT]);
    assert_eq!(
        cmd.args(),
        &["controller", "vol-a-e-0", "--listen", "localhost:10000"]
    );

    let deleted = agent
        .dispatcher
        .instance_delete(delete("vol-a-e-0", "engine", BackendKind::Process, true))
        .await
        .unwrap();
    assert!(deleted.deleted);
    assert_eq!(deleted.status.state, "error");

    wait_for_gone(&agent, "vol-a-e-0").await;
}

#[tokio::test]
async fn test_delete_running_process() {
    let agent = AgentBuilder::new().build();

    agent
        .dispatcher
        .instance_create(process_create("vol-a-r-0", 1))
        .await
        .unwrap();
    wait_for_state(&agent, "vol-a-r-0", "running").await;

    let deleted = agent
        .dispatcher
        .instance_delete(delete("vol-a-r-0", "replica", BackendKind::Process, false))
        .await
        .unwrap();
    assert!(deleted.deleted);
    assert_ne!(deleted.status.state, "running");

    wait_for_gone(&agent, "vol-a-r-0").await;
    assert!(agent.executor.last_command().unwrap().exited());
}

#[tokio::test]
async fn test_ports_reused_after_delete() {
    let agent = AgentBuilder::new().port_range(10000, 10001).build();

    let first = agent
        .dispatcher
        .instance_create(process_create("vol-a-r-0", 2))
        .await
        .unwrap();
    assert_eq!((first.status.port_start, first.status.port_end), (10000, 10001));
    wait_for_state(&agent, "vol-a-r-0", "running").await;

    let err = agent
        .dispatcher
        .instance_create(process_create("vol-a-r-1", 2))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);

    agent
        .dispatcher
        .instance_delete(delete("vol-a-r-0", "replica", BackendKind::Process, false))
        .await
        .unwrap();

    let second = retry_while(Code::ResourceExhausted, || {
        agent
            .dispatcher
            .instance_create(process_create("vol-a-r-1", 2))
    })
    .await
    .unwrap();
    assert_eq!(second.status.port_start, 10000);
}

#[tokio::test]
async fn test_duplicate_create() {
    let agent = AgentBuilder::new().build();

    agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 0))
        .await
        .unwrap();
    let err = agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn test_replace_swaps_process() {
    let agent = AgentBuilder::new().build();

    agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 1))
        .await
        .unwrap();
    wait_for_state(&agent, "vol-a-e-0", "running").await;

    let replaced = agent
        .dispatcher
        .instance_replace(InstanceReplaceRequest {
            spec: process_spec("vol-a-e-0", 1, &["controller", "vol-a-e-0", "--upgraded"]),
            terminate_signal: "SIGHUP".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(replaced.status.state, "running");
    assert_eq!(replaced.status.port_start, 10001);

    let commands = agent.executor.commands();
    assert_eq!(commands.len(), 2);
    wait_until("old process to exit", || commands[0].exited()).await;
    assert_eq!(commands[0].signals(), vec![Signal::SIGHUP]);
    assert!(commands[1].args().contains(&"--upgraded".to_string()));
    assert!(commands[1].signals().is_empty());

    let current = agent
        .dispatcher
        .instance_get(get("vol-a-e-0", "engine", BackendKind::Process))
        .await
        .unwrap();
    assert_eq!(current.status.port_start, 10001);
    assert_eq!(current.status.state, "running");
}

#[tokio::test]
async fn test_replace_rejects_unknown_signal() {
    let agent = AgentBuilder::new().build();

    agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 0))
        .await
        .unwrap();
    wait_for_state(&agent, "vol-a-e-0", "running").await;

    let err = agent
        .dispatcher
        .instance_replace(InstanceReplaceRequest {
            spec: process_spec("vol-a-e-0", 0, &[]),
            terminate_signal: "SIGBOGUS".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(agent.executor.commands().len(), 1);
    assert!(agent.executor.commands()[0].signals().is_empty());
}

#[tokio::test]
async fn test_process_log_lines() {
    let agent = AgentBuilder::new().build();

    agent
        .dispatcher
        .instance_create(process_create("vol-a-r-0", 0))
        .await
        .unwrap();
    let path = agent.logs.path().join("vol-a-r-0.log");
    tokio::fs::write(&path, "replica starting\nreplica ready\n")
        .await
        .unwrap();

    let lines: Vec<String> = agent
        .dispatcher
        .instance_log(get("vol-a-r-0", "replica", BackendKind::Process))
        .await
        .unwrap()
        .map(|line| line.unwrap())
        .collect()
        .await;
    assert_eq!(lines, vec!["replica starting", "replica ready"]);

    let err = agent
        .dispatcher
        .instance_log(get("missing", "replica", BackendKind::Process))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_spdk_replica_create_then_get() {
    let agent = AgentBuilder::new().build();

    let created = agent
        .dispatcher
        .instance_create(replica_create("vol-b-r-0"))
        .await
        .unwrap();
    assert_eq!(created.spec.kind, "replica");
    assert_eq!(created.spec.backend, BackendKind::Spdk);
    assert_eq!(created.status.state, "running");

    let fetched = agent
        .dispatcher
        .instance_get(get("vol-b-r-0", "replica", BackendKind::Spdk))
        .await
        .unwrap();
    assert_eq!(fetched.status.port_start, created.status.port_start);
    assert_eq!(fetched.status.port_end, created.status.port_end);
    assert_eq!(agent.spdk.closed_clients(), agent.spdk.opened_clients());
}

#[tokio::test]
async fn test_engine_delete_without_cleanup_is_noop() {
    let agent = AgentBuilder::new().build();
    agent
        .spdk
        .seed_engine(Engine {
            name: "vol-b-e-0".into(),
            state: "running".into(),
            ..Default::default()
        })
        .await;

    let resp = agent
        .dispatcher
        .instance_delete(delete("vol-b-e-0", "engine", BackendKind::Spdk, false))
        .await
        .unwrap();
    assert!(resp.deleted);
    assert_eq!(resp.status.state, "stopped");
    assert!(agent.spdk.calls().await.is_empty());

    // the engine is still there
    agent
        .dispatcher
        .instance_get(get("vol-b-e-0", "engine", BackendKind::Spdk))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_skips_disabled_spdk() {
    let agent = AgentBuilder::new().spdk_disabled().build();
    agent
        .spdk
        .seed_engine(Engine {
            name: "vol-b-e-0".into(),
            ..Default::default()
        })
        .await;

    agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 0))
        .await
        .unwrap();

    let list = agent.dispatcher.instance_list().await.unwrap();
    assert_eq!(list.instances.len(), 1);
    assert!(list.instances.contains_key("vol-a-e-0"));
    assert_eq!(agent.spdk.opened_clients(), 0);
}

#[tokio::test]
async fn test_list_merges_backends() {
    let agent = AgentBuilder::new().build();
    agent
        .spdk
        .seed_engine(Engine {
            name: "shared".into(),
            state: "running".into(),
            ..Default::default()
        })
        .await;

    agent
        .dispatcher
        .instance_create(process_create("shared", 0))
        .await
        .unwrap();
    agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 0))
        .await
        .unwrap();
    agent
        .dispatcher
        .instance_create(replica_create("vol-b-r-0"))
        .await
        .unwrap();

    let list = agent.dispatcher.instance_list().await.unwrap();
    assert_eq!(list.instances.len(), 3);
    assert_eq!(list.instances["shared"].spec.backend, BackendKind::Spdk);
    assert_eq!(list.instances["vol-a-e-0"].spec.backend, BackendKind::Process);
    assert_eq!(list.instances["vol-b-r-0"].spec.kind, "replica");
}

#[tokio::test]
async fn test_backend_without_adapter_is_unimplemented() {
    let agent = AgentBuilder::new().without_spdk().build();

    let err = agent
        .dispatcher
        .instance_create(replica_create("vol-b-r-0"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    assert_eq!(err.message(), "unsupported backend kind spdk");

    let err = agent
        .dispatcher
        .instance_get(get("vol-b-r-0", "replica", BackendKind::Spdk))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    // process-backed instances are still served
    assert!(agent.dispatcher.instance_list().await.unwrap().instances.is_empty());
}

#[tokio::test]
async fn test_spdk_errors_pass_through() {
    let agent = AgentBuilder::new().build();

    let err = agent
        .dispatcher
        .instance_get(get("vol-b-e-9", "engine", BackendKind::Spdk))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    agent.spdk.fail_connect(true);
    let err = agent
        .dispatcher
        .instance_create(replica_create("vol-b-r-0"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn test_version_get() {
    let agent = AgentBuilder::new().build();
    let version = agent.dispatcher.version_get();

    assert_eq!(version.api_version, 4);
    assert_eq!(version.api_min_version, 1);
    assert!(!version.version.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_processes() {
    let agent = AgentBuilder::new().build();

    agent
        .dispatcher
        .instance_create(process_create("vol-a-e-0", 1))
        .await
        .unwrap();
    wait_for_state(&agent, "vol-a-e-0", "running").await;

    agent.manager.shutdown().await;

    let resp = agent
        .dispatcher
        .instance_get(get("vol-a-e-0", "engine", BackendKind::Process))
        .await
        .unwrap();
    assert_eq!(resp.status.state, "error");
    assert!(agent.executor.last_command().unwrap().exited());
}
