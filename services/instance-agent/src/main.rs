//! strata Instance Agent
//!
//! Supervises the engine and replica instances of strata volumes on this
//! node. Process-backed instances are run by the embedded process manager;
//! SPDK-backed instances are delegated to the SPDK service.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strata_instance_agent::backend::{
    HttpSpdkConnector, LocalProcessManagerConnector, ProcessManagerConnector, SpdkConnector,
};
use strata_instance_agent::config::Config;
use strata_instance_agent::instance::InstanceDispatcher;
use strata_instance_agent::process::manager::ManagerConfig;
use strata_instance_agent::process::{
    BinaryExecutor, ProcessManager, ProcessTiming, TcpHealthChecker,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level can seed the filter
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting strata instance agent");
    info!(
        logs_dir = %config.logs_dir.display(),
        port_range = %config.port_range,
        spdk_url = %config.spdk_url,
        spdk_enabled = config.spdk_enabled,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    let timing = ProcessTiming::default();
    let manager = ProcessManager::new(
        ManagerConfig {
            logs_dir: config.logs_dir.clone(),
            port_range: config.port_range,
            timing,
        },
        Arc::new(BinaryExecutor::new()),
        Arc::new(TcpHealthChecker::from_timing(&timing)),
    );

    let process: Arc<dyn ProcessManagerConnector> =
        Arc::new(LocalProcessManagerConnector::new(Arc::clone(&manager)));
    let spdk: Arc<dyn SpdkConnector> = Arc::new(HttpSpdkConnector::new(config.spdk_url.clone()));

    let dispatcher = InstanceDispatcher::new(process, Some(spdk), config.spdk_enabled, shutdown.clone());
    let version = dispatcher.version_get();
    info!(
        version = %version.version,
        git_commit = %version.git_commit,
        api_version = version.api_version,
        api_min_version = version.api_min_version,
        "Instance dispatcher ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Ends open watch sessions before the processes go down
    shutdown.cancel();
    manager.shutdown().await;

    info!("Instance agent shutdown complete");
    Ok(())
}
