//! Instance watch: many backend streams in, one notification stream out.
//!
//! A watch session runs one receive loop per backend stream (process, and
//! SPDK engine plus SPDK replica when that backend is enabled) and one
//! forwarding loop. All loops share a cancellation scope derived from the
//! agent's shutdown token and form a fail-fast group: the first loop to fail
//! cancels the rest, and its error becomes the last item of the client
//! stream. When the forwarding loop exits, every backend client of the
//! session is closed, which unblocks any receive still waiting on a stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{error, info, warn};

use crate::backend::{
    NotifyStream, ProcessManagerClient, ProcessManagerConnector, SpdkClient, SpdkConnector,
};

/// Buffer between the forwarding loop and the client.
const OUTBOUND_BUFFER: usize = 16;

/// Retry and buffering policy of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Pause after a failed receive before receiving again.
    pub retry_interval: Duration,
    /// Consecutive failed receives that end the session.
    pub max_failures: u32,
    /// Capacity of the shared token channel.
    pub buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            max_failures: 10,
            buffer: 1024,
        }
    }
}

// =============================================================================
// Session clients
// =============================================================================

/// Backend clients opened for one watch session.
pub struct WatchClients {
    process: Option<Arc<dyn ProcessManagerClient>>,
    spdk: Option<Arc<dyn SpdkClient>>,
}

impl WatchClients {
    pub fn new(
        process: Option<Arc<dyn ProcessManagerClient>>,
        spdk: Option<Arc<dyn SpdkClient>>,
    ) -> Self {
        Self { process, spdk }
    }

    /// Close every client present.
    pub fn close_all(&self) {
        if let Some(client) = &self.process {
            client.close();
        }
        if let Some(client) = &self.spdk {
            client.close();
        }
    }

    async fn open(&self, source: WatchSource) -> Result<NotifyStream, Status> {
        let missing = || Status::internal(format!("no client for {} watch", source.as_str()));
        match source {
            WatchSource::Process => self.process.as_ref().ok_or_else(missing)?.process_watch().await,
            WatchSource::SpdkEngine => self.spdk.as_ref().ok_or_else(missing)?.engine_watch().await,
            WatchSource::SpdkReplica => self.spdk.as_ref().ok_or_else(missing)?.replica_watch().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchSource {
    Process,
    SpdkEngine,
    SpdkReplica,
}

impl WatchSource {
    fn as_str(&self) -> &'static str {
        match self {
            WatchSource::Process => "processes",
            WatchSource::SpdkEngine => "SPDK engines",
            WatchSource::SpdkReplica => "SPDK replicas",
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Start a watch session.
///
/// Fails with `internal` when a backend client cannot be opened; clients
/// opened before the failure are closed.
pub async fn watch_instances(
    process: &dyn ProcessManagerConnector,
    spdk: Option<&dyn SpdkConnector>,
    shutdown: &CancellationToken,
    config: WatchConfig,
) -> Result<NotifyStream, Status> {
    info!("start watching instances");

    let process_client = process.connect().await.map_err(|e| {
        Status::internal(format!("failed to create process manager client: {e:#}"))
    })?;

    let spdk_client = match spdk {
        Some(connector) => match connector.connect().await {
            Ok(client) => Some(client),
            Err(e) => {
                process_client.close();
                return Err(Status::internal(format!(
                    "failed to create SPDK client: {e:#}"
                )));
            }
        },
        None => None,
    };

    let mut sources = vec![WatchSource::Process];
    if spdk_client.is_some() {
        sources.extend([WatchSource::SpdkEngine, WatchSource::SpdkReplica]);
    }

    let clients = Arc::new(WatchClients::new(Some(process_client), spdk_client));
    let scope = shutdown.child_token();
    let (notify_tx, notify_rx) = mpsc::channel(config.buffer.max(1));
    let (client_tx, client_rx) = mpsc::channel(OUTBOUND_BUFFER);

    let mut group = JoinSet::new();
    group.spawn(forward_loop(
        notify_rx,
        client_tx.clone(),
        scope.clone(),
        Arc::clone(&clients),
    ));
    for source in sources {
        group.spawn(receive_loop(
            source,
            Arc::clone(&clients),
            notify_tx.clone(),
            scope.clone(),
            config,
        ));
    }
    drop(notify_tx);

    tokio::spawn(supervise(group, scope, clients, client_tx));

    Ok(Box::pin(ReceiverStream::new(client_rx)))
}

/// Join the group, cancel the scope on the first error and hand that error
/// to the client.
async fn supervise(
    mut group: JoinSet<Result<(), Status>>,
    scope: CancellationToken,
    clients: Arc<WatchClients>,
    client_tx: mpsc::Sender<Result<(), Status>>,
) {
    let mut first_err: Option<Status> = None;

    while let Some(joined) = group.join_next().await {
        let result = joined
            .unwrap_or_else(|e| Err(Status::internal(format!("watch task failed: {e}"))));
        if let Err(status) = result {
            if first_err.is_none() {
                first_err = Some(status);
            }
            scope.cancel();
        }
    }
    clients.close_all();

    match first_err {
        Some(status) => {
            if status.code() == Code::Cancelled {
                info!(reason = %status.message(), "stopped watching instances");
            } else {
                error!(error = %status, "failed to watch instances");
            }
            // the client may already be gone
            let _ = client_tx.send(Err(status)).await;
        }
        None => info!("stopped watching instances"),
    }
}

/// Drain tokens into the client stream until the scope fires or the client
/// goes away, then close the session's clients.
async fn forward_loop(
    mut notify_rx: mpsc::Receiver<()>,
    client_tx: mpsc::Sender<Result<(), Status>>,
    scope: CancellationToken,
    clients: Arc<WatchClients>,
) -> Result<(), Status> {
    let result = loop {
        tokio::select! {
            _ = scope.cancelled() => {
                break Err(Status::cancelled("instance watch is shutting down"));
            }
            _ = client_tx.closed() => {
                break Err(Status::cancelled("instance watch client went away"));
            }
            token = notify_rx.recv() => {
                if token.is_none() {
                    break Err(Status::cancelled("every backend watch has ended"));
                }
                let sent = tokio::select! {
                    _ = scope.cancelled() => false,
                    sent = client_tx.send(Ok(())) => sent.is_ok(),
                };
                if !sent {
                    break Err(Status::cancelled("instance watch client went away"));
                }
            }
        }
    };

    info!("closing instance watch clients");
    clients.close_all();
    result
}

/// Receive from one backend stream, pushing a token per notification.
///
/// A `cancelled` receive ends the loop cleanly. Any other failure, or the
/// stream ending, is retried on the same stream after `retry_interval`;
/// `max_failures` consecutive failures end the loop with an error.
async fn receive_loop(
    source: WatchSource,
    clients: Arc<WatchClients>,
    notify: mpsc::Sender<()>,
    scope: CancellationToken,
    config: WatchConfig,
) -> Result<(), Status> {
    let name = source.as_str();
    info!(source = name, "start watching");

    let stream = clients.open(source).await.map_err(|status| {
        error!(source = name, error = %status, "failed to open watch");
        Status::new(
            status.code(),
            format!("failed to open {name} watch: {}", status.message()),
        )
    })?;
    let mut stream = stream.fuse();
    let mut failures: u32 = 0;

    loop {
        let item = tokio::select! {
            _ = scope.cancelled() => {
                info!(source = name, "stopped watching");
                return Ok(());
            }
            item = stream.next() => item,
        };

        let failure = match item {
            Some(Ok(())) => {
                failures = 0;
                let sent = tokio::select! {
                    _ = scope.cancelled() => false,
                    sent = notify.send(()) => sent.is_ok(),
                };
                if !sent {
                    info!(source = name, "stopped watching");
                    return Ok(());
                }
                continue;
            }
            Some(Err(status)) if status.code() == Code::Cancelled => {
                warn!(source = name, reason = %status.message(), "watch is cancelled");
                return Ok(());
            }
            Some(Err(status)) => status.to_string(),
            None => "stream ended".to_string(),
        };

        failures += 1;
        error!(source = name, error = %failure, failures, "failed to receive next watch item");
        if failures >= config.max_failures {
            return Err(Status::unavailable(format!(
                "continuously receiving errors for {failures} times, stopping watching {name}"
            )));
        }

        tokio::select! {
            _ = scope.cancelled() => {
                info!(source = name, "stopped watching");
                return Ok(());
            }
            _ = tokio::time::sleep(config.retry_interval) => {}
        }
    }
}
