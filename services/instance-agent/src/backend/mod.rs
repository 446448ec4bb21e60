//! Clients for the two backends behind the instance surface.
//!
//! - [`ProcessManagerClient`]: the local process-management service
//! - [`SpdkClient`]: the SPDK engine/replica service
//!
//! Clients are opened per call through a connector and closed when the call
//! is done ([`Scoped`]). Closing a client ends its open watch and log streams
//! with a `cancelled` status.

use std::collections::HashMap;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use strata_api::process::{ProcessResponse, ProcessSpec};
use strata_api::spdk::{Engine, EngineCreateRequest, Replica, ReplicaCreateRequest};
use tokio_util::sync::CancellationToken;
use tonic::Status;

pub mod mock;
pub mod process;
pub mod spdk_http;

pub use mock::MockSpdkService;
pub use process::{LocalProcessManagerClient, LocalProcessManagerConnector};
pub use spdk_http::{HttpSpdkClient, HttpSpdkConnector};

/// Stream of empty change notifications.
pub type NotifyStream = Pin<Box<dyn Stream<Item = Result<(), Status>> + Send>>;

/// Stream of log lines.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, Status>> + Send>>;

/// Anything that holds backend resources until closed.
pub trait BackendClient: Send + Sync {
    /// Release the client. Idempotent.
    fn close(&self);
}

// =============================================================================
// Process manager
// =============================================================================

#[async_trait]
pub trait ProcessManagerClient: BackendClient {
    async fn process_create(&self, spec: ProcessSpec) -> Result<ProcessResponse, Status>;

    async fn process_delete(&self, name: &str) -> Result<ProcessResponse, Status>;

    async fn process_get(&self, name: &str) -> Result<ProcessResponse, Status>;

    async fn process_list(&self) -> Result<HashMap<String, ProcessResponse>, Status>;

    async fn process_replace(
        &self,
        spec: ProcessSpec,
        terminate_signal: &str,
    ) -> Result<ProcessResponse, Status>;

    async fn process_log(&self, name: &str) -> Result<LogStream, Status>;

    async fn process_watch(&self) -> Result<NotifyStream, Status>;
}

/// Opens process manager clients.
#[async_trait]
pub trait ProcessManagerConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ProcessManagerClient>>;
}

// =============================================================================
// SPDK
// =============================================================================

#[async_trait]
pub trait SpdkClient: BackendClient {
    async fn engine_create(&self, req: EngineCreateRequest) -> Result<Engine, Status>;

    async fn engine_delete(&self, name: &str) -> Result<(), Status>;

    async fn engine_get(&self, name: &str) -> Result<Engine, Status>;

    async fn engine_list(&self) -> Result<HashMap<String, Engine>, Status>;

    async fn engine_watch(&self) -> Result<NotifyStream, Status>;

    async fn replica_create(&self, req: ReplicaCreateRequest) -> Result<Replica, Status>;

    async fn replica_delete(&self, name: &str, cleanup_required: bool) -> Result<(), Status>;

    async fn replica_get(&self, name: &str) -> Result<Replica, Status>;

    async fn replica_list(&self) -> Result<HashMap<String, Replica>, Status>;

    async fn replica_watch(&self) -> Result<NotifyStream, Status>;
}

/// Opens SPDK clients.
#[async_trait]
pub trait SpdkConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn SpdkClient>>;
}

// =============================================================================
// Scoped handles and close-aware streams
// =============================================================================

/// Closes the wrapped client when dropped.
pub struct Scoped<C: ?Sized + BackendClient> {
    client: Arc<C>,
}

impl<C: ?Sized + BackendClient> Scoped<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

impl<C: ?Sized + BackendClient> Deref for Scoped<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C: ?Sized + BackendClient> Drop for Scoped<C> {
    fn drop(&mut self) {
        self.client.close();
    }
}

/// Forward `inner` until `closed` fires, then yield one `cancelled` status
/// and end.
pub fn close_aware<T: Send + 'static>(
    inner: Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>,
    closed: CancellationToken,
) -> Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>> {
    let stream = futures_util::stream::unfold(Some((inner, closed)), |state| async move {
        let (mut inner, closed) = state?;

        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            item = inner.next() => Some(item),
        };

        match next {
            None => Some((Err(Status::cancelled("client is closing")), None)),
            Some(Some(item)) => Some((item, Some((inner, closed)))),
            Some(None) => None,
        }
    });
    Box::pin(stream)
}

/// Tie a stream's lifetime to a scoped client: the client closes once the
/// stream is dropped.
pub fn hold_client<T, C>(
    inner: Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>,
    client: Scoped<C>,
) -> Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>
where
    T: Send + 'static,
    C: ?Sized + BackendClient + 'static,
{
    Box::pin(inner.map(move |item| {
        let _ = &client;
        item
    }))
}
