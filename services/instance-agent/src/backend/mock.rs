//! In-memory SPDK service for tests and development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use strata_api::spdk::{Engine, EngineCreateRequest, Replica, ReplicaCreateRequest};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::backend::{close_aware, BackendClient, NotifyStream, SpdkClient, SpdkConnector};

/// What a watch stream yields before it goes live.
#[derive(Debug, Default)]
struct WatchScript {
    items: VecDeque<Result<(), Status>>,
    /// End the stream after the scripted items instead of following changes.
    end: bool,
}

struct MockSpdkState {
    engines: Mutex<HashMap<String, Engine>>,
    replicas: Mutex<HashMap<String, Replica>>,
    calls: Mutex<Vec<String>>,
    engine_script: Mutex<WatchScript>,
    replica_script: Mutex<WatchScript>,
    changes: broadcast::Sender<()>,
    next_port: AtomicI32,
    fail_connect: AtomicBool,
    fail_watch: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Fake SPDK service. Acts as its own connector.
#[derive(Clone)]
pub struct MockSpdkService {
    state: Arc<MockSpdkState>,
}

impl Default for MockSpdkService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpdkService {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(MockSpdkState {
                engines: Mutex::new(HashMap::new()),
                replicas: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                engine_script: Mutex::new(WatchScript::default()),
                replica_script: Mutex::new(WatchScript::default()),
                changes,
                next_port: AtomicI32::new(20000),
                fail_connect: AtomicBool::new(false),
                fail_watch: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make opening either watch stream fail.
    pub fn fail_watch(&self, fail: bool) {
        self.state.fail_watch.store(fail, Ordering::SeqCst);
    }

    /// Items the next engine watch yields before following changes, or before
    /// ending when `end` is set.
    pub async fn script_engine_watch(&self, items: Vec<Result<(), Status>>, end: bool) {
        *self.state.engine_script.lock().await = WatchScript {
            items: items.into(),
            end,
        };
    }

    /// Same as [`Self::script_engine_watch`] for replicas.
    pub async fn script_replica_watch(&self, items: Vec<Result<(), Status>>, end: bool) {
        *self.state.replica_script.lock().await = WatchScript {
            items: items.into(),
            end,
        };
    }

    /// Insert an engine without going through a client.
    pub async fn seed_engine(&self, engine: Engine) {
        self.state
            .engines
            .lock()
            .await
            .insert(engine.name.clone(), engine);
    }

    /// Insert a replica without going through a client.
    pub async fn seed_replica(&self, replica: Replica) {
        self.state
            .replicas
            .lock()
            .await
            .insert(replica.name.clone(), replica);
    }

    /// Client calls so far, formatted as `method name`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.calls.lock().await.clone()
    }

    pub fn opened_clients(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed_clients(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Publish a change to every live watch stream.
    pub fn notify(&self) {
        let _ = self.state.changes.send(());
    }
}

#[async_trait]
impl SpdkConnector for MockSpdkService {
    async fn connect(&self) -> anyhow::Result<Arc<dyn SpdkClient>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("mock SPDK service refused the connection");
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSpdkClient {
            state: Arc::clone(&self.state),
            closed: CancellationToken::new(),
        }))
    }
}

/// Client handed out by [`MockSpdkService`].
pub struct MockSpdkClient {
    state: Arc<MockSpdkState>,
    closed: CancellationToken,
}

impl MockSpdkClient {
    async fn record(&self, call: String) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            return Err(Status::cancelled("SPDK client is closed"));
        }
        self.state.calls.lock().await.push(call);
        Ok(())
    }

    async fn open_watch(&self, script: &Mutex<WatchScript>) -> Result<NotifyStream, Status> {
        if self.state.fail_watch.load(Ordering::SeqCst) {
            return Err(Status::unavailable("mock SPDK watch refused"));
        }

        let script = std::mem::take(&mut *script.lock().await);
        let scripted = futures_util::stream::iter(script.items);
        let stream: NotifyStream = if script.end {
            Box::pin(scripted)
        } else {
            let live = BroadcastStream::new(self.state.changes.subscribe()).map(|_| Ok(()));
            Box::pin(scripted.chain(live))
        };
        Ok(close_aware(stream, self.closed.clone()))
    }

    fn changed(&self) {
        let _ = self.state.changes.send(());
    }
}

impl BackendClient for MockSpdkClient {
    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SpdkClient for MockSpdkClient {
    async fn engine_create(&self, req: EngineCreateRequest) -> Result<Engine, Status> {
        self.record(format!("engine_create {}", req.name)).await?;

        let mut engines = self.state.engines.lock().await;
        if engines.contains_key(&req.name) {
            return Err(Status::already_exists(format!("engine {} already exists", req.name)));
        }
        let engine = Engine {
            name: req.name.clone(),
            volume_name: req.volume_name,
            frontend: req.frontend,
            size: req.size,
            replica_address_map: req.replica_address_map,
            port: self.state.next_port.fetch_add(1, Ordering::SeqCst),
            state: "running".to_string(),
            error_msg: String::new(),
        };
        engines.insert(req.name, engine.clone());
        drop(engines);

        self.changed();
        Ok(engine)
    }

    async fn engine_delete(&self, name: &str) -> Result<(), Status> {
        self.record(format!("engine_delete {name}")).await?;
        self.state.engines.lock().await.remove(name);
        self.changed();
        Ok(())
    }

    async fn engine_get(&self, name: &str) -> Result<Engine, Status> {
        self.record(format!("engine_get {name}")).await?;
        self.state
            .engines
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("cannot find engine {name}")))
    }

    async fn engine_list(&self) -> Result<HashMap<String, Engine>, Status> {
        self.record("engine_list".to_string()).await?;
        Ok(self.state.engines.lock().await.clone())
    }

    async fn engine_watch(&self) -> Result<NotifyStream, Status> {
        self.record("engine_watch".to_string()).await?;
        self.open_watch(&self.state.engine_script).await
    }

    async fn replica_create(&self, req: ReplicaCreateRequest) -> Result<Replica, Status> {
        self.record(format!("replica_create {}", req.name)).await?;

        let mut replicas = self.state.replicas.lock().await;
        if replicas.contains_key(&req.name) {
            return Err(Status::already_exists(format!("replica {} already exists", req.name)));
        }
        let count = req.port_count.max(1);
        let port_start = self.state.next_port.fetch_add(count, Ordering::SeqCst);
        let replica = Replica {
            name: req.name.clone(),
            disk_name: req.disk_name,
            disk_uuid: req.disk_uuid,
            size: req.size,
            port_start,
            port_end: port_start + count - 1,
            state: "running".to_string(),
            error_msg: String::new(),
        };
        replicas.insert(req.name, replica.clone());
        drop(replicas);

        self.changed();
        Ok(replica)
    }

    async fn replica_delete(&self, name: &str, cleanup_required: bool) -> Result<(), Status> {
        self.record(format!("replica_delete {name} cleanup={cleanup_required}"))
            .await?;
        self.state.replicas.lock().await.remove(name);
        self.changed();
        Ok(())
    }

    async fn replica_get(&self, name: &str) -> Result<Replica, Status> {
        self.record(format!("replica_get {name}")).await?;
        self.state
            .replicas
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("cannot find replica {name}")))
    }

    async fn replica_list(&self) -> Result<HashMap<String, Replica>, Status> {
        self.record("replica_list".to_string()).await?;
        Ok(self.state.replicas.lock().await.clone())
    }

    async fn replica_watch(&self) -> Result<NotifyStream, Status> {
        self.record("replica_watch".to_string()).await?;
        self.open_watch(&self.state.replica_script).await
    }
}
