//! Registry of named processes.
//!
//! The process manager is the local service behind the process backend. It
//! owns the port pool and the log directory, turns every process update into
//! a watch notification, and removes deleted processes once they are down.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures_util::StreamExt;
use nix::sys::signal::Signal;
use strata_api::process::{ProcessResponse, ProcessSpec};
use strata_api::ProcessState;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::backend::{LogStream, NotifyStream};
use crate::error::ProcessError;
use crate::process::executor::{parse_signal, Executor};
use crate::process::health::HealthChecker;
use crate::process::logs::{self, LogSink};
use crate::process::ports::{PortAllocator, PortRange};
use crate::process::supervisor::{Process, ProcessDeps};
use crate::process::ProcessTiming;

/// Capacity of the per-manager process update channel.
pub const UPDATE_BUFFER: usize = 1024;

/// Process manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub logs_dir: PathBuf,
    pub port_range: PortRange,
    pub timing: ProcessTiming,
}

/// A registered name.
///
/// `ops` serializes delete, replace and unregistration of the name; the
/// registry lock is only held for lookups and swaps.
struct Entry {
    process: Arc<Process>,
    ops: Arc<Mutex<()>>,
    deleted: bool,
}

impl Entry {
    fn new(process: Arc<Process>) -> Self {
        Self {
            process,
            ops: Arc::new(Mutex::new(())),
            deleted: false,
        }
    }
}

/// Supervises every process-backed instance on this node.
pub struct ProcessManager {
    processes: RwLock<HashMap<String, Entry>>,
    /// Names whose create is in flight.
    creating: StdMutex<HashSet<String>>,
    ports: PortAllocator,
    logs_dir: PathBuf,
    deps: ProcessDeps,
    watchers: broadcast::Sender<()>,
}

impl ProcessManager {
    /// Create the manager and start its update loop. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: ManagerConfig,
        executor: Arc<dyn Executor>,
        health: Arc<dyn HealthChecker>,
    ) -> Arc<Self> {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let (watchers, _) = broadcast::channel(UPDATE_BUFFER);

        tokio::spawn(run_update_loop(updates_rx, watchers.clone()));

        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            creating: StdMutex::new(HashSet::new()),
            ports: PortAllocator::new(config.port_range),
            logs_dir: config.logs_dir,
            deps: ProcessDeps {
                executor,
                health,
                updates: updates_tx,
                timing: config.timing,
            },
            watchers,
        })
    }

    // =========================================================================
    // Create / Delete
    // =========================================================================

    pub async fn create(self: &Arc<Self>, spec: ProcessSpec) -> Result<ProcessResponse, ProcessError> {
        validate_spec(&spec)?;

        let reservation = self.reserve(&spec.name).await?;

        let process = self.launch(spec).await?;
        self.processes
            .write()
            .await
            .insert(process.name().to_string(), Entry::new(Arc::clone(&process)));
        drop(reservation);

        self.notify();
        Ok(process.snapshot().await)
    }

    /// Claim `name` for a create so the launch can run outside the registry
    /// lock.
    async fn reserve(&self, name: &str) -> Result<Reservation<'_>, ProcessError> {
        let processes = self.processes.read().await;
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        if processes.contains_key(name) || !creating.insert(name.to_string()) {
            return Err(ProcessError::AlreadyExists(name.to_string()));
        }
        Ok(Reservation {
            creating: &self.creating,
            name: name.to_string(),
        })
    }

    /// Allocate ports, open the log and start a process. Nothing is left
    /// allocated when this fails.
    async fn launch(&self, mut spec: ProcessSpec) -> Result<Arc<Process>, ProcessError> {
        let (port_start, port_end) = self.ports.allocate(spec.port_count).await?;
        spec.args = expand_port_args(&spec.args, &spec.port_args, port_start);

        let log = match LogSink::open(self.log_path(&spec.name)).await {
            Ok(log) => Arc::new(log),
            Err(source) => {
                self.ports.release(port_start, port_end).await;
                return Err(ProcessError::Log {
                    name: spec.name,
                    source,
                });
            }
        };

        let process = Process::new(spec, (port_start, port_end), Arc::clone(&log), self.deps.clone());
        if let Err(e) = process.start().await {
            self.ports.release(port_start, port_end).await;
            if let Err(close) = log.close().await {
                warn!(name = %process.name(), error = %close, "failed to close process log");
            }
            return Err(e);
        }

        info!(
            name = %process.name(),
            port_start,
            port_end,
            "process created"
        );
        Ok(process)
    }

    /// Stop a process and report it as deleted. It leaves the registry once
    /// it is down.
    pub async fn delete(self: &Arc<Self>, name: &str) -> Result<ProcessResponse, ProcessError> {
        let _ops = self.lock_entry(name).await?;

        let (process, first) = {
            let mut processes = self.processes.write().await;
            let entry = processes
                .get_mut(name)
                .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
            let first = !entry.deleted;
            entry.deleted = true;
            (Arc::clone(&entry.process), first)
        };
        process.stop().await;

        let mut resp = process.snapshot().await;
        resp.deleted = true;

        if first {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.unregister_when_stopped(process).await });
        }

        Ok(resp)
    }

    /// Remove a deleted process once it is down. Its ports go back to the
    /// pool only together with the removal.
    async fn unregister_when_stopped(&self, process: Arc<Process>) {
        if !self.wait_terminal(&process).await {
            warn!(name = %process.name(), "process did not stop, keeping it registered");
            return;
        }

        let Ok(_ops) = self.lock_entry(process.name()).await else {
            return;
        };
        let removed = {
            let mut processes = self.processes.write().await;
            match processes.get(process.name()) {
                Some(entry) if Arc::ptr_eq(&entry.process, &process) => {
                    processes.remove(process.name());
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }

        let (start, end) = process.ports().await;
        self.ports.release(start, end).await;
        info!(name = %process.name(), "process unregistered");
        self.notify();
    }

    /// Take the per-name operation lock. The entry cannot leave the registry
    /// while the guard is held.
    async fn lock_entry(&self, name: &str) -> Result<OwnedMutexGuard<()>, ProcessError> {
        let ops = self
            .processes
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.ops))
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
        let guard = Arc::clone(&ops).lock_owned().await;

        // the name may have been unregistered and created again meanwhile
        match self.processes.read().await.get(name) {
            Some(entry) if Arc::ptr_eq(&entry.ops, &ops) => Ok(guard),
            _ => Err(ProcessError::NotFound(name.to_string())),
        }
    }

    /// Release the ports of a process that is not in the registry.
    async fn release_when_stopped(&self, process: Arc<Process>) {
        if self.wait_terminal(&process).await {
            let (start, end) = process.ports().await;
            self.ports.release(start, end).await;
        } else {
            warn!(name = %process.name(), "process did not stop, its ports stay allocated");
        }
    }

    async fn wait_terminal(&self, process: &Process) -> bool {
        let timing = self.deps.timing;
        // the stop path itself kills after one budget; allow a second for the exit
        for _ in 0..timing.stop_wait_count.saturating_mul(2).max(1) {
            if process.is_stopped().await {
                return true;
            }
            tokio::time::sleep(timing.stop_wait_interval).await;
        }
        process.is_stopped().await
    }

    // =========================================================================
    // Get / List
    // =========================================================================

    pub async fn get(&self, name: &str) -> Result<ProcessResponse, ProcessError> {
        Ok(self.find(name).await?.snapshot().await)
    }

    pub async fn list(&self) -> HashMap<String, ProcessResponse> {
        let processes = self.registered().await;

        let mut out = HashMap::with_capacity(processes.len());
        for process in processes {
            out.insert(process.name().to_string(), process.snapshot().await);
        }
        out
    }

    async fn find(&self, name: &str) -> Result<Arc<Process>, ProcessError> {
        self.processes
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.process))
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))
    }

    async fn registered(&self) -> Vec<Arc<Process>> {
        self.processes
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.process))
            .collect()
    }

    // =========================================================================
    // Replace
    // =========================================================================

    /// Start a new process under an existing name and retire the old one
    /// once the new one is running.
    ///
    /// Holds the name's operation lock throughout, so a concurrent delete or
    /// replace of the same name waits for this one. An empty
    /// `terminate_signal` means SIGTERM.
    pub async fn replace(
        self: &Arc<Self>,
        spec: ProcessSpec,
        terminate_signal: &str,
    ) -> Result<ProcessResponse, ProcessError> {
        validate_spec(&spec)?;
        let signal = if terminate_signal.is_empty() {
            Signal::SIGTERM
        } else {
            parse_signal(terminate_signal)
                .ok_or_else(|| ProcessError::UnknownSignal(terminate_signal.to_string()))?
        };

        let name = spec.name.clone();
        let _ops = self.lock_entry(&name).await?;
        let old = match self.processes.read().await.get(&name) {
            Some(entry) if !entry.deleted => Arc::clone(&entry.process),
            _ => return Err(ProcessError::NotFound(name)),
        };
        let new = self.launch(spec).await?;

        if !self.wait_running(&new).await {
            self.discard(&new).await;
            let snap = new.snapshot().await;
            return Err(ProcessError::Start {
                name,
                reason: format!(
                    "replacement did not become ready (state {}): {}",
                    snap.status.state, snap.status.error_msg
                ),
            });
        }

        let swapped = {
            let mut processes = self.processes.write().await;
            match processes.get_mut(&name) {
                Some(entry) if Arc::ptr_eq(&entry.process, &old) && !entry.deleted => {
                    entry.process = Arc::clone(&new);
                    true
                }
                _ => false,
            }
        };
        if !swapped {
            self.discard(&new).await;
            return Err(ProcessError::NotFound(name));
        }

        old.stop_with_signal(signal).await;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.release_when_stopped(old).await });

        info!(name = %name, %signal, "process replaced");
        self.notify();
        Ok(new.snapshot().await)
    }

    /// Stop a process that never made it into the registry.
    async fn discard(self: &Arc<Self>, process: &Arc<Process>) {
        process.stop().await;
        let this = Arc::clone(self);
        let process = Arc::clone(process);
        tokio::spawn(async move { this.release_when_stopped(process).await });
    }

    async fn wait_running(&self, process: &Process) -> bool {
        let timing = self.deps.timing;
        // a probe may take up to one interval to time out on top of the sleep
        for _ in 0..timing.probe_count.saturating_mul(2).saturating_add(2) {
            match process.state().await {
                ProcessState::Running => return true,
                ProcessState::Starting => {}
                _ => return false,
            }
            tokio::time::sleep(timing.probe_interval).await;
        }
        process.state().await == ProcessState::Running
    }

    // =========================================================================
    // Log / Watch / Shutdown
    // =========================================================================

    pub async fn log(&self, name: &str) -> Result<LogStream, ProcessError> {
        let process = self.find(name).await?;
        let path = process
            .log_sink()
            .path()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.log_path(name));

        logs::read_lines(&path).await.map_err(|source| ProcessError::Log {
            name: name.to_string(),
            source,
        })
    }

    /// One empty notification per process update.
    pub fn watch(&self) -> NotifyStream {
        let stream = BroadcastStream::new(self.watchers.subscribe()).map(|item| {
            if let Err(e) = item {
                // lagged: the missed batch collapses into this one notification
                debug!(error = %e, "process watcher lagged");
            }
            Ok(())
        });
        Box::pin(stream)
    }

    /// Stop every registered process and wait for them to go down.
    pub async fn shutdown(&self) {
        let processes = self.registered().await;
        info!(count = processes.len(), "stopping all processes");

        for process in &processes {
            process.stop().await;
        }
        for process in &processes {
            if !self.wait_terminal(process).await {
                warn!(name = %process.name(), "process still running at shutdown");
            }
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir.join(format!("{name}.log"))
    }

    fn notify(&self) {
        // no watchers is fine
        let _ = self.watchers.send(());
    }
}

/// A name claimed by an in-flight create; dropped once the create is done.
struct Reservation<'a> {
    creating: &'a StdMutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.creating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

async fn run_update_loop(mut updates: mpsc::Receiver<Arc<Process>>, watchers: broadcast::Sender<()>) {
    while let Some(process) = updates.recv().await {
        debug!(name = %process.name(), "process updated");
        let _ = watchers.send(());
    }
    debug!("process update loop exited");
}

fn validate_spec(spec: &ProcessSpec) -> Result<(), ProcessError> {
    if spec.name.is_empty() {
        return Err(ProcessError::InvalidArgument("missing process name".to_string()));
    }
    if spec.binary.is_empty() {
        return Err(ProcessError::InvalidArgument(format!(
            "missing binary for process {}",
            spec.name
        )));
    }
    if spec.port_count < 0 {
        return Err(ProcessError::InvalidArgument(format!(
            "negative port count {} for process {}",
            spec.port_count, spec.name
        )));
    }
    if spec.port_args.len() > spec.port_count as usize {
        return Err(ProcessError::InvalidArgument(format!(
            "process {} has {} port args but only {} ports",
            spec.name,
            spec.port_args.len(),
            spec.port_count
        )));
    }
    Ok(())
}

/// Append `port_args[i] + (port_start + i)` to `args`, split on `,`.
fn expand_port_args(args: &[String], port_args: &[String], port_start: i32) -> Vec<String> {
    let mut out = args.to_vec();
    for (i, prefix) in port_args.iter().enumerate() {
        let arg = format!("{prefix}{}", port_start + i as i32);
        out.extend(arg.split(',').map(str::to_string));
    }
    out
}
