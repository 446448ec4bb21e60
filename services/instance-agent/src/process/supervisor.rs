//! Supervision of a single OS process.
//!
//! A [`Process`] moves through
//!
//! ```text
//! starting ──> running ──> stopping ──> stopped | error
//!     └──────────────────────────────────────> error
//! ```
//!
//! and never leaves `stopped` or `error`. Every field that changes after
//! construction lives behind one `RwLock`; writers hold it only for the
//! transition itself, readers take the shared side. Each committed
//! transition is published on the update channel.

use std::collections::HashMap;
use std::sync::Arc;

use nix::sys::signal::Signal;
use strata_api::process::{ProcessResponse, ProcessSpec, ProcessStatus};
use strata_api::ProcessState;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;
use crate::process::executor::{Command, Executor};
use crate::process::health::HealthChecker;
use crate::process::logs::LogSink;
use crate::process::ProcessTiming;

/// Collaborators shared by every process of a manager.
#[derive(Clone)]
pub struct ProcessDeps {
    pub executor: Arc<dyn Executor>,
    pub health: Arc<dyn HealthChecker>,
    pub updates: mpsc::Sender<Arc<Process>>,
    pub timing: ProcessTiming,
}

struct ProcessInner {
    state: ProcessState,
    error_msg: String,
    conditions: HashMap<String, bool>,
    port_start: i32,
    port_end: i32,
    cmd: Option<Arc<dyn Command>>,
}

/// One supervised OS process.
pub struct Process {
    spec: ProcessSpec,
    inner: RwLock<ProcessInner>,
    log: Arc<LogSink>,
    probe_stop: CancellationToken,
    deps: ProcessDeps,
}

impl Process {
    /// Create a process in `starting`. `spec.args` must already include the
    /// expanded port arguments.
    pub fn new(
        spec: ProcessSpec,
        ports: (i32, i32),
        log: Arc<LogSink>,
        deps: ProcessDeps,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            inner: RwLock::new(ProcessInner {
                state: ProcessState::Starting,
                error_msg: String::new(),
                conditions: HashMap::new(),
                port_start: ports.0,
                port_end: ports.1,
                cmd: None,
            }),
            log,
            probe_stop: CancellationToken::new(),
            deps,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn log_sink(&self) -> &Arc<LogSink> {
        &self.log
    }

    pub async fn state(&self) -> ProcessState {
        self.inner.read().await.state
    }

    pub async fn ports(&self) -> (i32, i32) {
        let inner = self.inner.read().await;
        (inner.port_start, inner.port_end)
    }

    /// True once the process reached `stopped` or `error`.
    pub async fn is_stopped(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// Spec and status as currently committed.
    pub async fn snapshot(&self) -> ProcessResponse {
        let inner = self.inner.read().await;
        ProcessResponse {
            spec: self.spec.clone(),
            status: ProcessStatus {
                state: inner.state,
                error_msg: inner.error_msg.clone(),
                port_start: inner.port_start,
                port_end: inner.port_end,
                conditions: inner.conditions.clone(),
            },
            deleted: false,
        }
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Build the command and launch the run and readiness tasks.
    ///
    /// A command that cannot be built moves the process to `error` and no
    /// task is spawned.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProcessError> {
        let mut inner = self.inner.write().await;

        let cmd = match self.deps.executor.new_command(
            &self.spec.binary,
            &self.spec.args,
            Arc::clone(&self.log),
        ) {
            Ok(cmd) => cmd,
            Err(e) => {
                inner.state = ProcessState::Error;
                inner.error_msg = format!("{e:#}");
                error!(name = %self.spec.name, error = %inner.error_msg, "failed to build process command");
                return Err(ProcessError::Start {
                    name: self.spec.name.clone(),
                    reason: inner.error_msg.clone(),
                });
            }
        };
        inner.cmd = Some(Arc::clone(&cmd));
        let port_start = inner.port_start;

        tokio::spawn(Arc::clone(self).run(cmd));
        tokio::spawn(Arc::clone(self).wait_ready(port_start));

        info!(name = %self.spec.name, binary = %self.spec.binary, port_start, "process starting");
        Ok(())
    }

    async fn run(self: Arc<Self>, cmd: Arc<dyn Command>) {
        let result = cmd.run().await;
        self.probe_stop.cancel();

        {
            let mut inner = self.inner.write().await;
            match result {
                Ok(()) => {
                    inner.state = ProcessState::Stopped;
                    info!(name = %self.spec.name, "process stopped");
                }
                Err(e) => {
                    inner.state = ProcessState::Error;
                    inner.error_msg = format!("{e:#}");
                    info!(name = %self.spec.name, error = %inner.error_msg, "process errored out");
                }
            }
        }

        self.publish();
    }

    async fn wait_ready(self: Arc<Self>, port_start: i32) {
        if port_start != 0 {
            let address = format!("localhost:{port_start}");
            let ready = self
                .deps
                .health
                .wait_for_running(&address, &self.spec.name, &self.probe_stop)
                .await;
            if ready {
                self.mark_running().await;
                return;
            }

            // not ready in time or already gone; make sure nothing is left behind
            if !self.is_stopped().await {
                self.stop().await;
            }
        } else {
            // no port to probe
            self.mark_running().await;
        }
    }

    async fn mark_running(self: &Arc<Self>) {
        let changed = {
            let mut inner = self.inner.write().await;
            if inner.state == ProcessState::Starting {
                inner.state = ProcessState::Running;
                true
            } else {
                false
            }
        };

        if changed {
            debug!(name = %self.spec.name, "process running");
            self.publish();
        }
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stop with SIGINT.
    pub async fn stop(self: &Arc<Self>) -> bool {
        self.stop_with_signal(Signal::SIGINT).await
    }

    /// Begin stopping with `signal`, escalating to SIGKILL when the process
    /// outlives the stop budget.
    ///
    /// Returns `true` if this call initiated the stop; `false` when the
    /// process was already stopping or terminal.
    pub async fn stop_with_signal(self: &Arc<Self>, signal: Signal) -> bool {
        let cmd = {
            let mut inner = self.inner.write().await;
            if matches!(
                inner.state,
                ProcessState::Stopping | ProcessState::Stopped | ProcessState::Error
            ) {
                return false;
            }
            inner.state = ProcessState::Stopping;
            inner.cmd.clone()
        };
        self.publish();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.terminate(cmd, signal).await;
            if let Err(e) = this.log.close().await {
                warn!(name = %this.spec.name, error = %e, "failed to close process log");
            }
        });
        true
    }

    async fn terminate(&self, cmd: Option<Arc<dyn Command>>, signal: Signal) {
        let Some(cmd) = cmd else {
            error!(name = %self.spec.name, "process has no command, nothing to stop");
            return;
        };
        if !self.wait_started(cmd.as_ref()).await {
            error!(name = %self.spec.name, "process command has not started, nothing to stop");
            return;
        }

        info!(name = %self.spec.name, %signal, "stopping process");
        if let Err(e) = cmd.signal(signal) {
            warn!(name = %self.spec.name, error = %e, "failed to signal process");
        }

        let timing = self.deps.timing;
        for _ in 0..timing.stop_wait_count {
            if self.is_stopped().await {
                return;
            }
            debug!(name = %self.spec.name, "waiting for process to shut down");
            tokio::time::sleep(timing.stop_wait_interval).await;
        }
        if self.is_stopped().await {
            return;
        }

        warn!(
            name = %self.spec.name,
            waited = ?timing.stop_wait_interval * timing.stop_wait_count,
            "graceful stop timed out, killing process"
        );
        if let Err(e) = cmd.kill() {
            warn!(name = %self.spec.name, error = %e, "failed to kill process");
        }
    }

    /// A stop can race the run task; give the spawn one stop budget.
    async fn wait_started(&self, cmd: &dyn Command) -> bool {
        let timing = self.deps.timing;
        for _ in 0..timing.stop_wait_count {
            if cmd.started() {
                return true;
            }
            if self.is_stopped().await {
                return false;
            }
            tokio::time::sleep(timing.stop_wait_interval).await;
        }
        cmd.started()
    }

    fn publish(self: &Arc<Self>) {
        match self.deps.updates.try_send(Arc::clone(self)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(name = %self.spec.name, "update channel full, dropping process update");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(name = %self.spec.name, "update channel closed");
            }
        }
    }
}
