//! Command execution interface and implementations.
//!
//! The supervisor never touches `tokio::process` directly. It asks an
//! [`Executor`] for a [`Command`], runs it to completion on its own task and
//! signals it from the stop path:
//! - [`BinaryExecutor`] spawns real children and signals them with `nix`
//! - [`MockExecutor`] simulates children for tests and development

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::process::logs::LogSink;

/// Builds commands for the supervisor.
pub trait Executor: Send + Sync {
    /// Prepare (but do not start) `binary args...` with output sent to `log`.
    fn new_command(
        &self,
        binary: &str,
        args: &[String],
        log: Arc<LogSink>,
    ) -> Result<Arc<dyn Command>>;
}

/// A prepared child process.
#[async_trait]
pub trait Command: Send + Sync {
    /// Start the child and wait for it to exit. Abnormal exit is an error.
    async fn run(&self) -> Result<()>;

    /// Whether the child has been spawned.
    fn started(&self) -> bool;

    /// Deliver `signal` to the child.
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Force the child down.
    fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

/// Parse a signal name such as `SIGTERM` or `term`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse().ok()
}

// =============================================================================
// Binary Executor
// =============================================================================

const PID_NOT_STARTED: i32 = 0;
const PID_EXITED: i32 = -1;

/// Spawns real OS processes.
#[derive(Debug, Default, Clone)]
pub struct BinaryExecutor;

impl BinaryExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for BinaryExecutor {
    fn new_command(
        &self,
        binary: &str,
        args: &[String],
        log: Arc<LogSink>,
    ) -> Result<Arc<dyn Command>> {
        let path = resolve_binary(binary)?;
        Ok(Arc::new(BinaryCommand {
            binary: path,
            args: args.to_vec(),
            log,
            pid: AtomicI32::new(PID_NOT_STARTED),
        }))
    }
}

/// Resolve `binary` against `PATH` unless it already names a path.
fn resolve_binary(binary: &str) -> Result<PathBuf> {
    if binary.is_empty() {
        bail!("binary is empty");
    }

    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        bail!("executable file not found: {binary}");
    }

    let paths = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow!("executable file not found in PATH: {binary}"))
}

pub struct BinaryCommand {
    binary: PathBuf,
    args: Vec<String>,
    log: Arc<LogSink>,
    pid: AtomicI32,
}

#[async_trait]
impl Command for BinaryCommand {
    async fn run(&self) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        let pid = child.id().context("spawned child has no pid")?;
        self.pid.store(pid as i32, Ordering::SeqCst);
        info!(binary = %self.binary.display(), pid, "process spawned");

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(copy_output(out, Arc::clone(&self.log))));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(copy_output(err, Arc::clone(&self.log))));

        let status = child.wait().await;
        self.pid.store(PID_EXITED, Ordering::SeqCst);

        for copier in [stdout, stderr].into_iter().flatten() {
            let _ = copier.await;
        }

        let status = status.context("failed to wait for child")?;
        debug!(pid, %status, "process exited");
        if !status.success() {
            bail!("process exited with {status}");
        }
        Ok(())
    }

    fn started(&self) -> bool {
        self.pid.load(Ordering::SeqCst) != PID_NOT_STARTED
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match self.pid.load(Ordering::SeqCst) {
            PID_NOT_STARTED => bail!("process has not started"),
            PID_EXITED => bail!("process already finished"),
            pid => kill(Pid::from_raw(pid), signal)
                .with_context(|| format!("failed to send {signal} to pid {pid}")),
        }
    }
}

async fn copy_output<R>(mut reader: R, log: Arc<LogSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                if let Err(e) = log.write(&buf[..n]).await {
                    warn!(error = %e, "failed to write process output");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read process output");
                return;
            }
        }
    }
}

// =============================================================================
// Mock Executor
// =============================================================================

/// How a [`MockCommand`] behaves.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `new_command` fails.
    pub fail_new_command: bool,
    /// `run` fails right away, as if the spawn failed.
    pub fail_spawn: bool,
    /// The child exits on its own after this long.
    pub exit_after: Option<Duration>,
    /// Exit error used when the child exits on its own; `None` is a clean exit.
    pub exit_error: Option<String>,
    /// The child exits cleanly on a catchable signal instead of dying from it.
    pub graceful_exit: bool,
    /// Catchable signals are ignored; only SIGKILL ends the child.
    pub ignore_signals: bool,
}

/// Executor handing out simulated children.
#[derive(Default)]
pub struct MockExecutor {
    behavior: MockBehavior,
    commands: Mutex<Vec<Arc<MockCommand>>>,
}

impl MockExecutor {
    /// Children run until signalled and die from the signal.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Executor whose `new_command` always fails.
    pub fn failing() -> Self {
        Self::with_behavior(MockBehavior {
            fail_new_command: true,
            ..Default::default()
        })
    }

    /// Every command built so far, oldest first.
    pub fn commands(&self) -> Vec<Arc<MockCommand>> {
        self.commands
            .lock()
            .map(|cmds| cmds.clone())
            .unwrap_or_default()
    }

    pub fn last_command(&self) -> Option<Arc<MockCommand>> {
        self.commands().pop()
    }
}

impl Executor for MockExecutor {
    fn new_command(
        &self,
        binary: &str,
        args: &[String],
        _log: Arc<LogSink>,
    ) -> Result<Arc<dyn Command>> {
        if self.behavior.fail_new_command {
            bail!("executable file not found: {binary}");
        }

        let (signal_tx, signal_rx) = watch::channel(None);
        let cmd = Arc::new(MockCommand {
            binary: binary.to_string(),
            args: args.to_vec(),
            behavior: self.behavior.clone(),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            signals: Mutex::new(Vec::new()),
            signal_tx,
            signal_rx,
        });
        if let Ok(mut cmds) = self.commands.lock() {
            cmds.push(Arc::clone(&cmd));
        }
        Ok(cmd)
    }
}

/// A simulated child process.
pub struct MockCommand {
    binary: String,
    args: Vec<String>,
    behavior: MockBehavior,
    started: AtomicBool,
    exited: AtomicBool,
    signals: Mutex<Vec<Signal>>,
    signal_tx: watch::Sender<Option<Signal>>,
    signal_rx: watch::Receiver<Option<Signal>>,
}

impl MockCommand {
    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Signals delivered so far, in order.
    pub fn signals(&self) -> Vec<Signal> {
        self.signals
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Command for MockCommand {
    async fn run(&self) -> Result<()> {
        if self.behavior.fail_spawn {
            self.exited.store(true, Ordering::SeqCst);
            bail!("failed to spawn {}", self.binary);
        }

        let mut signals = self.signal_rx.clone();
        self.started.store(true, Ordering::SeqCst);
        debug!(binary = %self.binary, "[MOCK] process started");

        let self_exit = sleep_or_forever(self.behavior.exit_after);
        tokio::pin!(self_exit);

        let outcome = loop {
            tokio::select! {
                _ = &mut self_exit => {
                    break match &self.behavior.exit_error {
                        Some(msg) => Err(anyhow!("{msg}")),
                        None => Ok(()),
                    };
                }
                changed = signals.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let signal = *signals.borrow_and_update();
                    match signal {
                        Some(Signal::SIGKILL) => break Err(anyhow!("signal: killed")),
                        Some(_) if self.behavior.ignore_signals => continue,
                        Some(_) if self.behavior.graceful_exit => break Ok(()),
                        Some(sig) => break Err(anyhow!("signal: {sig}")),
                        None => continue,
                    }
                }
            }
        };

        self.exited.store(true, Ordering::SeqCst);
        debug!(binary = %self.binary, ok = outcome.is_ok(), "[MOCK] process exited");
        outcome
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if !self.started() {
            bail!("process has not started");
        }
        if self.exited() {
            bail!("process already finished");
        }
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal);
        }
        self.signal_tx.send_replace(Some(signal));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sink() -> Arc<LogSink> {
        Arc::new(LogSink::discard())
    }

    #[rstest]
    #[case("SIGTERM", Some(Signal::SIGTERM))]
    #[case("sigint", Some(Signal::SIGINT))]
    #[case("HUP", Some(Signal::SIGHUP))]
    #[case("SIGNOPE", None)]
    fn test_parse_signal(#[case] name: &str, #[case] expected: Option<Signal>) {
        assert_eq!(parse_signal(name), expected);
    }

    #[test]
    fn test_binary_not_found() {
        let err = BinaryExecutor::new()
            .new_command("definitely-not-a-real-binary-xyz", &[], sink())
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_binary_command_clean_exit() {
        let cmd = BinaryExecutor::new()
            .new_command("true", &[], sink())
            .unwrap();
        assert!(!cmd.started());
        cmd.run().await.unwrap();
        assert!(cmd.started());
        assert!(cmd.signal(Signal::SIGTERM).is_err());
    }

    #[tokio::test]
    async fn test_binary_command_output_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sh.log");
        let log = Arc::new(LogSink::open(&path).await.unwrap());

        let args = vec!["-c".to_string(), "echo hello; exit 3".to_string()];
        let cmd = BinaryExecutor::new()
            .new_command("sh", &args, Arc::clone(&log))
            .unwrap();
        let err = cmd.run().await.unwrap_err();
        assert!(err.to_string().contains("exited"));

        log.close().await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[tokio::test]
    async fn test_binary_command_signal() {
        let args = vec!["30".to_string()];
        let cmd = BinaryExecutor::new()
            .new_command("sleep", &args, sink())
            .unwrap();

        let runner = Arc::clone(&cmd);
        let handle = tokio::spawn(async move { runner.run().await });
        while !cmd.started() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cmd.signal(Signal::SIGTERM).unwrap();
        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_signal_kills_by_default() {
        let exec = MockExecutor::new();
        let cmd = exec.new_command("engine", &[], sink()).unwrap();
        let runner = Arc::clone(&cmd);
        let handle = tokio::spawn(async move { runner.run().await });
        while !cmd.started() {
            tokio::task::yield_now().await;
        }

        cmd.signal(Signal::SIGINT).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "signal: SIGINT");
        assert_eq!(exec.last_command().unwrap().signals(), vec![Signal::SIGINT]);
    }

    #[tokio::test]
    async fn test_mock_ignores_signals_until_kill() {
        let exec = MockExecutor::with_behavior(MockBehavior {
            ignore_signals: true,
            ..Default::default()
        });
        let cmd = exec.new_command("engine", &[], sink()).unwrap();
        let runner = Arc::clone(&cmd);
        let handle = tokio::spawn(async move { runner.run().await });
        while !cmd.started() {
            tokio::task::yield_now().await;
        }

        cmd.signal(Signal::SIGTERM).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        cmd.kill().unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "signal: killed");
    }

    #[tokio::test]
    async fn test_mock_self_exit() {
        let exec = MockExecutor::with_behavior(MockBehavior {
            exit_after: Some(Duration::from_millis(10)),
            exit_error: Some("exit status 1".to_string()),
            ..Default::default()
        });
        let cmd = exec.new_command("replica", &[], sink()).unwrap();
        let err = cmd.run().await.unwrap_err();
        assert_eq!(err.to_string(), "exit status 1");
    }

    #[test]
    fn test_mock_failing_executor() {
        let exec = MockExecutor::failing();
        assert!(exec.new_command("engine", &[], sink()).is_err());
        assert!(exec.commands().is_empty());
    }
}
