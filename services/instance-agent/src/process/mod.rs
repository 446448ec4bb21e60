//! Local process management.
//!
//! - `supervisor`: the per-process state machine
//! - `manager`: the registry of named processes behind the process backend
//! - `executor`: how commands are spawned and signalled
//! - `health`: readiness probing
//! - `ports`: port block allocation
//! - `logs`: per-process log files

use std::time::Duration;

pub mod executor;
pub mod health;
pub mod logs;
pub mod manager;
pub mod ports;
pub mod supervisor;

pub use executor::{
    parse_signal, BinaryExecutor, Command, Executor, MockBehavior, MockCommand, MockExecutor,
};
pub use health::{HealthChecker, MockHealthChecker, TcpHealthChecker};
pub use logs::LogSink;
pub use manager::ProcessManager;
pub use ports::{PortAllocator, PortRange};
pub use supervisor::{Process, ProcessDeps};

/// Poll budgets of the stop and readiness paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTiming {
    /// Interval between checks for a terminal state after signalling.
    pub stop_wait_interval: Duration,
    /// Checks before escalating to SIGKILL.
    pub stop_wait_count: u32,
    /// Interval between readiness probes.
    pub probe_interval: Duration,
    /// Readiness probes before giving up.
    pub probe_count: u32,
}

impl Default for ProcessTiming {
    fn default() -> Self {
        Self {
            stop_wait_interval: Duration::from_secs(1),
            stop_wait_count: 60,
            probe_interval: Duration::from_secs(1),
            probe_count: 60,
        }
    }
}

impl ProcessTiming {
    /// Millisecond-scale budgets for tests.
    pub fn fast() -> Self {
        Self {
            stop_wait_interval: Duration::from_millis(5),
            stop_wait_count: 10,
            probe_interval: Duration::from_millis(5),
            probe_count: 10,
        }
    }

    /// Upper bound on how long readiness probing can take.
    pub fn probe_budget(&self) -> Duration {
        self.probe_interval * self.probe_count
    }
}
