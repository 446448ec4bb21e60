//! Readiness probing for supervised processes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::ProcessTiming;

/// Decides when a freshly started process is ready.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Poll `address` until it answers or the budget runs out.
    ///
    /// Returns `false` as soon as `stop` fires.
    async fn wait_for_running(&self, address: &str, name: &str, stop: &CancellationToken)
        -> bool;
}

// =============================================================================
// TCP
// =============================================================================

/// Treats a process as ready once its first port accepts a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpHealthChecker {
    interval: Duration,
    attempts: u32,
}

impl TcpHealthChecker {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    pub fn from_timing(timing: &ProcessTiming) -> Self {
        Self::new(timing.probe_interval, timing.probe_count)
    }
}

#[async_trait]
impl HealthChecker for TcpHealthChecker {
    async fn wait_for_running(
        &self,
        address: &str,
        name: &str,
        stop: &CancellationToken,
    ) -> bool {
        for attempt in 1..=self.attempts {
            if stop.is_cancelled() {
                return false;
            }
            let ready = tokio::select! {
                _ = stop.cancelled() => return false,
                ready = check_tcp(address, self.interval) => ready,
            };
            if ready {
                info!(name = %name, address = %address, "process is ready");
                return true;
            }
            debug!(name = %name, attempt, "process not ready yet");

            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = sleep(self.interval) => {}
            }
        }

        warn!(
            name = %name,
            address = %address,
            attempts = self.attempts,
            "process did not become ready"
        );
        false
    }
}

async fn check_tcp(address: &str, check_timeout: Duration) -> bool {
    match timeout(check_timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(address = %address, error = %e, "tcp probe failed: connection error");
            false
        }
        Err(_) => {
            debug!(address = %address, "tcp probe failed: timeout");
            false
        }
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Health checker with a fixed verdict.
#[derive(Debug, Clone)]
pub struct MockHealthChecker {
    healthy: bool,
    delay: Duration,
}

impl MockHealthChecker {
    /// Reports ready after `delay` unless stopped first.
    pub fn healthy(delay: Duration) -> Self {
        Self {
            healthy: true,
            delay,
        }
    }

    /// Gives up after `delay` unless stopped first.
    pub fn unhealthy(delay: Duration) -> Self {
        Self {
            healthy: false,
            delay,
        }
    }
}

#[async_trait]
impl HealthChecker for MockHealthChecker {
    async fn wait_for_running(
        &self,
        _address: &str,
        _name: &str,
        stop: &CancellationToken,
    ) -> bool {
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = sleep(self.delay) => self.healthy,
        }
    }
}
