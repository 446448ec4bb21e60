//! Port allocation for process-backed instances.
//!
//! Every process with `port_count > 0` gets one contiguous block of ports.
//! A block of zero ports is represented as `(0, 0)`.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use tokio::sync::Mutex;

use crate::error::ProcessError;

/// Inclusive range of ports owned by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: i32,
    pub end: i32,
}

impl PortRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .with_context(|| format!("port range {s:?} is not of the form START-END"))?;
        let start: i32 = start.trim().parse().context("invalid range start")?;
        let end: i32 = end.trim().parse().context("invalid range end")?;

        if start <= 0 || end > u16::MAX as i32 || start > end {
            bail!("port range {s:?} is out of bounds");
        }
        Ok(Self { start, end })
    }
}

/// Hands out contiguous port blocks from a [`PortRange`].
pub struct PortAllocator {
    range: PortRange,
    used: Mutex<Vec<bool>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            used: Mutex::new(vec![false; range.len()]),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Allocate `count` contiguous ports, returning `(port_start, port_end)`.
    pub async fn allocate(&self, count: i32) -> Result<(i32, i32), ProcessError> {
        if count <= 0 {
            return Ok((0, 0));
        }
        let count_usize = count as usize;

        let mut used = self.used.lock().await;
        let mut run = 0;
        for idx in 0..used.len() {
            if used[idx] {
                run = 0;
                continue;
            }
            run += 1;
            if run == count_usize {
                let first = idx + 1 - count_usize;
                used[first..=idx].iter_mut().for_each(|slot| *slot = true);
                let start = self.range.start + first as i32;
                return Ok((start, start + count - 1));
            }
        }

        Err(ProcessError::PortsExhausted { count })
    }

    /// Return a block to the pool. `(0, 0)` is a no-op.
    pub async fn release(&self, start: i32, end: i32) {
        if start == 0 && end == 0 {
            return;
        }
        let lo = start.max(self.range.start);
        let hi = end.min(self.range.end);
        if lo > hi {
            return;
        }

        let mut used = self.used.lock().await;
        for port in lo..=hi {
            used[(port - self.range.start) as usize] = false;
        }
    }
}
