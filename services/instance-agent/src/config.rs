//! Configuration for the instance agent.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::process::PortRange;

/// Instance agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one `<name>.log` file per supervised process.
    pub logs_dir: PathBuf,

    /// Ports handed out to process-backed instances.
    pub port_range: PortRange,

    /// Base URL of the SPDK service.
    pub spdk_url: String,

    /// Whether the next-generation (SPDK) backend is enabled.
    pub spdk_enabled: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let logs_dir = std::env::var("STRATA_LOGS_DIR")
            .unwrap_or_else(|_| "/var/log/strata/instances".to_string())
            .into();

        let port_range = std::env::var("STRATA_PORT_RANGE")
            .unwrap_or_else(|_| "10000-30000".to_string())
            .parse()
            .context("invalid STRATA_PORT_RANGE")?;

        let spdk_url = std::env::var("STRATA_SPDK_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8504".to_string());

        let spdk_enabled = std::env::var("STRATA_SPDK_ENABLED")
            .ok()
            .map(|s| parse_bool(&s))
            .unwrap_or(false);

        let log_level = std::env::var("STRATA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            logs_dir,
            port_range,
            spdk_url,
            spdk_enabled,
            log_level,
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
