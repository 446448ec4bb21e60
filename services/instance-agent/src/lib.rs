//! strata Instance Agent Library
//!
//! The instance agent runs on every storage node and serves one uniform
//! instance surface for the engines and replicas of strata volumes. Each
//! instance is implemented by one of two backends:
//!
//! - **process**: every instance is an OS process supervised by this agent
//! - **spdk**: instances live inside the SPDK service and are driven over HTTP
//!
//! ## Architecture
//!
//! ```text
//! InstanceDispatcher
//! ├── ProcessOps ── ProcessManager ── Process (one supervisor per instance)
//! ├── SpdkOps    ── HttpSpdkClient
//! └── watch      ── fan-in of process, engine and replica change streams
//! ```
//!
//! ## Modules
//!
//! - `instance`: dispatcher, backend adapters and the watch aggregator
//! - `backend`: client traits and implementations for both backends
//! - `process`: process supervision, ports and log files
//! - `config`: environment configuration
//! - `error`: process-management errors and their status mapping
//! - `version`: build metadata

pub mod backend;
pub mod config;
pub mod error;
pub mod instance;
pub mod process;
pub mod version;

pub use config::Config;
pub use error::ProcessError;
pub use instance::{InstanceDispatcher, WatchConfig};
