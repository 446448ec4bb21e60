//! Error types for the process manager.
//!
//! Everything that crosses the instance surface is a [`tonic::Status`];
//! [`ProcessError`] is converted at that boundary.

use thiserror::Error;
use tonic::Status;

/// Errors raised by the process supervisor and process manager.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The request is missing a field or carries a malformed one.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A process with this name is already registered.
    #[error("process {0} already exists")]
    AlreadyExists(String),

    /// No process with this name is registered.
    #[error("cannot find process {0}")]
    NotFound(String),

    /// Not enough contiguous free ports in the range.
    #[error("cannot allocate {count} ports: port range exhausted")]
    PortsExhausted { count: i32 },

    /// The command could not be built or the process did not come up.
    #[error("failed to start process {name}: {reason}")]
    Start { name: String, reason: String },

    /// The log file could not be opened or read.
    #[error("log file of process {name}: {source}")]
    Log {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The signal name is not a known Unix signal.
    #[error("unknown signal {0}")]
    UnknownSignal(String),
}

impl From<ProcessError> for Status {
    fn from(err: ProcessError) -> Self {
        let message = err.to_string();
        match err {
            ProcessError::InvalidArgument(_) | ProcessError::UnknownSignal(_) => {
                Status::invalid_argument(message)
            }
            ProcessError::AlreadyExists(_) => Status::already_exists(message),
            ProcessError::NotFound(_) => Status::not_found(message),
            ProcessError::PortsExhausted { .. } => Status::resource_exhausted(message),
            ProcessError::Start { .. } | ProcessError::Log { .. } => Status::internal(message),
        }
    }
}
