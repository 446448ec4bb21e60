//! Error types for parsing wire enums.

use thiserror::Error;

/// Errors that can occur when parsing a kind from its wire representation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KindError {
    /// The value does not name a backend kind.
    #[error("unsupported backend kind {0}")]
    UnknownBackend(String),

    /// The value does not name an instance kind.
    #[error("unknown instance type {0}")]
    UnknownInstance(String),

    /// The value does not name a process state.
    #[error("unknown process state {0}")]
    UnknownState(String),
}

impl KindError {
    /// Returns true if this error is about the backend kind.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, KindError::UnknownBackend(_))
    }
}
