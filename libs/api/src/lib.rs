//! # strata-api
//!
//! Request and response types shared by the strata instance agent and the
//! services it talks to.
//!
//! ## Layout
//!
//! - `kinds`: backend kind, instance kind and process state enums
//! - `instance`: the uniform instance surface (create/delete/get/list/replace/log/watch)
//! - `process`: the local process-management service
//! - `spdk`: the SPDK engine/replica service
//!
//! Every type is plain data with serde derives. Wire enums are encoded as
//! snake_case strings; unit kinds travel as raw strings so that an unknown
//! kind reaches the agent and is rejected there with a proper status.

mod error;
pub mod instance;
pub mod kinds;
pub mod process;
pub mod spdk;

pub use error::KindError;
pub use instance::*;
pub use kinds::{BackendKind, InstanceKind, ProcessState};
