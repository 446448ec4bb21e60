//! The uniform instance surface.
//!
//! - `process_ops` / `spdk_ops`: one [`InstanceOps`] adapter per backend kind
//! - `dispatch`: routes each request to the adapter for its backend kind
//! - `watch`: fans the backend watch streams into one notification stream

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use strata_api::{
    InstanceCreateRequest, InstanceDeleteRequest, InstanceGetRequest, InstanceLogRequest,
    InstanceReplaceRequest, InstanceResponse,
};
use tonic::Status;

use crate::backend::LogStream;

pub mod dispatch;
pub mod process_ops;
pub mod spdk_ops;
pub mod watch;

pub use dispatch::InstanceDispatcher;
pub use process_ops::ProcessOps;
pub use spdk_ops::SpdkOps;
pub use watch::{WatchClients, WatchConfig};

/// Instance operations implemented by each backend adapter.
#[async_trait]
pub trait InstanceOps: Send + Sync {
    async fn create(&self, req: InstanceCreateRequest) -> Result<InstanceResponse, Status>;

    async fn delete(&self, req: InstanceDeleteRequest) -> Result<InstanceResponse, Status>;

    async fn get(&self, req: InstanceGetRequest) -> Result<InstanceResponse, Status>;

    /// Insert every instance of this backend into `instances`, keyed by name.
    async fn list(&self, instances: &mut HashMap<String, InstanceResponse>) -> Result<(), Status>;

    async fn replace(&self, req: InstanceReplaceRequest) -> Result<InstanceResponse, Status>;

    /// Lines of the instance's log. The stream ends after the first error.
    async fn log(&self, req: InstanceLogRequest) -> Result<LogStream, Status>;
}

/// Forward items until the first error, which is yielded last.
pub(crate) fn until_error(inner: LogStream) -> LogStream {
    Box::pin(futures_util::stream::unfold(Some(inner), |state| async move {
        let mut inner = state?;
        match inner.next().await? {
            Ok(line) => Some((Ok(line), Some(inner))),
            Err(status) => Some((Err(status), None)),
        }
    }))
}
