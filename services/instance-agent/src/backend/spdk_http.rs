//! HTTP/JSON client for the SPDK service.
//!
//! Resources live under `/v1/engines` and `/v1/replicas`. The `watch`
//! endpoints keep the response open and write one line per change.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use strata_api::spdk::{Engine, EngineCreateRequest, Replica, ReplicaCreateRequest};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, error};

use crate::backend::{close_aware, BackendClient, NotifyStream, SpdkClient, SpdkConnector};
use crate::process::logs::lossy_lines;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens one [`HttpSpdkClient`] per call.
#[derive(Debug, Clone)]
pub struct HttpSpdkConnector {
    base_url: String,
}

impl HttpSpdkConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SpdkConnector for HttpSpdkConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn SpdkClient>> {
        Ok(Arc::new(HttpSpdkClient::new(&self.base_url)?))
    }
}

/// SPDK service client.
pub struct HttpSpdkClient {
    client: reqwest::Client,
    base_url: String,
    closed: CancellationToken,
}

impl HttpSpdkClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build SPDK HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            closed: CancellationToken::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn ensure_open(&self) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            return Err(Status::cancelled("SPDK client is closed"));
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Status> {
        self.ensure_open()?;
        let url = self.url(path);
        debug!(url = %url, "SPDK GET");

        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_status)?;
        decode(check(response).await?).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, Status>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        self.ensure_open()?;
        let url = self.url(path);
        debug!(url = %url, "SPDK POST");

        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_status)?;
        decode(check(response).await?).await
    }

    async fn delete(&self, path: &str) -> Result<(), Status> {
        self.ensure_open()?;
        let url = self.url(path);
        debug!(url = %url, "SPDK DELETE");

        let response = self
            .client
            .delete(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_status)?;
        check(response).await?;
        Ok(())
    }

    /// Open a watch endpoint; every received line is one notification.
    async fn watch(&self, path: &str) -> Result<NotifyStream, Status> {
        self.ensure_open()?;
        let url = self.url(path);
        debug!(url = %url, "SPDK watch");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_status)?;
        let response = check(response).await?;

        let body = response.bytes_stream().map_err(io::Error::other);
        let lines = lossy_lines(Box::pin(StreamReader::new(body))).map(|line| {
            line.map(|_| ())
                .map_err(|e| Status::unavailable(format!("SPDK watch stream failed: {e}")))
        });

        Ok(close_aware(Box::pin(lines), self.closed.clone()))
    }
}

impl BackendClient for HttpSpdkClient {
    fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl SpdkClient for HttpSpdkClient {
    async fn engine_create(&self, req: EngineCreateRequest) -> Result<Engine, Status> {
        self.post_json("engines", &req).await
    }

    async fn engine_delete(&self, name: &str) -> Result<(), Status> {
        self.delete(&format!("engines/{name}")).await
    }

    async fn engine_get(&self, name: &str) -> Result<Engine, Status> {
        self.get_json(&format!("engines/{name}")).await
    }

    async fn engine_list(&self) -> Result<HashMap<String, Engine>, Status> {
        self.get_json("engines").await
    }

    async fn engine_watch(&self) -> Result<NotifyStream, Status> {
        self.watch("engines/watch").await
    }

    async fn replica_create(&self, req: ReplicaCreateRequest) -> Result<Replica, Status> {
        self.post_json("replicas", &req).await
    }

    async fn replica_delete(&self, name: &str, cleanup_required: bool) -> Result<(), Status> {
        self.delete(&format!("replicas/{name}?cleanup_required={cleanup_required}"))
            .await
    }

    async fn replica_get(&self, name: &str) -> Result<Replica, Status> {
        self.get_json(&format!("replicas/{name}")).await
    }

    async fn replica_list(&self) -> Result<HashMap<String, Replica>, Status> {
        self.get_json("replicas").await
    }

    async fn replica_watch(&self) -> Result<NotifyStream, Status> {
        self.watch("replicas/watch").await
    }
}

/// Pass successful responses through; turn error responses into a status.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, Status> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "SPDK request failed");
    Err(status_for(status, body))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Status> {
    response
        .json()
        .await
        .map_err(|e| Status::internal(format!("invalid SPDK response: {e}")))
}

fn status_for(code: StatusCode, body: String) -> Status {
    let message = if body.is_empty() {
        code.to_string()
    } else {
        body
    };
    match code {
        StatusCode::BAD_REQUEST => Status::invalid_argument(message),
        StatusCode::NOT_FOUND => Status::not_found(message),
        StatusCode::CONFLICT => Status::already_exists(message),
        StatusCode::NOT_IMPLEMENTED => Status::unimplemented(message),
        StatusCode::SERVICE_UNAVAILABLE => Status::unavailable(message),
        _ => Status::internal(message),
    }
}

fn transport_status(err: reqwest::Error) -> Status {
    Status::unavailable(format!("SPDK service unreachable: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tonic::Code;

    #[rstest]
    #[case(StatusCode::BAD_REQUEST, Code::InvalidArgument)]
    #[case(StatusCode::NOT_FOUND, Code::NotFound)]
    #[case(StatusCode::CONFLICT, Code::AlreadyExists)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, Code::Unavailable)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, Code::Internal)]
    fn test_status_for(#[case] http: StatusCode, #[case] code: Code) {
        assert_eq!(status_for(http, "boom".to_string()).code(), code);
    }

    #[test]
    fn test_empty_body_uses_reason() {
        let status = status_for(StatusCode::NOT_FOUND, String::new());
        assert_eq!(status.message(), "404 Not Found");
    }

    #[test]
    fn test_urls() {
        let client = HttpSpdkClient::new("http://127.0.0.1:8504/").unwrap();
        assert_eq!(client.url("engines"), "http://127.0.0.1:8504/v1/engines");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // nothing listens on the discard port
        let client = HttpSpdkClient::new("http://127.0.0.1:9").unwrap();
        let err = client.engine_get("vol-a-e-0").await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_watch_line_with_invalid_utf8_is_a_notification() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let mut read = 0;
            while !request[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut request[read..]).await.unwrap();
                if n == 0 {
                    return;
                }
                read += n;
            }

            let body: &[u8] = b"vol-a-e-0\n\xff\xfe\nvol-a-e-1\n";
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let client = HttpSpdkClient::new(&format!("http://{addr}")).unwrap();
        let items: Vec<Result<(), Status>> = client.engine_watch().await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn test_closed_client_refuses_calls() {
        let client = HttpSpdkClient::new("http://127.0.0.1:9").unwrap();
        client.close();
        let err = client.replica_list().await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }
}
