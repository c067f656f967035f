//! Plugin RPC over a Unix domain socket
//!
//! One JSON document per line in each direction. A request is
//! `{"method": "...", "params": ...}`; a response is `{"result": ...}` or
//! `{"error": "..."}`. Calls are strictly sequential on one connection.

use brigade_core::domain::plugin::{PluginManifest, PluginResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Marker some plugin runtimes use when the connection is being torn down
const TRANSPORT_CLOSING: &str = "transport is closing";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", TRANSPORT_CLOSING)]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Remote(String),

    #[error("no response after {0:?}")]
    Timeout(Duration),
}

impl RpcError {
    /// Whether the error only says the other side already went away
    pub fn is_transport_closing(&self) -> bool {
        match self {
            RpcError::Closed => true,
            RpcError::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            RpcError::Remote(message) | RpcError::Protocol(message) => {
                message.contains(TRANSPORT_CLOSING)
            }
            RpcError::Timeout(_) => false,
        }
    }
}

/// Requests understood by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PluginRequest {
    Manifest,
    WorkerHttpPort { port: u16 },
    Run { options: HashMap<String, String> },
    Stop,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client end of a plugin connection
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl RpcClient {
    /// Connects to the plugin socket at `address`
    ///
    /// `timeout` bounds every call except `run`.
    pub async fn connect(address: &Path, timeout: Duration) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(address))
            .await
            .map_err(|_| RpcError::Timeout(timeout))??;
        let (read, write) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            timeout,
        })
    }

    pub async fn manifest(&mut self) -> Result<PluginManifest, RpcError> {
        self.call_with_timeout(&PluginRequest::Manifest).await
    }

    /// Tells the plugin where the worker's side-car HTTP interface listens
    pub async fn worker_http_port(&mut self, port: u16) -> Result<(), RpcError> {
        let _: JsonValue = self
            .call_with_timeout(&PluginRequest::WorkerHttpPort { port })
            .await?;
        Ok(())
    }

    /// Runs the plugin; not bounded by the call timeout
    pub async fn run(&mut self, options: HashMap<String, String>) -> Result<PluginResult, RpcError> {
        self.call(&PluginRequest::Run { options }).await
    }

    /// Asks the plugin to shut down
    pub async fn stop(&mut self) -> Result<(), RpcError> {
        let _: JsonValue = self.call_with_timeout(&PluginRequest::Stop).await?;
        Ok(())
    }

    async fn call_with_timeout<T: DeserializeOwned>(
        &mut self,
        request: &PluginRequest,
    ) -> Result<T, RpcError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.call(request))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }

    async fn call<T: DeserializeOwned>(&mut self, request: &PluginRequest) -> Result<T, RpcError> {
        let mut payload =
            serde_json::to_vec(request).map_err(|e| RpcError::Protocol(e.to_string()))?;
        payload.push(b'\n');
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(RpcError::Closed);
        }

        let response: RpcResponse = serde_json::from_str(line.trim_end())
            .map_err(|e| RpcError::Protocol(format!("invalid response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(RpcError::Remote(error));
        }

        serde_json::from_value(response.result.unwrap_or(JsonValue::Null))
            .map_err(|e| RpcError::Protocol(format!("unexpected result: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePluginServer, ServerBehavior};

    #[test]
    fn test_request_wire_format() {
        let manifest = serde_json::to_value(PluginRequest::Manifest).unwrap();
        assert_eq!(manifest, serde_json::json!({"method": "manifest"}));

        let port = serde_json::to_value(PluginRequest::WorkerHttpPort { port: 8090 }).unwrap();
        assert_eq!(
            port,
            serde_json::json!({"method": "worker_http_port", "params": {"port": 8090}})
        );
    }

    #[test]
    fn test_transport_closing_classification() {
        assert!(RpcError::Closed.is_transport_closing());
        assert!(RpcError::Io(ErrorKind::BrokenPipe.into()).is_transport_closing());
        assert!(
            RpcError::Remote("rpc error: code = Unavailable desc = transport is closing".into())
                .is_transport_closing()
        );
        assert!(!RpcError::Remote("boom".into()).is_transport_closing());
        assert!(!RpcError::Timeout(Duration::from_secs(1)).is_transport_closing());
    }

    #[tokio::test]
    async fn test_manifest_and_run() {
        let server = FakePluginServer::start(ServerBehavior::default());
        let mut client = RpcClient::connect(server.address(), Duration::from_secs(5))
            .await
            .unwrap();

        let manifest = client.manifest().await.unwrap();
        assert_eq!(manifest.name, "fake");

        client.worker_http_port(8090).await.unwrap();

        let mut options = HashMap::new();
        options.insert("message".to_string(), "hi".to_string());
        let result = client.run(options).await.unwrap();
        assert_eq!(result.status, "Success");
        assert_eq!(result.outputs.get("echo").map(String::as_str), Some("hi"));

        client.stop().await.unwrap();
        assert_eq!(server.requests().await.len(), 4);
    }

    #[tokio::test]
    async fn test_remote_error_is_reported() {
        let server = FakePluginServer::start(ServerBehavior {
            fail_run: Some("no such file".to_string()),
            ..Default::default()
        });
        let mut client = RpcClient::connect(server.address(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = client.run(HashMap::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m == "no such file"));
    }

    #[tokio::test]
    async fn test_stop_on_closing_server_is_transport_closing() {
        let server = FakePluginServer::start(ServerBehavior {
            close_on_stop: true,
            ..Default::default()
        });
        let mut client = RpcClient::connect(server.address(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = client.stop().await.unwrap_err();
        assert!(err.is_transport_closing(), "{:?}", err);
    }
}
