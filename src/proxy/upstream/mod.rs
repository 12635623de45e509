//! Upstream MCP server connections.
//!
//! # Data Flow
//! ```text
//! Aggregator
//!     → Upstream::request (lazy connect + handshake, per-request timeout)
//!     → stdio.rs (child process, newline-delimited JSON-RPC)
//!       or http.rs (streamable HTTP POST, JSON or SSE reply)
//! ```
//!
//! # Design Decisions
//! - Connect on first use; a failed connect is retried on the next call
//! - A connection that reports `Closed` is discarded so the next call respawns it
//! - An expired HTTP session is re-initialized and the request sent once more
//! - One connection per upstream, shared by every downstream session

pub mod http;
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::proxy::jsonrpc::ErrorObject;
use crate::proxy::server_config::ServerConfig;
use crate::proxy::LATEST_PROTOCOL_VERSION;

pub use self::http::HttpClient;
pub use self::stdio::StdioClient;

/// Error type for upstream operations.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("json-rpc error {}: {}", .0.code, .0.message)]
    Rpc(ErrorObject),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("upstream session expired")]
    SessionExpired,
}

#[derive(Debug)]
enum Client {
    Stdio(StdioClient),
    Http(HttpClient),
}

impl Client {
    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        match self {
            Client::Stdio(c) => c.request(method, params).await,
            Client::Http(c) => c.request(method, params).await,
        }
    }

    async fn notify(&self, method: &str, params: Option<&Value>) -> Result<(), UpstreamError> {
        match self {
            Client::Stdio(c) => c.notify(method, params).await,
            Client::Http(c) => c.notify(method, params).await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Client::Stdio(c) => c.is_closed(),
            Client::Http(_) => false,
        }
    }
}

/// An established, initialized connection.
#[derive(Debug)]
struct Connection {
    client: Client,
    capabilities: Value,
}

/// A named upstream server.
#[derive(Debug)]
pub struct Upstream {
    name: String,
    config: ServerConfig,
    client_name: String,
    timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl Upstream {
    /// `client_name` is announced to the server in `clientInfo`.
    pub fn new(name: String, config: ServerConfig, client_name: &str, timeout: Duration) -> Self {
        Self {
            name,
            config,
            client_name: client_name.to_string(),
            timeout,
            connection: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect now instead of on first use.
    pub async fn ensure_connected(&self) -> Result<(), UpstreamError> {
        self.connection().await.map(|_| ())
    }

    /// Whether the server advertised `capability` during the handshake.
    pub async fn supports(&self, capability: &str) -> Result<bool, UpstreamError> {
        let connection = self.connection().await?;
        Ok(connection
            .capabilities
            .get(capability)
            .is_some_and(|v| !v.is_null()))
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        match self.send(method, params.clone()).await {
            // The server never saw the request, so it is safe to send again.
            Err(UpstreamError::SessionExpired) => self.send(method, params).await,
            result => result,
        }
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let connection = self.connection().await?;
        let result = match tokio::time::timeout(self.timeout, connection.client.request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        };
        if matches!(result, Err(UpstreamError::Closed | UpstreamError::SessionExpired)) {
            self.discard(&connection).await;
        }
        result
    }

    /// Drop the connection, ending the remote session or killing the child.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        let Some(connection) = connection else {
            return;
        };
        if let Client::Http(client) = &connection.client {
            if let Err(e) = client.close().await {
                tracing::debug!(server = %self.name, error = %e, "Failed to close upstream session");
            }
        }
        tracing::debug!(server = %self.name, "Disconnected upstream");
    }

    async fn connection(&self) -> Result<Arc<Connection>, UpstreamError> {
        let mut slot = self.connection.lock().await;
        match slot.as_ref() {
            Some(connection) if connection.client.is_closed() => {
                tracing::warn!(server = %self.name, "Upstream process exited, respawning");
                *slot = None;
            }
            Some(connection) => return Ok(connection.clone()),
            None => {}
        }

        let connection = match tokio::time::timeout(self.timeout, self.connect()).await {
            Ok(result) => Arc::new(result?),
            Err(_) => return Err(UpstreamError::Timeout(self.timeout)),
        };
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn discard(&self, connection: &Arc<Connection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, connection)) {
            tracing::warn!(server = %self.name, "Upstream connection closed, will reconnect on next request");
            *slot = None;
        }
    }

    async fn connect(&self) -> Result<Connection, UpstreamError> {
        let client = match &self.config {
            ServerConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Client::Stdio(StdioClient::spawn(
                &self.name,
                command,
                args,
                env,
                cwd.as_deref(),
            )?),
            ServerConfig::Http { url, headers } => {
                Client::Http(HttpClient::new(url.clone(), headers, self.timeout)?)
            }
        };

        let params = json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = client.request("initialize", params).await?;

        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(LATEST_PROTOCOL_VERSION)
            .to_string();
        if let Client::Http(http) = &client {
            http.set_protocol_version(&protocol_version);
        }

        client.notify("notifications/initialized", None).await?;

        let upstream = result
            .pointer("/serverInfo/name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::info!(
            server = %self.name,
            transport = self.config.transport_label(),
            target = %self.config.target(),
            protocol_version = %protocol_version,
            upstream = %upstream,
            "Connected to upstream server"
        );

        Ok(Connection {
            client,
            capabilities: result.get("capabilities").cloned().unwrap_or_else(|| json!({})),
        })
    }
}
