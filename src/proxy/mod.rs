//! MCP proxy engine.
//!
//! # Data Flow
//! ```text
//! ResolvedConfig
//!     → ProxyFactory::construct (server_config.rs parses "mcpServers")
//!     → McpProxy (Aggregator over one Upstream per server)
//!     → ProxyHandle::run (bind host:port, serve streamable HTTP)
//!
//! Downstream request
//!     → http::server (session check, JSON-RPC decode)
//!     → aggregator.rs (local answer, or route by name / URI)
//!     → upstream/ (stdio child or streamable HTTP server)
//! ```
//!
//! # Design Decisions
//! - Startup code only sees the `ProxyFactory` / `ProxyHandle` traits
//! - Construction is synchronous and validates the document shape;
//!   upstreams are contacted only once the listener is running

pub mod aggregator;
pub mod jsonrpc;
pub mod server_config;
pub mod upstream;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::{ResolvedConfig, Settings};
use crate::http::{HttpOptions, McpHttpServer};

pub use aggregator::Aggregator;
pub use server_config::ServerConfig;
pub use upstream::{Upstream, UpstreamError};

/// Display name announced to clients in `serverInfo`.
pub const PROXY_NAME: &str = "Bango29 MCP Proxy";

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// Listener transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    StreamableHttp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

/// Error type for proxy construction and listener startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid proxy configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Builds a runnable proxy from a resolved configuration document.
pub trait ProxyFactory {
    type Handle: ProxyHandle;

    fn construct(&self, config: &ResolvedConfig, name: &str) -> Result<Self::Handle, StartupError>;
}

/// A constructed proxy, ready to serve.
pub trait ProxyHandle {
    /// Serve until `shutdown` resolves. Returns `Ok` after a graceful stop.
    fn run<S>(
        self,
        transport: Transport,
        host: &str,
        port: u16,
        shutdown: S,
    ) -> impl Future<Output = Result<(), StartupError>> + Send
    where
        S: Future<Output = ()> + Send + 'static;
}

/// The built-in MCP proxy factory.
#[derive(Debug, Clone)]
pub struct McpProxyFactory {
    request_timeout: Duration,
}

impl McpProxyFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.request_timeout)
    }
}

impl ProxyFactory for McpProxyFactory {
    type Handle = McpProxy;

    fn construct(&self, config: &ResolvedConfig, name: &str) -> Result<McpProxy, StartupError> {
        let servers = server_config::parse_servers(config.as_value())?;
        if servers.is_empty() {
            tracing::warn!("No upstream servers configured, the proxy will expose an empty catalogue");
        }

        let upstreams = servers
            .iter()
            .map(|(server, cfg)| Upstream::new(server.clone(), cfg.clone(), name, self.request_timeout))
            .collect();

        Ok(McpProxy {
            aggregator: Arc::new(Aggregator::new(name, upstreams)),
            servers,
        })
    }
}

/// Handle returned by [`McpProxyFactory`].
#[derive(Debug)]
pub struct McpProxy {
    aggregator: Arc<Aggregator>,
    servers: BTreeMap<String, ServerConfig>,
}

impl McpProxy {
    pub fn name(&self) -> &str {
        self.aggregator.name()
    }

    pub fn servers(&self) -> &BTreeMap<String, ServerConfig> {
        &self.servers
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.aggregator.clone()
    }

    /// Serve on an already-bound listener.
    pub async fn serve<S>(self, listener: TcpListener, shutdown: S) -> Result<(), StartupError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let warm = self.aggregator.clone();
        tokio::spawn(async move { warm.warm_up().await });

        let server = McpHttpServer::new(self.aggregator.clone(), HttpOptions::default());
        let result = server.run(listener, shutdown).await.map_err(StartupError::Serve);

        self.aggregator.shutdown().await;
        result
    }
}

impl ProxyHandle for McpProxy {
    async fn run<S>(
        self,
        transport: Transport,
        host: &str,
        port: u16,
        shutdown: S,
    ) -> Result<(), StartupError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let address = format!("{host}:{port}");
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| StartupError::Bind {
                address: address.clone(),
                source,
            })?;

        tracing::info!(
            address = %listener.local_addr().map(|a| a.to_string()).unwrap_or(address),
            transport = %transport,
            name = self.name(),
            servers = self.servers.len(),
            "MCP proxy listening"
        );

        self.serve(listener, shutdown).await
    }
}
