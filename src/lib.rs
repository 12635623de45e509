//! MCP Proxy Library
//!
//! Resolves a single JSON configuration document from the environment and
//! serves every MCP server it describes behind one streamable HTTP endpoint.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;

pub use config::{Environment, ResolvedConfig, Settings};
pub use error::{Error, Result};
pub use lifecycle::Shutdown;
pub use proxy::{McpProxyFactory, ProxyFactory, ProxyHandle, Transport, PROXY_NAME};
