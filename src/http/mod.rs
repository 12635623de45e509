//! Downstream HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, request ID, body limit, tracing)
//!     → session.rs (Mcp-Session-Id lookup)
//!     → proxy::Aggregator (JSON-RPC dispatch)
//!     → JSON reply, or 202 for notifications
//! ```

pub mod server;
pub mod session;

pub use server::{AppState, McpHttpServer};
pub use session::{SessionLimitReached, SessionStore};

use std::time::Duration;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
pub const X_REQUEST_ID: &str = "x-request-id";

/// Default cap on request body size.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Listener-side options for the MCP endpoint.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Endpoint path; a trailing-slash variant is routed too.
    pub path: String,
    pub max_body_bytes: usize,
    /// Sessions unused for this long are expired.
    pub session_idle_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            path: "/mcp".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}
