//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (server, session_id, method)
//!     → http::server TraceLayer spans carrying x-request-id
//!
//! Consumer:
//!     → logging.rs (EnvFilter + fmt layer on stderr)
//! ```

pub mod logging;
