//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! .env file (optional, never overrides real variables)
//!     → env.rs (case-insensitive snapshot of the environment)
//!     → settings.rs (exactly-one-source check, defaults)
//!     → Settings (validated, immutable)
//!     → source.rs (read / decode / optionally persist the JSON document)
//!     → ResolvedConfig (handed to the proxy factory)
//! ```
//!
//! # Design Decisions
//! - Settings are resolved once at process entry and passed explicitly
//! - Resolution is pure; all filesystem work happens in materialization
//! - The JSON document is opaque here; the proxy engine owns its schema

pub mod env;
pub mod settings;
pub mod source;

pub use env::Environment;
pub use settings::{Settings, SettingsError};
pub use source::{materialize, ConfigSource, MaterializeError, ResolvedConfig};
