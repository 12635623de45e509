//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber once at process start
//! - Derive the filter from `RUST_LOG`, or from `LOG_LEVEL` when unset
//!
//! # Design Decisions
//! - Logs go to stderr so `check` output on stdout stays clean
//! - `RUST_LOG` wins over `LOG_LEVEL` for fine-grained directives

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub fn default_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    format!("mcp_proxy={level},tower_http={level}")
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .unwrap_or_else(|_| EnvFilter::new(default_directives(crate::config::settings::DEFAULT_LOG_LEVEL)))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(level: &str) {
    let result = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();

    if result.is_ok() {
        tracing::debug!(level, "Logging initialized");
    }
}
