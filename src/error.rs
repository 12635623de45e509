//! Crate-level error type.

use crate::config::env::EnvFileError;
use crate::config::{MaterializeError, SettingsError};
use crate::proxy::StartupError;

/// Any error that ends the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    EnvFile(#[from] EnvFileError),

    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("failed to load configuration: {0}")]
    Materialize(#[from] MaterializeError),

    #[error("failed to start proxy: {0}")]
    Startup(#[from] StartupError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
