//! Environment snapshot.
//!
//! # Responsibilities
//! - Capture environment variables once, at process entry
//! - Match names case-insensitively (`port`, `Port` and `PORT` are the same key)
//! - Optionally pre-load a `.env` file before the snapshot is taken
//!
//! # Design Decisions
//! - Nothing downstream reads `std::env` directly; tests build an
//!   `Environment` from literal pairs instead of mutating the process

use std::collections::BTreeMap;
use std::path::Path;

/// Error raised while loading an environment-definition file.
#[derive(Debug, thiserror::Error)]
#[error("failed to load env file {path}: {source}")]
pub struct EnvFileError {
    pub path: String,
    #[source]
    pub source: dotenvy::Error,
}

/// Load variables from an env file into the process environment.
///
/// Existing process variables are never overridden. When `required` is
/// false a missing file is silently skipped; any other failure (for example
/// a malformed line) is still reported.
pub fn load_env_file(path: &Path, required: bool) -> Result<bool, EnvFileError> {
    match dotenvy::from_path(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Loaded env file");
            Ok(true)
        }
        Err(e) if !required && e.not_found() => Ok(false),
        Err(source) => Err(EnvFileError {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// A case-insensitive, immutable snapshot of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Snapshot the current process environment.
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.into_string().ok()?))
        }))
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_uppercase(), v.into()))
            .collect();
        Self { vars }
    }

    /// Look up a variable, treating an empty value as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether the variable is set to a non-empty value.
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
