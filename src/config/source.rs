//! Configuration materialization.
//!
//! # Responsibilities
//! - Turn the selected `ConfigSource` into a decoded JSON document
//! - Optionally persist inline configuration to disk before reading it back
//!
//! # Design Decisions
//! - No shape validation here; the proxy factory owns the document schema
//! - Persistence is an explicit step of materialization, never of
//!   settings resolution

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::string::FromUtf8Error;

use base64::Engine as _;
use serde_json::Value;

use crate::config::settings::{Settings, CONFIG_JSON_B64_VAR, CONFIG_JSON_VAR, CONFIG_VAR};

/// Where the proxy configuration comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path to a JSON file (`CONFIG`).
    File(PathBuf),
    /// Literal JSON text (`CONFIG_JSON`).
    Inline(String),
    /// Base64 of UTF-8 JSON text (`CONFIG_JSON_B64`).
    InlineBase64(String),
}

impl ConfigSource {
    /// Name of the environment variable this source came from.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigSource::File(_) => CONFIG_VAR,
            ConfigSource::Inline(_) => CONFIG_JSON_VAR,
            ConfigSource::InlineBase64(_) => CONFIG_JSON_B64_VAR,
        }
    }
}

impl std::fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => f.debug_tuple("File").field(path).finish(),
            ConfigSource::Inline(text) => write!(f, "Inline(<{} bytes>)", text.len()),
            ConfigSource::InlineBase64(text) => write!(f, "InlineBase64(<{} bytes>)", text.len()),
        }
    }
}

/// Error type for configuration materialization.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("config file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed JSON in {origin}: {source}")]
    MalformedJson {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed base64 in CONFIG_JSON_B64: {0}")]
    MalformedBase64(#[from] base64::DecodeError),

    #[error("CONFIG_JSON_B64 does not decode to UTF-8 text: {0}")]
    MalformedEncoding(#[from] FromUtf8Error),

    #[error("failed to persist inline config to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The decoded configuration document.
///
/// Its schema belongs to the proxy factory; this type only guarantees the
/// content is syntactically valid JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig(Value);

impl ResolvedConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Materialize the configuration document selected by `settings`.
pub fn materialize(settings: &Settings) -> Result<ResolvedConfig, MaterializeError> {
    let source = &settings.source;

    if let Some(persist_path) = settings.persist_path.as_deref() {
        if let Some(text) = inline_text(source)? {
            persist(persist_path, &text)?;
            tracing::info!(
                path = %persist_path.display(),
                source = source.kind(),
                "Persisted inline configuration"
            );
            return read_file(persist_path);
        }
    }

    match source {
        ConfigSource::File(path) => read_file(path),
        ConfigSource::Inline(text) => parse_json(text, CONFIG_JSON_VAR),
        ConfigSource::InlineBase64(encoded) => {
            let text = decode_base64(encoded)?;
            parse_json(&text, CONFIG_JSON_B64_VAR)
        }
    }
}

/// Decoded text of an inline source, or `None` for file sources.
fn inline_text(source: &ConfigSource) -> Result<Option<String>, MaterializeError> {
    match source {
        ConfigSource::File(_) => Ok(None),
        ConfigSource::Inline(text) => Ok(Some(text.clone())),
        ConfigSource::InlineBase64(encoded) => decode_base64(encoded).map(Some),
    }
}

fn decode_base64(encoded: &str) -> Result<String, MaterializeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    Ok(String::from_utf8(bytes)?)
}

fn read_file(path: &Path) -> Result<ResolvedConfig, MaterializeError> {
    let content = fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => MaterializeError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => MaterializeError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    parse_json(&content, &path.display().to_string())
}

fn parse_json(text: &str, origin: &str) -> Result<ResolvedConfig, MaterializeError> {
    serde_json::from_str(text)
        .map(ResolvedConfig)
        .map_err(|source| MaterializeError::MalformedJson {
            origin: origin.to_string(),
            source,
        })
}

/// Overwrite `path` with `text`. The handle is closed when `fs::write` returns.
fn persist(path: &Path, text: &str) -> Result<(), MaterializeError> {
    fs::write(path, text).map_err(|source| MaterializeError::Persist {
        path: path.to_path_buf(),
        source,
    })
}
