//! Settings resolution.
//!
//! # Responsibilities
//! - Map environment variables onto a typed `Settings` record
//! - Enforce that exactly one configuration source is provided
//! - Apply defaults for everything else
//!
//! # Design Decisions
//! - Resolution is pure: it never touches the filesystem
//! - The source check runs before any other field is read, so a missing or
//!   conflicting source is reported even when `PORT` is also malformed
//! - The chosen source is stored as an enum, so a `Settings` value with zero
//!   or two sources cannot be constructed

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::env::Environment;
use crate::config::source::ConfigSource;

pub const HOST_VAR: &str = "HOST";
pub const PORT_VAR: &str = "PORT";
pub const CONFIG_VAR: &str = "CONFIG";
pub const CONFIG_JSON_VAR: &str = "CONFIG_JSON";
pub const CONFIG_JSON_B64_VAR: &str = "CONFIG_JSON_B64";
pub const CONFIG_PERSIST_PATH_VAR: &str = "CONFIG_PERSIST_PATH";
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";
pub const REQUEST_TIMEOUT_VAR: &str = "REQUEST_TIMEOUT_SECS";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Configuration-source variables, in precedence-free check order.
const SOURCE_VARS: [&str; 3] = [CONFIG_VAR, CONFIG_JSON_VAR, CONFIG_JSON_B64_VAR];

/// Error type for settings resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("no configuration source provided: set one of CONFIG, CONFIG_JSON or CONFIG_JSON_B64")]
    MissingConfigSource,

    #[error("conflicting configuration sources: only one of CONFIG, CONFIG_JSON or CONFIG_JSON_B64 may be set, found {}", .sources.join(" and "))]
    ConflictingConfigSource { sources: Vec<&'static str> },

    #[error("invalid PORT value {value:?}: expected an integer between 0 and 65535")]
    InvalidPort { value: String },

    #[error("invalid REQUEST_TIMEOUT_SECS value {value:?}: expected a positive integer")]
    InvalidTimeout { value: String },
}

/// Validated process settings.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    /// Bind address for the listener.
    pub host: String,

    /// Bind port for the listener.
    pub port: u16,

    /// The single configuration source.
    pub source: ConfigSource,

    /// When set, inline configuration is written here and read back.
    pub persist_path: Option<PathBuf>,

    /// Default log level when `RUST_LOG` is not set.
    pub log_level: String,

    /// Deadline for each upstream request.
    pub request_timeout: Duration,
}

impl Settings {
    /// Resolve settings from an environment snapshot.
    pub fn resolve(env: &Environment) -> Result<Self, SettingsError> {
        let source = resolve_source(env)?;

        let host = env.get(HOST_VAR).unwrap_or(DEFAULT_HOST).to_string();

        let port = match env.get(PORT_VAR) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| SettingsError::InvalidPort {
                value: raw.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let request_timeout = match env.get(REQUEST_TIMEOUT_VAR) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(SettingsError::InvalidTimeout {
                        value: raw.to_string(),
                    })
                }
            },
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        Ok(Self {
            host,
            port,
            source,
            persist_path: env.get(CONFIG_PERSIST_PATH_VAR).map(PathBuf::from),
            log_level: env.get(LOG_LEVEL_VAR).unwrap_or(DEFAULT_LOG_LEVEL).to_string(),
            request_timeout,
        })
    }

    /// The `host:port` pair the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Inline configuration may carry credentials for upstream servers.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("source", &self.source.kind())
            .field("persist_path", &self.persist_path)
            .field("log_level", &self.log_level)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn resolve_source(env: &Environment) -> Result<ConfigSource, SettingsError> {
    let present: Vec<&'static str> = SOURCE_VARS
        .iter()
        .copied()
        .filter(|name| env.is_set(name))
        .collect();

    match present.as_slice() {
        [] => Err(SettingsError::MissingConfigSource),
        [name] => {
            let value = env.get(name).unwrap_or_default().to_string();
            Ok(match *name {
                CONFIG_VAR => ConfigSource::File(PathBuf::from(value)),
                CONFIG_JSON_VAR => ConfigSource::Inline(value),
                _ => ConfigSource::InlineBase64(value),
            })
        }
        _ => Err(SettingsError::ConflictingConfigSource { sources: present }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        Environment::from_vars(pairs.iter().copied())
    }

    #[test]
    fn test_missing_source_fails() {
        let err = Settings::resolve(&env(&[])).unwrap_err();
        assert_eq!(err, SettingsError::MissingConfigSource);
    }

    #[test]
    fn test_missing_source_ignores_host_and_port() {
        // A broken PORT is never consulted when no source is set.
        let err = Settings::resolve(&env(&[("HOST", "127.0.0.1"), ("PORT", "not-a-port")]))
            .unwrap_err();
        assert_eq!(err, SettingsError::MissingConfigSource);
    }

    #[test]
    fn test_empty_sources_count_as_missing() {
        let err = Settings::resolve(&env(&[("CONFIG", ""), ("CONFIG_JSON", "")])).unwrap_err();
        assert_eq!(err, SettingsError::MissingConfigSource);
    }

    #[test]
    fn test_every_pair_conflicts() {
        let pairs = [
            (CONFIG_VAR, CONFIG_JSON_VAR),
            (CONFIG_VAR, CONFIG_JSON_B64_VAR),
            (CONFIG_JSON_VAR, CONFIG_JSON_B64_VAR),
        ];
        for (a, b) in pairs {
            let err = Settings::resolve(&env(&[(a, "x"), (b, "y")])).unwrap_err();
            assert_eq!(
                err,
                SettingsError::ConflictingConfigSource { sources: vec![a, b] },
                "{a} + {b}"
            );
            let message = err.to_string();
            assert!(message.contains(&format!("found {a} and {b}")), "{message}");
        }
    }

    #[test]
    fn test_all_three_conflict() {
        let err = Settings::resolve(&env(&[
            ("CONFIG", "/tmp/c.json"),
            ("CONFIG_JSON", "{}"),
            ("CONFIG_JSON_B64", "e30="),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            SettingsError::ConflictingConfigSource {
                sources: vec![CONFIG_VAR, CONFIG_JSON_VAR, CONFIG_JSON_B64_VAR]
            }
        );
        assert!(err.to_string().contains("CONFIG and CONFIG_JSON and CONFIG_JSON_B64"));
    }

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::resolve(&env(&[("CONFIG_JSON", "{}")])).unwrap();
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.source, ConfigSource::Inline("{}".into()));
        assert_eq!(settings.persist_path, None);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.request_timeout, Duration::from_secs(60));
        assert_eq!(settings.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_each_source_kind_selected() {
        let s = Settings::resolve(&env(&[("config", "/etc/mcp.json")])).unwrap();
        assert_eq!(s.source, ConfigSource::File(PathBuf::from("/etc/mcp.json")));

        let s = Settings::resolve(&env(&[("CONFIG_JSON_B64", "e30=")])).unwrap();
        assert_eq!(s.source, ConfigSource::InlineBase64("e30=".into()));
    }

    #[test]
    fn test_overrides_parsed() {
        let settings = Settings::resolve(&env(&[
            ("CONFIG_JSON", "{}"),
            ("HOST", "127.0.0.1"),
            ("PORT", "9191"),
            ("LOG_LEVEL", "debug"),
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("CONFIG_PERSIST_PATH", "config.json"),
        ]))
        .unwrap();
        assert_eq!(settings.bind_address(), "127.0.0.1:9191");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.persist_path, Some(PathBuf::from("config.json")));
    }

    #[test]
    fn test_invalid_port_rejected() {
        for bad in ["eighty", "65536", "-1"] {
            let err = Settings::resolve(&env(&[("CONFIG_JSON", "{}"), ("PORT", bad)])).unwrap_err();
            assert_eq!(err, SettingsError::InvalidPort { value: bad.into() });
        }
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = Settings::resolve(&env(&[("CONFIG_JSON", "{}"), ("REQUEST_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert_eq!(err, SettingsError::InvalidTimeout { value: "0".into() });
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let environment = env(&[("CONFIG_JSON", r#"{"mcpServers":{}}"#), ("PORT", "7000")]);
        let first = Settings::resolve(&environment).unwrap();
        let second = Settings::resolve(&environment).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_debug_hides_inline_config() {
        let settings =
            Settings::resolve(&env(&[("CONFIG_JSON", r#"{"token":"secret"}"#)])).unwrap();
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("CONFIG_JSON"));
    }
}
