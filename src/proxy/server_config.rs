//! Upstream server definitions.
//!
//! Parses the `mcpServers` map of a resolved configuration document:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files":  { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "/data"] },
//!     "search": { "url": "https://search.example.com/mcp", "headers": { "Authorization": "Bearer ..." } }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::proxy::StartupError;

/// A single upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerConfig {
    /// A local process speaking newline-delimited JSON-RPC on stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    /// A remote server reachable over streamable HTTP.
    Http {
        url: Url,
        headers: BTreeMap<String, String>,
    },
}

impl ServerConfig {
    /// Short transport label for logs and `check` output.
    pub fn transport_label(&self) -> &'static str {
        match self {
            ServerConfig::Stdio { .. } => "stdio",
            ServerConfig::Http { .. } => "streamable-http",
        }
    }

    /// Command line or URL, for logs and `check` output.
    pub fn target(&self) -> String {
        match self {
            ServerConfig::Stdio { command, args, .. } => {
                std::iter::once(command.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            ServerConfig::Http { url, .. } => url.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServer {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "type")]
    transport: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Parse the `mcpServers` map. Names are returned in sorted order.
pub fn parse_servers(document: &Value) -> Result<BTreeMap<String, ServerConfig>, StartupError> {
    let servers = document
        .as_object()
        .ok_or_else(|| invalid("configuration must be a JSON object"))?
        .get("mcpServers")
        .ok_or_else(|| invalid("configuration has no \"mcpServers\" entry"))?
        .as_object()
        .ok_or_else(|| invalid("\"mcpServers\" must be an object"))?;

    let mut parsed = BTreeMap::new();
    for (name, raw) in servers {
        if name.trim().is_empty() {
            return Err(invalid("server names must not be empty"));
        }
        let raw: RawServer = serde_json::from_value(raw.clone())
            .map_err(|e| invalid(format!("server \"{name}\": {e}")))?;
        parsed.insert(name.clone(), parse_server(name, raw)?);
    }
    Ok(parsed)
}

fn parse_server(name: &str, raw: RawServer) -> Result<ServerConfig, StartupError> {
    let transport = raw.transport.as_deref().map(str::to_ascii_lowercase);

    match transport.as_deref() {
        Some("sse") => {
            return Err(invalid(format!(
                "server \"{name}\": the legacy \"sse\" transport is not supported, use streamable HTTP"
            )))
        }
        None | Some("stdio") | Some("http") | Some("streamable-http") | Some("streamable_http") => {}
        Some(other) => {
            return Err(invalid(format!(
                "server \"{name}\": unknown transport \"{other}\""
            )))
        }
    }

    match (raw.command, raw.url) {
        (Some(_), Some(_)) => Err(invalid(format!(
            "server \"{name}\": set either \"command\" or \"url\", not both"
        ))),
        (Some(command), None) => {
            if matches!(transport.as_deref(), Some(t) if t != "stdio") {
                return Err(invalid(format!(
                    "server \"{name}\": \"command\" requires the stdio transport"
                )));
            }
            if command.trim().is_empty() {
                return Err(invalid(format!("server \"{name}\": \"command\" must not be empty")));
            }
            Ok(ServerConfig::Stdio {
                command,
                args: raw.args,
                env: raw.env,
                cwd: raw.cwd,
            })
        }
        (None, Some(url)) => {
            if transport.as_deref() == Some("stdio") {
                return Err(invalid(format!(
                    "server \"{name}\": the stdio transport requires \"command\""
                )));
            }
            let url = Url::parse(&url)
                .map_err(|e| invalid(format!("server \"{name}\": invalid url {url:?}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!(
                    "server \"{name}\": url scheme must be http or https"
                )));
            }
            Ok(ServerConfig::Http {
                url,
                headers: raw.headers,
            })
        }
        (None, None) => Err(invalid(format!(
            "server \"{name}\": one of \"command\" or \"url\" is required"
        ))),
    }
}

fn invalid(message: impl Into<String>) -> StartupError {
    StartupError::InvalidConfig(message.into())
}
