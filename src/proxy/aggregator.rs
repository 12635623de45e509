//! Aggregation of several upstream servers into one MCP server.
//!
//! # Responsibilities
//! - Answer `initialize` and `ping` locally
//! - Merge tool, prompt and resource catalogues from every upstream
//! - Route calls back to the upstream that owns the named item
//!
//! # Design Decisions
//! - With one upstream, names pass through untouched
//! - With several, tools and prompts are exposed as `{server}_{name}`;
//!   when server names overlap, the longest matching prefix wins
//! - Resource URIs are never rewritten; ownership is learned from
//!   `resources/list`; an unknown URI is tried against each upstream
//! - A failing upstream is skipped during listing, never fatal

use std::collections::HashMap;
use std::sync::RwLock;

use futures_util::future::join_all;
use serde_json::{json, Value};

use crate::proxy::jsonrpc::ErrorObject;
use crate::proxy::upstream::{Upstream, UpstreamError};
use crate::proxy::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

/// Upper bound on pages fetched from one upstream for a single listing.
const MAX_PAGES: usize = 100;

/// The logical MCP server presented to downstream clients.
#[derive(Debug)]
pub struct Aggregator {
    name: String,
    upstreams: Vec<Upstream>,
    resource_owners: RwLock<HashMap<String, usize>>,
}

impl Aggregator {
    pub fn new(name: impl Into<String>, upstreams: Vec<Upstream>) -> Self {
        Self {
            name: name.into(),
            upstreams,
            resource_owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Connect every upstream concurrently, logging failures.
    pub async fn warm_up(&self) {
        let results = join_all(self.upstreams.iter().map(|u| u.ensure_connected())).await;
        for (upstream, result) in self.upstreams.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    server = upstream.name(),
                    error = %e,
                    "Upstream unavailable at startup, will retry on demand"
                );
            }
        }
    }

    /// Disconnect every upstream.
    pub async fn shutdown(&self) {
        join_all(self.upstreams.iter().map(|u| u.disconnect())).await;
    }

    /// Handle one downstream request.
    pub async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        tracing::debug!(method, "Handling request");
        match method {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.list_named("tools", "tools/list", "tools").await })),
            "tools/call" => self.call_named("tools/call", "tool", params).await,
            "prompts/list" => Ok(json!({ "prompts": self.list_named("prompts", "prompts/list", "prompts").await })),
            "prompts/get" => self.call_named("prompts/get", "prompt", params).await,
            "resources/list" => Ok(json!({ "resources": self.list_resources().await })),
            "resources/templates/list" => {
                let templates: Vec<Value> = self
                    .list_all("resources", "resources/templates/list", "resourceTemplates")
                    .await
                    .into_iter()
                    .flat_map(|(_, items)| items)
                    .collect();
                Ok(json!({ "resourceTemplates": templates }))
            }
            "resources/read" => self.read_resource(params).await,
            "completion/complete" => self.complete(params).await,
            "logging/setLevel" => self.set_level(params).await,
            other => Err(ErrorObject::method_not_found(other)),
        }
    }

    /// Handle one downstream notification. None of them need forwarding:
    /// upstream sessions are owned by the proxy, not by the client.
    pub async fn handle_notification(&self, method: &str, _params: Value) {
        tracing::debug!(method, "Received notification");
    }

    fn initialize(&self, params: &Value) -> Value {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(LATEST_PROTOCOL_VERSION);

        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": { "listChanged": false },
                "prompts": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
                "logging": {},
                "completions": {},
            },
            "serverInfo": {
                "name": self.name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    fn is_prefixed(&self) -> bool {
        self.upstreams.len() > 1
    }

    /// Find the upstream that owns an exposed tool or prompt name.
    fn resolve_name<'a>(&self, name: &'a str) -> Option<(usize, &'a str)> {
        if !self.is_prefixed() {
            return (!self.upstreams.is_empty()).then_some((0, name));
        }
        resolve_prefixed(self.upstreams.iter().map(Upstream::name), name)
    }

    async fn list_all(&self, capability: &str, method: &str, key: &str) -> Vec<(usize, Vec<Value>)> {
        let listings = self.upstreams.iter().enumerate().map(|(idx, upstream)| async move {
            match collect_pages(upstream, capability, method, key).await {
                Ok(items) => Some((idx, items)),
                Err(e) => {
                    tracing::warn!(server = upstream.name(), method, error = %e, "Skipping upstream in listing");
                    None
                }
            }
        });
        join_all(listings).await.into_iter().flatten().collect()
    }

    async fn list_named(&self, capability: &str, method: &str, key: &str) -> Vec<Value> {
        let prefixed = self.is_prefixed();
        let mut merged = Vec::new();
        for (idx, items) in self.list_all(capability, method, key).await {
            let server = self.upstreams[idx].name();
            for mut item in items {
                let renamed = item
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|_| prefixed)
                    .map(|name| format!("{server}_{name}"));
                if let Some(renamed) = renamed {
                    item["name"] = Value::String(renamed);
                }
                merged.push(item);
            }
        }
        merged
    }

    async fn list_resources(&self) -> Vec<Value> {
        let listings = self.list_all("resources", "resources/list", "resources").await;

        let mut owners = write(&self.resource_owners);
        let mut merged = Vec::new();
        for (idx, items) in listings {
            for item in items {
                if let Some(uri) = item.get("uri").and_then(Value::as_str) {
                    owners.insert(uri.to_string(), idx);
                }
                merged.push(item);
            }
        }
        merged
    }

    async fn call_named(&self, method: &str, kind: &str, mut params: Value) -> Result<Value, ErrorObject> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorObject::invalid_params(format!("{method}: missing \"name\"")))?
            .to_string();
        let (idx, original) = self
            .resolve_name(&name)
            .ok_or_else(|| ErrorObject::invalid_params(format!("Unknown {kind}: {name}")))?;

        params["name"] = Value::String(original.to_string());
        self.forward(idx, method, params).await
    }

    async fn read_resource(&self, params: Value) -> Result<Value, ErrorObject> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorObject::invalid_params("resources/read: missing \"uri\""))?
            .to_string();
        self.route_by_uri("resources/read", uri, params).await
    }

    /// Forward to the upstream that owns `uri`. An unknown URI is tried on
    /// each upstream that supports resources, in order; the first that
    /// answers becomes its owner.
    async fn route_by_uri(&self, method: &str, uri: String, params: Value) -> Result<Value, ErrorObject> {
        if let Some(idx) = self.resource_owner(&uri) {
            return self.forward(idx, method, params).await;
        }

        let mut last_error = None;
        for (idx, upstream) in self.upstreams.iter().enumerate() {
            match upstream.supports("resources").await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    last_error = Some(upstream_error(upstream.name(), e));
                    continue;
                }
            }
            match upstream.request(method, params.clone()).await {
                Ok(result) => {
                    write(&self.resource_owners).insert(uri, idx);
                    return Ok(result);
                }
                Err(e) => last_error = Some(upstream_error(upstream.name(), e)),
            }
        }
        Err(last_error.unwrap_or_else(|| ErrorObject::invalid_params(format!("Unknown resource: {uri}"))))
    }

    async fn complete(&self, mut params: Value) -> Result<Value, ErrorObject> {
        let kind = params
            .pointer("/ref/type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "ref/prompt" => {
                let name = params
                    .pointer("/ref/name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ErrorObject::invalid_params("completion/complete: missing ref.name"))?
                    .to_string();
                let (idx, original) = self
                    .resolve_name(&name)
                    .ok_or_else(|| ErrorObject::invalid_params(format!("Unknown prompt: {name}")))?;
                params["ref"]["name"] = Value::String(original.to_string());
                self.forward(idx, "completion/complete", params).await
            }
            "ref/resource" => {
                let uri = params
                    .pointer("/ref/uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ErrorObject::invalid_params("completion/complete: missing ref.uri"))?
                    .to_string();
                self.route_by_uri("completion/complete", uri, params).await
            }
            other => Err(ErrorObject::invalid_params(format!(
                "completion/complete: unsupported ref type {other:?}"
            ))),
        }
    }

    async fn set_level(&self, params: Value) -> Result<Value, ErrorObject> {
        let updates = self.upstreams.iter().map(|upstream| {
            let params = params.clone();
            async move {
                if !upstream.supports("logging").await? {
                    return Ok::<(), UpstreamError>(());
                }
                upstream.request("logging/setLevel", params).await.map(|_| ())
            }
        });
        for (upstream, result) in self.upstreams.iter().zip(join_all(updates).await) {
            if let Err(e) = result {
                tracing::warn!(server = upstream.name(), error = %e, "Failed to forward logging level");
            }
        }
        Ok(json!({}))
    }

    fn resource_owner(&self, uri: &str) -> Option<usize> {
        if !self.is_prefixed() {
            return (!self.upstreams.is_empty()).then_some(0);
        }
        read(&self.resource_owners).get(uri).copied()
    }

    async fn forward(&self, idx: usize, method: &str, params: Value) -> Result<Value, ErrorObject> {
        let upstream = &self.upstreams[idx];
        upstream
            .request(method, params)
            .await
            .map_err(|e| upstream_error(upstream.name(), e))
    }
}

/// Split `{server}_{name}` into the owning server's index and the original name.
///
/// The longest matching server name wins, so `a_b_tool` resolves to server
/// `a_b` when both `a` and `a_b` exist.
pub fn resolve_prefixed<'s, 'n>(
    servers: impl Iterator<Item = &'s str>,
    name: &'n str,
) -> Option<(usize, &'n str)> {
    servers
        .enumerate()
        .filter_map(|(idx, server)| {
            let rest = name.strip_prefix(server)?.strip_prefix('_')?;
            (!rest.is_empty()).then_some((idx, server.len(), rest))
        })
        .max_by_key(|(_, len, _)| *len)
        .map(|(idx, _, rest)| (idx, rest))
}

fn upstream_error(server: &str, error: UpstreamError) -> ErrorObject {
    match error {
        UpstreamError::Rpc(error) => error,
        other => ErrorObject::internal(format!("upstream server \"{server}\" failed: {other}")),
    }
}

async fn collect_pages(
    upstream: &Upstream,
    capability: &str,
    method: &str,
    key: &str,
) -> Result<Vec<Value>, UpstreamError> {
    if !upstream.supports(capability).await? {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_PAGES {
        let params = match &cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let mut page = upstream.request(method, params).await?;
        if let Some(Value::Array(list)) = page.get_mut(key).map(Value::take) {
            items.extend(list);
        }
        match page.get("nextCursor").and_then(Value::as_str) {
            Some(next) => cursor = Some(next.to_string()),
            None => return Ok(items),
        }
    }
    tracing::warn!(server = upstream.name(), method, "Pagination limit reached, listing truncated");
    Ok(items)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
