//! Shared utilities for integration tests: mock upstream MCP servers and a
//! small downstream client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use mcp_proxy::lifecycle::Shutdown;
use mcp_proxy::proxy::{McpProxyFactory, ProxyFactory};
use mcp_proxy::{ResolvedConfig, PROXY_NAME};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const MOCK_SESSION_ID: &str = "mock-upstream-session";

/// What a mock upstream has seen.
#[derive(Debug, Default)]
pub struct Recorder {
    /// `(method, Mcp-Session-Id header)` for every message received.
    pub calls: Vec<(String, Option<String>)>,
    /// When set, the next message carrying a session id is refused with 404,
    /// as a server does after dropping the session.
    pub expire_session: bool,
}

#[derive(Clone)]
struct MockState {
    name: &'static str,
    sse: bool,
    recorder: Arc<Mutex<Recorder>>,
}

/// A running mock MCP server speaking streamable HTTP.
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub recorder: Arc<Mutex<Recorder>>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    pub fn methods(&self) -> Vec<String> {
        self.recorder
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }
}

/// Start a mock MCP server named `name` on an ephemeral port. It exposes one
/// tool (`echo`), one prompt (`greet`) and one resource (`mock://{name}/readme`).
/// With `sse`, replies are delivered as a `text/event-stream`.
pub async fn start_mock_upstream(name: &'static str, sse: bool) -> MockUpstream {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let state = MockState {
        name,
        sse,
        recorder: recorder.clone(),
    };
    let app = Router::new().route("/mcp", post(mock_handler)).with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream { addr, recorder }
}

fn owns(name: &str, params: &Value) -> bool {
    let uri = params["uri"]
        .as_str()
        .or_else(|| params.pointer("/ref/uri").and_then(|v| v.as_str()))
        .unwrap_or_default();
    uri.starts_with(&format!("mock://{name}/"))
}

async fn mock_handler(State(state): State<MockState>, headers: HeaderMap, Json(message): Json<Value>) -> Response {
    let method = message["method"].as_str().unwrap_or_default().to_string();
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    {
        let mut recorder = state.recorder.lock().unwrap();
        let expired = recorder.expire_session && session.is_some();
        recorder.calls.push((method.clone(), session));
        if expired {
            recorder.expire_session = false;
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };

    let name = state.name;
    let params = &message["params"];
    let reply = match method.as_str() {
        "initialize" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}, "prompts": {}, "resources": {}},
            "serverInfo": {"name": name, "version": "0.0.1"}
        }}),
        "tools/list" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "tools": [{"name": "echo", "description": format!("Echo from {name}"), "inputSchema": {"type": "object"}}]
        }}),
        "tools/call" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "content": [{"type": "text", "text": format!("{name}:{}:{}", params["name"].as_str().unwrap_or(""), params["arguments"])}]
        }}),
        "prompts/list" => json!({"jsonrpc": "2.0", "id": id, "result": {"prompts": [{"name": "greet"}]}}),
        "prompts/get" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "messages": [{"role": "user", "content": {"type": "text", "text": format!("hello from {name}")}}]
        }}),
        "resources/list" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "resources": [{"uri": format!("mock://{name}/readme"), "name": "readme"}]
        }}),
        "resources/read" | "completion/complete" if !owns(name, params) => json!({"jsonrpc": "2.0", "id": id, "error": {
            "code": -32602, "message": "Unknown resource"
        }}),
        "resources/read" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "contents": [{"uri": params["uri"], "text": format!("readme of {name}")}]
        }}),
        "completion/complete" => json!({"jsonrpc": "2.0", "id": id, "result": {
            "completion": {"values": [name], "hasMore": false}
        }}),
        other => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": format!("Method not found: {other}")}}),
    };

    let session_header = [("mcp-session-id", MOCK_SESSION_ID)];
    if state.sse {
        let body = format!("event: message\ndata: {reply}\n\n");
        (session_header, [("content-type", "text/event-stream")], body).into_response()
    } else {
        (session_header, Json(reply)).into_response()
    }
}

/// A proxy running in the background on an ephemeral port.
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), mcp_proxy::proxy::StartupError>>,
}

impl RunningProxy {
    pub fn endpoint(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    /// Trigger shutdown and wait for the server task to finish.
    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("proxy did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Construct a proxy from `document` and serve it on 127.0.0.1.
pub async fn start_proxy(document: Value) -> RunningProxy {
    let proxy = McpProxyFactory::new(Duration::from_secs(5))
        .construct(&ResolvedConfig::new(document), PROXY_NAME)
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(proxy.serve(listener, shutdown.signalled()));

    RunningProxy { addr, shutdown, task }
}

/// Minimal downstream MCP client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    pub session_id: Option<String>,
    next_id: u64,
}

impl Client {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: reqwest::Client::builder().no_proxy().build().unwrap(),
            endpoint,
            session_id: None,
            next_id: 1,
        }
    }

    /// Send `initialize` and remember the session id.
    pub async fn initialize(&mut self) -> Value {
        let response = self
            .post(json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": {"name": "integration-test", "version": "0"}
                }
            }))
            .await;
        assert_eq!(response.status(), 200);
        self.session_id = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        assert!(self.session_id.is_some(), "initialize must return a session id");
        response.json().await.unwrap()
    }

    /// Send a request and return the full JSON-RPC response object.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let response = self
            .post(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        assert_eq!(response.status(), 200, "unexpected status for {method}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["id"], id);
        body
    }

    pub async fn post(&self, body: Value) -> reqwest::Response {
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(session) = &self.session_id {
            request = request.header("mcp-session-id", session);
        }
        request.send().await.unwrap()
    }
}

/// A stdio MCP server written in POSIX sh. Exposes one tool, `hello`.
pub const SH_MCP_SERVER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"hello","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello from sh"}]}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done"#;
