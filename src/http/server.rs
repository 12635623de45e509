//! Streamable HTTP server for downstream MCP clients.
//!
//! # Responsibilities
//! - Create the Axum router for the MCP endpoint and `/health`
//! - Wire up middleware (request ID, body limit, tracing)
//! - Enforce session rules around `Mcp-Session-Id`
//! - Decode JSON-RPC messages and batches, dispatch them to the aggregator
//!
//! # Design Decisions
//! - Replies are always `application/json`; the server never opens an SSE
//!   stream, so `GET` on the endpoint is refused with 405
//! - `initialize` is the only message accepted without a session and must
//!   arrive on its own
//! - A `MCP-Protocol-Version` header must match the version negotiated for
//!   the session

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::http::session::SessionStore;
use crate::http::{HttpOptions, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER, X_REQUEST_ID};
use crate::proxy::jsonrpc::{self, ErrorObject, Message, INVALID_REQUEST, PARSE_ERROR};
use crate::proxy::Aggregator;

/// JSON-RPC error code returned with 404 for an unknown session.
pub const SESSION_NOT_FOUND: i64 = -32001;

/// Upper bound on the idle-session sweep period.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<Aggregator>,
    pub sessions: Arc<SessionStore>,
}

/// HTTP server exposing one aggregated MCP endpoint.
pub struct McpHttpServer {
    router: Router,
    options: HttpOptions,
    sessions: Arc<SessionStore>,
}

impl McpHttpServer {
    pub fn new(proxy: Arc<Aggregator>, options: HttpOptions) -> Self {
        let sessions = Arc::new(SessionStore::new(
            options.session_idle_timeout,
            options.max_sessions,
        ));
        let state = AppState {
            proxy,
            sessions: sessions.clone(),
        };
        let router = Self::build_router(&options, state);
        Self {
            router,
            options,
            sessions,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(options: &HttpOptions, state: AppState) -> Router {
        let endpoint = post(handle_post).get(handle_get).delete(handle_delete);
        let trimmed = options.path.trim_end_matches('/');

        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(options.max_body_bytes));

        Router::new()
            .route(trimmed, endpoint.clone())
            .route(&format!("{trimmed}/"), endpoint)
            .route("/health", get(handle_health))
            .with_state(state)
            .layer(middleware)
    }

    /// A clone of the router, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    /// Run the server until `shutdown` resolves, then drain in-flight requests.
    pub async fn run<S>(self, listener: TcpListener, shutdown: S) -> Result<(), std::io::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, path = %self.options.path, "HTTP server starting");

        let sweeper = spawn_session_sweeper(
            self.sessions.clone(),
            self.options.session_idle_timeout.min(MAX_SWEEP_INTERVAL),
        );
        let served = axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await;
        sweeper.abort();
        served?;

        tracing::info!(
            open_sessions = self.sessions.len(),
            "HTTP server stopped"
        );
        Ok(())
    }
}

fn spawn_session_sweeper(
    sessions: Arc<SessionStore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sessions.sweep();
        }
    })
}

async fn handle_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorObject::new(PARSE_ERROR, format!("Parse error: {e}")),
            )
        }
    };

    let (items, batch) = match payload {
        Value::Array(items) if items.is_empty() => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorObject::new(INVALID_REQUEST, "Invalid Request: empty batch"),
            )
        }
        Value::Array(items) => (items, true),
        other => (vec![other], false),
    };
    let mut messages: Vec<_> = items.into_iter().map(Message::classify).collect();

    let initializing = messages
        .iter()
        .any(|m| matches!(m, Ok(message) if message.method() == Some("initialize")));
    if initializing {
        if messages.len() > 1 {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorObject::new(INVALID_REQUEST, "Invalid Request: initialize must not be batched"),
            );
        }
        return match messages.pop() {
            Some(Ok(Message::Request { id, params, .. })) => initialize_session(&state, id, params).await,
            _ => rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorObject::new(INVALID_REQUEST, "Invalid Request: initialize must be a request"),
            ),
        };
    }

    let session_id = match session_header(&headers) {
        Some(id) => id,
        None => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorObject::new(INVALID_REQUEST, "Bad Request: missing Mcp-Session-Id header"),
            )
        }
    };
    let negotiated = match state.sessions.touch(session_id) {
        Some(version) => version,
        None => {
            return rpc_error(
                StatusCode::NOT_FOUND,
                ErrorObject::new(SESSION_NOT_FOUND, "Session not found"),
            )
        }
    };

    if let Some(version) = headers.get(PROTOCOL_VERSION_HEADER).and_then(|v| v.to_str().ok()) {
        if version != negotiated {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorObject::new(
                    INVALID_REQUEST,
                    format!("Bad Request: protocol version {version} does not match negotiated {negotiated}"),
                ),
            );
        }
    }

    tracing::debug!(session_id, messages = messages.len(), batch, "Dispatching messages");

    let mut replies: Vec<jsonrpc::Response> =
        join_all(messages.into_iter().map(|message| dispatch(&state.proxy, message)))
            .await
            .into_iter()
            .flatten()
            .collect();

    match replies.len() {
        0 => StatusCode::ACCEPTED.into_response(),
        _ if batch => Json(replies).into_response(),
        _ => Json(replies.remove(0)).into_response(),
    }
}

async fn initialize_session(state: &AppState, id: Value, params: Value) -> Response {
    let client = params
        .pointer("/clientInfo/name")
        .and_then(Value::as_str)
        .unwrap_or("-")
        .to_string();
    let result = match state.proxy.handle_request("initialize", params).await {
        Ok(result) => result,
        Err(error) => return Json(jsonrpc::Response::failure(id, error)).into_response(),
    };

    let version = result
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let session_id = match state.sessions.create(version) {
        Ok(session_id) => session_id,
        Err(e) => {
            tracing::warn!(client = %client, error = %e, "Refusing new session");
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorObject::new(jsonrpc::INTERNAL_ERROR, format!("Service unavailable: {e}")),
            );
        }
    };
    tracing::info!(
        session_id = %session_id,
        protocol_version = %version,
        client = %client,
        "Session initialized"
    );

    (
        [(SESSION_ID_HEADER, session_id)],
        Json(jsonrpc::Response::success(id, result)),
    )
        .into_response()
}

async fn dispatch(
    proxy: &Aggregator,
    message: Result<Message, (Value, ErrorObject)>,
) -> Option<jsonrpc::Response> {
    match message {
        Ok(Message::Request { id, method, params }) => {
            let result = proxy.handle_request(&method, params).await;
            Some(jsonrpc::Response::from_result(id, result))
        }
        Ok(Message::Notification { method, params }) => {
            proxy.handle_notification(&method, params).await;
            None
        }
        // The proxy never sends requests downstream, so there is nothing to correlate.
        Ok(Message::Response { .. }) => None,
        Err((id, error)) => Some(jsonrpc::Response::failure(id, error)),
    }
}

async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match session_header(&headers) {
        None => rpc_error(
            StatusCode::BAD_REQUEST,
            ErrorObject::new(INVALID_REQUEST, "Bad Request: missing Mcp-Session-Id header"),
        ),
        Some(id) if state.sessions.remove(id) => StatusCode::OK.into_response(),
        Some(_) => rpc_error(
            StatusCode::NOT_FOUND,
            ErrorObject::new(SESSION_NOT_FOUND, "Session not found"),
        ),
    }
}

async fn handle_get() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, DELETE")],
    )
        .into_response()
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let servers: Vec<&str> = state.proxy.upstreams().iter().map(|u| u.name()).collect();
    Json(json!({
        "status": "ok",
        "name": state.proxy.name(),
        "servers": servers,
        "sessions": state.sessions.len(),
    }))
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn rpc_error(status: StatusCode, error: ErrorObject) -> Response {
    (status, Json(jsonrpc::Response::failure(Value::Null, error))).into_response()
}
