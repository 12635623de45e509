//! Streamable HTTP upstream client.
//!
//! # Responsibilities
//! - POST JSON-RPC messages to the server endpoint
//! - Track the server-assigned `Mcp-Session-Id`
//! - Decode replies delivered either as plain JSON or as an SSE stream

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::http::{PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use crate::proxy::jsonrpc::{Message, OutgoingNotification, OutgoingRequest};
use crate::proxy::upstream::UpstreamError;

/// JSON-RPC client for a streamable HTTP endpoint.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpClient {
    pub fn new(
        url: Url,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UpstreamError::Protocol(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| UpstreamError::Protocol(format!("invalid value for header {name}: {e}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url,
            headers: header_map,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Protocol version negotiated during `initialize`; sent on every later request.
    pub fn set_protocol_version(&self, version: &str) {
        *write(&self.protocol_version) = Some(version.to_string());
    }

    pub fn session_id(&self) -> Option<String> {
        read(&self.session_id).clone()
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.post(&OutgoingRequest::new(id, method, &params)).await?;
        self.check_status(response.status())?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().starts_with("text/event-stream"));

        if is_event_stream {
            read_event_stream(response, id).await
        } else {
            let body: Value = response.json().await?;
            find_response(body, id)
                .unwrap_or_else(|| Err(UpstreamError::Protocol(format!("no response with id {id}"))))
        }
    }

    pub async fn notify(&self, method: &str, params: Option<&Value>) -> Result<(), UpstreamError> {
        let response = self.post(&OutgoingNotification::new(method, params)).await?;
        self.check_status(response.status())
    }

    /// A 404 while holding a session id means the server dropped the session.
    fn check_status(&self, status: StatusCode) -> Result<(), UpstreamError> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            Err(UpstreamError::SessionExpired)
        } else {
            Err(UpstreamError::Status(status))
        }
    }

    /// End the server-side session, if one was assigned.
    pub async fn close(&self) -> Result<(), UpstreamError> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };
        self.client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, session_id)
            .send()
            .await?;
        Ok(())
    }

    async fn post<T: Serialize>(&self, body: &T) -> Result<reqwest::Response, UpstreamError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(version) = read(&self.protocol_version).clone() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }

        let response = request.send().await?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *write(&self.session_id) = Some(session_id.to_string());
        }
        Ok(response)
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pick the response matching `id` out of a single message or a batch.
fn find_response(body: Value, id: u64) -> Option<Result<Value, UpstreamError>> {
    let messages = match body {
        Value::Array(items) => items,
        other => vec![other],
    };
    messages.into_iter().find_map(|message| match Message::classify(message) {
        Ok(Message::Response { id: rid, result }) if rid.as_u64() == Some(id) => {
            Some(result.map_err(UpstreamError::Rpc))
        }
        _ => None,
    })
}

async fn read_event_stream(response: reqwest::Response, id: u64) -> Result<Value, UpstreamError> {
    let mut stream = response.bytes_stream();
    let mut parser = EventParser::default();

    while let Some(chunk) = stream.next().await {
        for data in parser.push(&chunk?) {
            if let Some(result) = decode_event(&data, id) {
                return result;
            }
        }
    }
    if let Some(data) = parser.finish() {
        if let Some(result) = decode_event(&data, id) {
            return result;
        }
    }
    Err(UpstreamError::Protocol(format!(
        "event stream ended without a response to request {id}"
    )))
}

fn decode_event(data: &str, id: u64) -> Option<Result<Value, UpstreamError>> {
    let value: Value = serde_json::from_str(data).ok()?;
    find_response(value, id)
}

/// Incremental parser for `text/event-stream` bodies. Yields the joined
/// `data` payload of each completed event.
#[derive(Debug, Default)]
struct EventParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl EventParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // `event:`, `id:`, `retry:` and comments carry nothing we need.
        }
        events
    }

    fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let mut tail = std::mem::take(&mut self.buffer);
            tail.push(b'\n');
            self.push(&tail);
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}
