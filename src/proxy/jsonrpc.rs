//! JSON-RPC 2.0 message types shared by the downstream endpoint and the
//! upstream clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// An outgoing response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_result(id: Value, result: Result<Value, ErrorObject>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(error) => Self::failure(id, error),
        }
    }
}

/// An outgoing request. Field order keeps `jsonrpc` and `id` first on the wire.
#[derive(Debug, Serialize)]
pub struct OutgoingRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> OutgoingRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// An outgoing notification.
#[derive(Debug, Serialize)]
pub struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> OutgoingNotification<'a> {
    pub fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Result<Value, ErrorObject>,
    },
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// Returns the `id` (if any could be recovered) alongside the error so
    /// the caller can answer with a correlated `Invalid Request`.
    pub fn classify(value: Value) -> Result<Self, (Value, ErrorObject)> {
        let Value::Object(mut obj) = value else {
            return Err((
                Value::Null,
                ErrorObject::new(INVALID_REQUEST, "Invalid Request: expected an object"),
            ));
        };

        let id = obj.remove("id");
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (obj.remove("method"), id) {
            (Some(Value::String(method)), Some(id)) => Ok(Message::Request { id, method, params }),
            (Some(Value::String(method)), None) => Ok(Message::Notification { method, params }),
            (Some(_), id) => Err((
                id.unwrap_or(Value::Null),
                ErrorObject::new(INVALID_REQUEST, "Invalid Request: method must be a string"),
            )),
            (None, Some(id)) => {
                if let Some(error) = obj.remove("error") {
                    let error = serde_json::from_value::<ErrorObject>(error).map_err(|e| {
                        (
                            id.clone(),
                            ErrorObject::new(INVALID_REQUEST, format!("Invalid error object: {e}")),
                        )
                    })?;
                    return Ok(Message::Response { id, result: Err(error) });
                }
                match obj.remove("result") {
                    Some(result) => Ok(Message::Response { id, result: Ok(result) }),
                    None => Err((
                        id,
                        ErrorObject::new(INVALID_REQUEST, "Invalid Request: missing method"),
                    )),
                }
            }
            (None, None) => Err((
                Value::Null,
                ErrorObject::new(INVALID_REQUEST, "Invalid Request: missing method"),
            )),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }
}
