//! Stream event classification
//!
//! Every raw event read from the server stream is parsed into one of a closed
//! set of shapes before anything acts on it. Servers announce the session in
//! two ways: a named `connected` (or standard MCP `endpoint`) event, or a
//! generic `message` whose JSON payload has `"type": "connected"`. Both are
//! recognised here so the connection manager only matches on the tag.

use serde_json::Value;
use thiserror::Error;

/// Fields that may carry the session identifier in a handshake payload
const SESSION_ID_FIELDS: &[&str] = &["clientId", "sessionId", "client_id", "session_id"];

/// Fields that may carry the originating request identifier
const CORRELATION_FIELDS: &[&str] = &["id", "requestId", "request_id", "messageId", "message_id"];

/// Raw event as delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name (`message` when the server did not name it)
    pub event: String,
    /// Event data, multi-line data already joined
    pub data: String,
    /// Optional SSE `id:` field
    pub id: Option<String>,
}

impl SseEvent {
    /// Unnamed event, delivered to the generic message channel
    pub fn message(data: impl Into<String>) -> Self {
        Self::named("message", data)
    }

    /// Named event
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }

    fn name(&self) -> &str {
        let name = self.event.trim();
        if name.is_empty() {
            "message"
        } else {
            name
        }
    }
}

/// Classified stream event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Server announced the session identifier
    Handshake(HandshakeEvent),
    /// Result of a tool invocation
    ToolResult(ToolResultEvent),
    /// Server-side error, possibly tied to one request
    ServerError(ServerErrorEvent),
    /// Keep-alive
    Ping,
    /// Valid payload of a shape this client does not act on
    Unrecognized(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeEvent {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultEvent {
    /// Correlation id, absent when the server only marks the payload as a result
    pub request_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorEvent {
    pub request_id: Option<String>,
    pub message: String,
}

/// Event that could not be classified
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("malformed payload on '{event}' event: {reason}")]
    Malformed { event: String, reason: String },

    #[error("handshake on '{event}' event carries no session identifier")]
    MissingSessionId { event: String },
}

/// Classify a raw stream event
pub fn parse(raw: &SseEvent) -> Result<StreamEvent, EventParseError> {
    let name = raw.name();
    let data = raw.data.trim();

    if name == "ping" {
        return Ok(StreamEvent::Ping);
    }

    if name == "endpoint" {
        return Ok(match session_id_from_query(data) {
            Some(session_id) => StreamEvent::Handshake(HandshakeEvent { session_id }),
            None => StreamEvent::Unrecognized(Value::String(data.to_string())),
        });
    }

    if data.is_empty() {
        return Ok(StreamEvent::Ping);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        // Some servers send the bare identifier as the data of a named event
        Err(_) if name == "connected" && !data.contains(char::is_whitespace) => {
            return Ok(StreamEvent::Handshake(HandshakeEvent {
                session_id: data.to_string(),
            }));
        }
        Err(e) => {
            return Err(EventParseError::Malformed {
                event: name.to_string(),
                reason: e.to_string(),
            });
        }
    };

    classify(name, value)
}

fn classify(name: &str, value: Value) -> Result<StreamEvent, EventParseError> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or(name);

    match kind {
        "connected" => first_string(&value, SESSION_ID_FIELDS)
            .map(|session_id| StreamEvent::Handshake(HandshakeEvent { session_id }))
            .ok_or_else(|| EventParseError::MissingSessionId {
                event: name.to_string(),
            }),
        "tool_result" => Ok(StreamEvent::ToolResult(ToolResultEvent {
            request_id: first_string(&value, CORRELATION_FIELDS),
            payload: value,
        })),
        "error" => Ok(StreamEvent::ServerError(ServerErrorEvent {
            request_id: first_string(&value, CORRELATION_FIELDS),
            message: error_message(&value),
        })),
        "ping" | "heartbeat" => Ok(StreamEvent::Ping),
        _ => Ok(classify_jsonrpc(value)),
    }
}

/// JSON-RPC style responses: `{"id", "result"}` or `{"id", "error"}`
fn classify_jsonrpc(value: Value) -> StreamEvent {
    let request_id = first_string(&value, CORRELATION_FIELDS);

    if request_id.is_some() && value.get("error").is_some_and(|e| !e.is_null()) {
        return StreamEvent::ServerError(ServerErrorEvent {
            request_id,
            message: error_message(&value),
        });
    }

    if request_id.is_some() && value.get("result").is_some() {
        return StreamEvent::ToolResult(ToolResultEvent {
            request_id,
            payload: value,
        });
    }

    StreamEvent::Unrecognized(value)
}

fn first_string(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match value.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn error_message(value: &Value) -> String {
    if let Some(msg) = value.get("message").and_then(Value::as_str) {
        return msg.to_string();
    }
    match value.get("error") {
        Some(Value::String(msg)) => msg.clone(),
        Some(err) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        None => value.to_string(),
    }
}

/// `/messages?sessionId=abc` style endpoint announcement
fn session_id_from_query(data: &str) -> Option<String> {
    let (_, query) = data.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, val) = pair.split_once('=')?;
        (SESSION_ID_FIELDS.contains(&key) && !val.is_empty()).then(|| val.to_string())
    })
}
