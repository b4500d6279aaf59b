//! Wire payloads exchanged with the tool server outside the event stream

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SessionError, SessionResult};

/// Tool invocation posted to the messages endpoint
#[derive(Debug, Clone, Serialize)]
pub struct InvokeToolMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: InvokeContent,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvokeContent {
    pub name: String,
    pub parameters: Value,
}

impl InvokeToolMessage {
    pub fn new(
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        parameters: Value,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: request_id.into(),
            kind: "invoke_tool",
            content: InvokeContent {
                name: tool_name.into(),
                parameters,
            },
            client_id: session_id.into(),
        }
    }
}

/// Error carried by the acknowledgement of an invocation request, if any
pub fn acknowledgement_error(ack: &Value) -> Option<String> {
    match ack.get("error")? {
        Value::Null => None,
        Value::String(msg) => Some(msg.clone()),
        other => Some(
            other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    request_id: String,
    raw: Value,
}

impl ToolResult {
    pub fn new(request_id: impl Into<String>, raw: Value) -> Self {
        Self {
            request_id: request_id.into(),
            raw,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Result event exactly as the server sent it
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// First text item of the result content, if the server used that shape
    pub fn text(&self) -> Option<&str> {
        first_text(&self.raw)
    }

    /// Unwrapped tool output
    ///
    /// The first text content item is decoded as JSON when it is JSON and
    /// wrapped as `{"text": ...}` otherwise. JSON-RPC `result` members are
    /// unwrapped the same way. Any other shape is returned unchanged.
    pub fn value(&self) -> Value {
        if let Some(text) = self.text() {
            return serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::json!({ "text": text }));
        }
        if let Some(result) = self.raw.get("result") {
            return result.clone();
        }
        self.raw.clone()
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }
}

fn first_text(raw: &Value) -> Option<&str> {
    // {"content": {"content": [{"type": "text", "text": ...}]}} or
    // {"content": [{"type": "text", "text": ...}]}, optionally under "result"
    let holder = raw.get("result").unwrap_or(raw);
    let content = holder.get("content")?;
    let items = content.get("content").unwrap_or(content).as_array()?;
    items.first()?.get("text")?.as_str()
}

/// Tool advertised by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, rename = "inputSchema", alias = "parameters", alias = "input_schema")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolsListResponse {
    #[serde(default)]
    tools: Vec<ToolInfo>,
}

/// Parse the tool catalogue, accepting a bare array or `{"tools": [...]}`
pub fn parse_tool_list(value: Value) -> SessionResult<Vec<ToolInfo>> {
    if value.is_array() {
        return serde_json::from_value(value)
            .map_err(|e| SessionError::invalid_payload(format!("tool list: {e}")));
    }
    let response: ToolsListResponse = serde_json::from_value(value)
        .map_err(|e| SessionError::invalid_payload(format!("tool list: {e}")))?;
    Ok(response.tools)
}

/// Server identification from the info endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerInfo {
    pub fn display_name(&self) -> String {
        format!(
            "{} {}",
            self.name.as_deref().unwrap_or("Unknown"),
            self.version.as_deref().unwrap_or("Unknown")
        )
    }
}
