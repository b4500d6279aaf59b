//! mcp-session Library
//!
//! Client side of an SSE-based MCP tool server:
//! - Event-stream connection with session identifier handshake
//! - Tool invocation correlated to streamed results
//! - Reconnection with bounded exponential backoff

pub mod error;
pub mod logging;
pub mod mcp;

pub use error::{ConfigError, Error, SessionError, SessionResult};
pub use mcp::{
    ClientConfig, HttpTransport, McpClient, McpConfig, McpManager, ServerEndpoint,
    SessionSettings, SessionSnapshot, SessionStatus, StatusChange, ToolInfo, ToolResult,
    Transport,
};
