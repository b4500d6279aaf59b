//! mcp-session Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Session, transport and invocation errors
///
/// Cloneable so that one reason can be handed to every caller rejected by a
/// single disconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No session identifier from '{endpoint}' within {timeout_ms}ms")]
    HandshakeTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Missing session identifier: session is not connected")]
    MissingSession,

    #[error("Request '{request_id}' timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: String, timeout_ms: u64 },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Request '{0}' is already pending")]
    DuplicateRequest(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Request '{0}' was cancelled")]
    Cancelled(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl SessionError {
    /// Create a stream error
    pub fn stream<S: Into<String>>(msg: S) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a request error
    pub fn request<S: Into<String>>(msg: S) -> Self {
        Self::Request(msg.into())
    }

    /// Create a connection-closed error
    pub fn connection_closed<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionClosed(reason.into())
    }

    /// Create an invalid payload error
    pub fn invalid_payload<S: Into<String>>(msg: S) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write '{path}': {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    #[error("Cannot determine config directory")]
    NoConfigDir,

    #[error("Server profile '{0}' not found")]
    ProfileNotFound(String),
}

/// Result type alias for top-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::HandshakeTimeout {
            endpoint: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "No session identifier from 'http://127.0.0.1:8080' within 10000ms"
        );

        let err = SessionError::RequestTimeout {
            request_id: "msg-1".to_string(),
            timeout_ms: 2_000,
        };
        assert_eq!(err.to_string(), "Request 'msg-1' timed out after 2000ms");

        let err = SessionError::ReconnectExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "Reconnect gave up after 5 attempts");

        let err = SessionError::connection_closed("connection closed");
        assert_eq!(err.to_string(), "Connection closed: connection closed");
    }

    #[test]
    fn test_top_level_conversion() {
        let err: Error = SessionError::MissingSession.into();
        assert!(err.to_string().starts_with("Session error:"));

        let err: Error = ConfigError::ProfileNotFound("lab".into()).into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Server profile 'lab' not found"
        );
    }
}
