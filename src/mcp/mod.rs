use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ConfigError, Result, SessionResult};

pub mod client;
pub mod correlation;
pub mod event;
pub mod protocol;
pub mod reconnect;
pub mod server_config;
pub mod transport;

pub use client::{McpClient, SessionSnapshot, StatusChange};
pub use correlation::{CorrelationTable, PendingCall, PendingInfo};
pub use event::{SseEvent, StreamEvent};
pub use protocol::{InvokeToolMessage, ServerInfo, ToolInfo, ToolResult};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use server_config::{
    ClientConfig, McpConfig, RetryConfig, ServerEndpoint, ServerProfile, SessionSettings,
};
pub use transport::{EventStream, HttpTransport, Transport};

/// Lifecycle status of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No stream, nothing scheduled
    Disconnected,
    /// Stream opening, waiting for the session identifier
    Connecting,
    /// Session identifier received
    Connected,
    /// Stream lost or handshake failed; a reconnect may be scheduled
    Error,
}

impl SessionStatus {
    /// Check if invocations can be issued
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// Check if the session is down
    pub fn is_inactive(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// MCP Manager for handling multiple server sessions
///
/// One client per enabled profile, keyed by profile name.
#[derive(Default)]
pub struct McpManager {
    clients: HashMap<String, McpClient>,
    auto_connect: Vec<String>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every enabled profile
    pub fn from_config(config: &McpConfig) -> Self {
        let mut manager = Self::new();
        for profile in config.servers.iter().filter(|p| p.enabled) {
            if profile.auto_connect {
                manager.auto_connect.push(profile.name.clone());
            }
            manager.add_server(&profile.name, McpClient::new(profile.client_config()));
        }
        manager
    }

    /// Add a client, replacing and disconnecting any previous one of that name
    pub fn add_server(&mut self, name: impl Into<String>, client: McpClient) {
        if let Some(previous) = self.clients.insert(name.into(), client) {
            previous.disconnect();
        }
    }

    /// Remove and disconnect a client
    pub fn remove_server(&mut self, name: &str) -> Option<McpClient> {
        self.auto_connect.retain(|n| n != name);
        let client = self.clients.remove(name)?;
        client.disconnect();
        Some(client)
    }

    pub fn get(&self, name: &str) -> Option<&McpClient> {
        self.clients.get(name)
    }

    /// Connect one named server
    ///
    /// Unknown names fail with a configuration error, connection failures
    /// with the session error.
    pub async fn connect(&self, name: &str) -> Result<SessionSnapshot> {
        let client = self
            .get(name)
            .ok_or_else(|| ConfigError::ProfileNotFound(name.to_string()))?;
        Ok(client.connect().await?)
    }

    /// Connect every auto-connect profile, returning per-server outcomes
    pub async fn connect_auto(&self) -> Vec<(String, SessionResult<SessionSnapshot>)> {
        let mut results = Vec::with_capacity(self.auto_connect.len());
        for name in &self.auto_connect {
            if let Some(client) = self.clients.get(name) {
                let outcome = client.connect().await;
                if let Err(err) = &outcome {
                    tracing::warn!(server = %name, %err, "auto-connect failed");
                }
                results.push((name.clone(), outcome));
            }
        }
        results
    }

    pub fn disconnect_all(&self) {
        for client in self.clients.values() {
            client.disconnect();
        }
    }

    /// Status of every server, sorted by name
    pub fn statuses(&self) -> Vec<(String, SessionStatus)> {
        let mut statuses: Vec<_> = self
            .clients
            .iter()
            .map(|(name, client)| (name.clone(), client.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn server_names(&self) -> Vec<String> {
        self.statuses().into_iter().map(|(name, _)| name).collect()
    }

    pub fn connected_servers(&self) -> Vec<String> {
        self.statuses()
            .into_iter()
            .filter(|(_, status)| status.is_active())
            .map(|(name, _)| name)
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected_servers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status() {
        assert!(SessionStatus::Connected.is_active());
        assert!(!SessionStatus::Disconnected.is_active());

        assert!(SessionStatus::Connecting.is_connecting());
        assert!(!SessionStatus::Connected.is_connecting());

        assert!(SessionStatus::Disconnected.is_inactive());
        assert!(SessionStatus::Error.is_inactive());
        assert!(!SessionStatus::Connecting.is_inactive());
    }

    #[test]
    fn test_session_status_display() {
        assert_eq!(SessionStatus::Connected.to_string(), "connected");
        assert_eq!(SessionStatus::Disconnected.to_string(), "disconnected");
        assert_eq!(SessionStatus::Connecting.to_string(), "connecting");
        assert_eq!(SessionStatus::Error.to_string(), "error");
        assert_eq!(
            serde_json::to_string(&SessionStatus::Error).unwrap(),
            "\"error\""
        );
    }

    #[tokio::test]
    async fn test_manager_from_config() {
        let mut config = McpConfig::default();
        let mut remote = ServerProfile::new("remote", ServerEndpoint::new("10.0.0.2", 9000));
        remote.enabled = false;
        config.upsert_server(remote);
        config.upsert_server(ServerProfile::new("tools", ServerEndpoint::new("127.0.0.1", 9001)));

        let manager = McpManager::from_config(&config);
        assert_eq!(manager.server_names(), vec!["local", "tools"]);
        assert_eq!(manager.connected_count(), 0);
        assert!(manager.get("remote").is_none());

        let statuses = manager.statuses();
        assert!(statuses
            .iter()
            .all(|(_, status)| *status == SessionStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_manager_unknown_server() {
        let manager = McpManager::new();
        let result = manager.connect("missing").await;
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::ProfileNotFound(name))) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_manager_add_remove() {
        let mut manager = McpManager::new();
        let endpoint = ServerEndpoint::new("127.0.0.1", 9);
        manager.add_server("a", McpClient::new(ClientConfig::new(endpoint.clone())));
        manager.add_server("a", McpClient::new(ClientConfig::new(endpoint)));
        assert_eq!(manager.server_count(), 1);

        assert!(manager.remove_server("a").is_some());
        assert!(manager.remove_server("a").is_none());
        assert_eq!(manager.server_count(), 0);
    }
}
