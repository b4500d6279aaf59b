//! MCP Server Configuration
//!
//! Provides configuration structures for MCP session connections including:
//! - Server endpoints and named server profiles
//! - Handshake, request timeout and reconnect backoff settings
//! - TOML file persistence

use crate::error::{ConfigError, ConfigResult, SessionError, SessionResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network location of an MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// URL scheme (http or https)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Host name or address
    pub host: String,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerEndpoint {
    /// Create a plain HTTP endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            port,
        }
    }

    /// Parse an endpoint from a server URL such as `http://172.16.16.54:8080`
    pub fn parse(raw: &str) -> SessionResult<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| SessionError::InvalidEndpoint(format!("{raw}: {e}")))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(SessionError::InvalidEndpoint(format!(
                "{raw}: unsupported scheme '{scheme}'"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| SessionError::InvalidEndpoint(format!("{raw}: missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SessionError::InvalidEndpoint(format!("{raw}: missing port")))?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Absolute URL for a server path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Session behaviour for one server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Event stream path
    #[serde(default = "default_sse_path")]
    pub sse_path: String,

    /// Tool invocation request path
    #[serde(default = "default_messages_path")]
    pub messages_path: String,

    /// Tool catalogue path
    #[serde(default = "default_tools_path")]
    pub tools_path: String,

    /// Server information path
    #[serde(default = "default_info_path")]
    pub info_path: String,

    /// Per-request result timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Time allowed for the handshake event in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: RetryConfig,

    /// Extra HTTP headers sent on every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl SessionSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of reconnect attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

/// Everything one `McpClient` needs
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: ServerEndpoint,
    pub session: SessionSettings,
}

impl ClientConfig {
    pub fn new(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint,
            session: SessionSettings::default(),
        }
    }

    pub fn with_session(mut self, session: SessionSettings) -> Self {
        self.session = session;
        self
    }
}

/// Named server profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Display name for the server
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: String,

    /// Whether this server is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Connect when the manager starts
    #[serde(default)]
    pub auto_connect: bool,

    /// Where the server lives
    pub endpoint: ServerEndpoint,

    /// Session behaviour
    #[serde(default)]
    pub session: SessionSettings,
}

impl ServerProfile {
    pub fn new(name: impl Into<String>, endpoint: ServerEndpoint) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            auto_connect: false,
            endpoint,
            session: SessionSettings::default(),
        }
    }

    /// Connection settings for a client built from this profile
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            session: self.session.clone(),
        }
    }
}

/// Global MCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Default server to use
    #[serde(default)]
    pub default_server: Option<String>,

    /// Available server profiles
    #[serde(default)]
    pub servers: Vec<ServerProfile>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_sse_path() -> String {
    "/sse".to_string()
}

fn default_messages_path() -> String {
    "/messages".to_string()
}

fn default_tools_path() -> String {
    "/tools".to_string()
}

fn default_info_path() -> String {
    "/info".to_string()
}

fn default_request_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_handshake_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1_000 // 1 second
}

fn default_max_delay() -> u64 {
    30_000 // 30 seconds
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sse_path: default_sse_path(),
            messages_path: default_messages_path(),
            tools_path: default_tools_path(),
            info_path: default_info_path(),
            request_timeout_ms: default_request_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            reconnect: RetryConfig::default(),
            headers: HashMap::new(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            default_server: Some("local".to_string()),
            servers: vec![Self::default_local_server()],
        }
    }
}

impl McpConfig {
    /// Local tool server on the default port
    pub fn default_local_server() -> ServerProfile {
        let mut profile = ServerProfile::new("local", ServerEndpoint::new("127.0.0.1", 8080));
        profile.description = "Local MCP tool server".to_string();
        profile
    }

    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        let io_err = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        fs::write(path, contents).map_err(io_err)
    }

    /// Get default config file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;

        Ok(config_dir.join("mcp-session").join("config.toml"))
    }

    /// Load configuration from default path or create default
    pub fn load_or_default() -> ConfigResult<Self> {
        let path = Self::default_config_path()?;

        if path.exists() {
            Self::load_from_file(&path)
        } else {
            let config = Self::default();
            config.save_to_file(&path)?;
            Ok(config)
        }
    }

    /// Find server profile by name
    pub fn find_server(&self, name: &str) -> Option<&ServerProfile> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Get the default server profile
    pub fn default_server_profile(&self) -> Option<&ServerProfile> {
        self.default_server
            .as_ref()
            .and_then(|name| self.find_server(name))
    }

    /// Named profile, or the default one when no name is given
    pub fn resolve_profile(&self, name: Option<&str>) -> ConfigResult<&ServerProfile> {
        match name {
            Some(name) => self
                .find_server(name)
                .ok_or_else(|| ConfigError::ProfileNotFound(name.to_string())),
            None => self.default_server_profile().ok_or_else(|| {
                ConfigError::ProfileNotFound(
                    self.default_server.clone().unwrap_or_else(|| "<default>".into()),
                )
            }),
        }
    }

    /// Add or update a server profile
    pub fn upsert_server(&mut self, profile: ServerProfile) {
        if let Some(existing) = self.servers.iter_mut().find(|s| s.name == profile.name) {
            *existing = profile;
        } else {
            self.servers.push(profile);
        }
    }

    /// Remove a server profile by name
    pub fn remove_server(&mut self, name: &str) -> bool {
        let Some(pos) = self.servers.iter().position(|s| s.name == name) else {
            return false;
        };
        self.servers.remove(pos);

        if self.default_server.as_deref() == Some(name) {
            self.default_server = None;
        }
        true
    }
}
