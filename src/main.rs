//! mcpctl - command line client for SSE-based MCP tool servers
//!
//! Connects, waits for the session handshake, then calls a tool, lists the
//! tool catalogue, prints server info, or watches the session status.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use mcp_session::logging::{self, LogFormat, LoggingConfig};
use mcp_session::{ClientConfig, McpClient, McpConfig, ServerEndpoint};

#[derive(Parser, Debug)]
#[command(name = "mcpctl")]
#[command(about = "Call tools on an MCP server over an SSE session")]
#[command(version)]
struct Cli {
    /// Server base URL; overrides the config profile
    #[arg(short, long, env = "MCP_SERVER_URL", global = true)]
    server: Option<String>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server profile name from the configuration file
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Request timeout in seconds
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Invoke a tool and print its result
    Call {
        /// Tool name
        tool: String,

        /// Parameters as JSON; anything else is sent as {"input": ...}
        params: Option<String>,

        /// Print the raw result event instead of the unwrapped value
        #[arg(long)]
        raw: bool,
    },

    /// List the tools the server offers
    Tools,

    /// Show server name and version
    Info,

    /// Stay connected and log status changes until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LoggingConfig {
        level: logging::parse_level(&cli.log_level),
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Compact
        },
        file_output: cli.log_file.is_some(),
        file_path: cli.log_file.clone(),
        ..LoggingConfig::default()
    };
    logging::init_logging(&log_config).context("failed to initialize logging")?;

    let config = client_config(&cli)?;
    let client = McpClient::new(config);

    let outcome = run(&cli, &client).await;
    client.disconnect();
    outcome
}

async fn run(cli: &Cli, client: &McpClient) -> Result<()> {
    match &cli.command {
        Commands::Call { tool, params, raw } => {
            let parameters = parse_parameters(params.as_deref());
            connect(client).await?;

            let result = client
                .invoke_tool(tool, parameters)
                .await
                .with_context(|| format!("tool '{tool}' failed"))?;
            let output = if *raw { result.into_raw() } else { result.value() };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Tools => {
            let tools = client.list_tools().await.context("failed to list tools")?;
            if tools.is_empty() {
                println!("No tools available");
            }
            for tool in tools {
                match tool.description.as_deref().filter(|d| !d.is_empty()) {
                    Some(description) => println!("- {}: {}", tool.name, description),
                    None => println!("- {}", tool.name),
                }
            }
        }
        Commands::Info => {
            let info = client
                .server_info()
                .await
                .context("failed to fetch server info")?;
            println!("{}", info.display_name());
            if !info.extra.is_empty() {
                println!("{}", serde_json::to_string_pretty(&info.extra)?);
            }
        }
        Commands::Watch => watch(client).await?,
    }
    Ok(())
}

async fn connect(client: &McpClient) -> Result<()> {
    let snapshot = client
        .connect()
        .await
        .with_context(|| format!("cannot connect to {}", client.config().endpoint))?;
    tracing::info!(
        session_id = snapshot.session_id.as_deref().unwrap_or_default(),
        "connected"
    );
    Ok(())
}

async fn watch(client: &McpClient) -> Result<()> {
    let mut changes = client.subscribe();

    // Failure here is already being retried by the reconnect policy
    if let Err(err) = client.connect().await {
        tracing::warn!(%err, "initial connect failed");
    }
    println!("{}", serde_json::to_string(&client.snapshot())?);

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => println!("{}", serde_json::to_string(&change)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status observer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

/// Connection settings from `--server`, or from the config file profile
fn client_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.server {
        Some(url) => ClientConfig::new(
            ServerEndpoint::parse(url).with_context(|| format!("invalid server URL '{url}'"))?,
        ),
        None => {
            let mcp_config = match &cli.config {
                Some(path) => McpConfig::load_from_file(path)
                    .with_context(|| format!("cannot load {}", path.display()))?,
                None => McpConfig::load_or_default().context("cannot load configuration")?,
            };
            mcp_config
                .resolve_profile(cli.profile.as_deref())?
                .client_config()
        }
    };

    if let Some(secs) = cli.timeout {
        config.session.request_timeout_ms = Duration::from_secs(secs).as_millis() as u64;
    }
    Ok(config)
}

/// Interpret the raw parameter argument
///
/// JSON first, then JSON with shell-escaped quotes, else `{"input": raw}`.
fn parse_parameters(raw: Option<&str>) -> Value {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return json!({});
    };

    if let Ok(value) = serde_json::from_str(raw) {
        return value;
    }
    if raw.contains("\\\"") {
        if let Ok(value) = serde_json::from_str(&raw.replace("\\\"", "\"")) {
            return value;
        }
    }
    json!({ "input": raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_parameters_json() {
        assert_eq!(
            parse_parameters(Some(r#"{"dirPath": "."}"#)),
            json!({"dirPath": "."})
        );
    }

    #[test]
    fn test_parse_parameters_escaped_json() {
        assert_eq!(
            parse_parameters(Some(r#"{\"filePath\": \"a.txt\"}"#)),
            json!({"filePath": "a.txt"})
        );
    }

    #[test]
    fn test_parse_parameters_fallback() {
        assert_eq!(
            parse_parameters(Some("ls -la")),
            json!({"input": "ls -la"})
        );
        assert_eq!(parse_parameters(None), json!({}));
        assert_eq!(parse_parameters(Some("  ")), json!({}));
    }

    #[test]
    fn test_cli_server_overrides_profile() {
        let cli = Cli::parse_from([
            "mcpctl",
            "--server",
            "http://10.1.2.3:9000",
            "--timeout",
            "3",
            "call",
            "echo",
        ]);
        let config = client_config(&cli).unwrap();
        assert_eq!(config.endpoint.base_url(), "http://10.1.2.3:9000");
        assert_eq!(config.session.request_timeout_ms, 3_000);
    }

    #[test]
    fn test_cli_profile_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut mcp_config = McpConfig::default();
        mcp_config.upsert_server(mcp_session::mcp::ServerProfile::new(
            "lab",
            ServerEndpoint::new("lab.internal", 7000),
        ));
        mcp_config.save_to_file(&path).unwrap();

        let cli = Cli::parse_from([
            "mcpctl",
            "--config",
            path.to_str().unwrap(),
            "--profile",
            "lab",
            "tools",
        ]);
        let config = client_config(&cli).unwrap();
        assert_eq!(config.endpoint.base_url(), "http://lab.internal:7000");

        let cli = Cli::parse_from([
            "mcpctl",
            "--config",
            path.to_str().unwrap(),
            "--profile",
            "missing",
            "tools",
        ]);
        assert!(client_config(&cli).is_err());
    }
}
