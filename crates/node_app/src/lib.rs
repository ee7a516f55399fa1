//! Node wiring: configuration, the interactive chat loop and the inbound
//! echo responder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use node_mesh::{Connection, NodeId, SERVICE_TYPE};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const CONFIG_FILE: &str = "calcp2p.toml";
pub const CONFIG_ENV: &str = "CALCP2P_CONFIG";
pub const PROMPT: &str = "Enter message to send (or 'exit' to quit): ";

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Fixed identity; a random one is minted when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    #[serde(default = "default_true")]
    pub enable_tcp_server: bool,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub echo_inbound: bool,
    #[serde(default = "default_exit_command")]
    pub exit_command: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_true() -> bool {
    true
}
fn default_service_type() -> String {
    SERVICE_TYPE.into()
}
fn default_max_peers() -> usize {
    30
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_shutdown_timeout_ms() -> u64 {
    2000
}
fn default_exit_command() -> String {
    "exit".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            node_id: None,
            enable_mdns: true,
            enable_tcp_server: true,
            service_type: default_service_type(),
            max_peers: default_max_peers(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            echo_inbound: true,
            exit_command: default_exit_command(),
        }
    }
}

impl NodeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn resolve_node_id(&self) -> Result<NodeId> {
        match &self.node_id {
            Some(id) => id
                .parse::<NodeId>()
                .with_context(|| format!("invalid node_id {id:?}")),
            None => Ok(NodeId::random()),
        }
    }
}

/// Config path: `$CALCP2P_CONFIG` when set, else `calcp2p.toml`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

pub fn load_config() -> Result<NodeConfig> {
    load_config_from(&config_path())
}

/// A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Ok(NodeConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let config: NodeConfig =
        toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(config)
}

/// Line in, line out: send each input line over `conn` and print the reply.
///
/// Stops at end of input, on `exit_command`, or once the connection fails.
/// Returns the number of messages that made the round trip.
pub async fn run_chat<R, W>(
    conn: &dyn Connection,
    mut input: R,
    mut output: W,
    exit_command: &str,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut exchanged = 0;
    let mut line = String::new();
    loop {
        output.write_all(PROMPT.as_bytes()).await.context("write prompt")?;
        output.flush().await?;

        line.clear();
        if input.read_line(&mut line).await.context("read input")? == 0 {
            break;
        }
        let message = line.trim_end_matches(['\r', '\n']);
        if message == exit_command {
            break;
        }

        if !conn.write(message.as_bytes()).await {
            warn!("send to {} failed; ending chat", conn.key().addr);
            break;
        }
        let Some(reply) = conn.read().await else {
            info!("{} closed the connection", conn.key().addr);
            break;
        };
        let reply = String::from_utf8_lossy(&reply);
        output
            .write_all(format!("Received back: {reply}\n").as_bytes())
            .await
            .context("write reply")?;
        exchanged += 1;
    }
    output.flush().await?;
    Ok(exchanged)
}

/// Write back everything the peer sends until it goes away.
pub async fn echo_loop(conn: Arc<dyn Connection>) -> usize {
    let mut echoed = 0;
    while let Some(chunk) = conn.read().await {
        debug!("echoing {} bytes to {}", chunk.len(), conn.key().addr);
        if !conn.write(&chunk).await {
            break;
        }
        echoed += 1;
    }
    info!("echo to {} finished after {echoed} messages", conn.key().addr);
    echoed
}
