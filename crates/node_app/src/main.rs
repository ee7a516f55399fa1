use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use node_app::{echo_loop, load_config, run_chat, NodeConfig};
use node_mesh::{
    ActiveDiscovery, Connection, Direction, Network, NetworkConfig, NetworkEvent, NodeId,
    TcpDiscovery, TcpServer, ZeroconfService, TCP,
};

fn build_discovery(config: &NodeConfig, node_id: NodeId) -> Option<Arc<dyn ActiveDiscovery>> {
    let zeroconf = || {
        ZeroconfService::with_service_type(
            &config.service_type,
            node_id,
            config.host.clone(),
            config.port,
        )
        .with_max_peers(config.max_peers)
    };
    let server = || {
        TcpServer::new(config.host.clone(), config.port)
            .with_max_peers(config.max_peers)
            .with_shutdown_timeout(config.shutdown_timeout())
    };

    match (config.enable_mdns, config.enable_tcp_server) {
        (true, true) => Some(Arc::new(TcpDiscovery::from_parts(zeroconf(), server()))),
        (true, false) => Some(Arc::new(zeroconf())),
        (false, true) => Some(Arc::new(server())),
        (false, false) => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let node_id = config.resolve_node_id()?;

    tracing::info!("calcp2p starting...");
    tracing::info!("node_id    = {node_id}");
    tracing::info!("listen     = {}:{}", config.host, config.port);
    tracing::info!("mdns       = {}", config.enable_mdns);
    tracing::info!("tcp_server = {}", config.enable_tcp_server);

    let network = Network::with_config(
        node_id,
        NetworkConfig {
            connect_timeout: config.connect_timeout(),
            ..NetworkConfig::default()
        },
    );
    let mut events = network.subscribe();

    match build_discovery(&config, node_id) {
        Some(discovery) => network
            .add_discovery(discovery)
            .context("start peer discovery")?,
        None => tracing::warn!("all discovery disabled; waiting for nothing"),
    }

    let (chat_done_tx, mut chat_done) = mpsc::channel::<()>(1);
    let mut chatting = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = chat_done.recv() => break,
            event = events.recv() => match event {
                Ok(NetworkEvent::NodeAdded { node, connected }) => {
                    let Some(conn) = node.connection(Some(TCP)) else {
                        continue;
                    };
                    match conn.key().direction {
                        Direction::ServerToClient => {
                            tracing::info!("peer {} connected to us", conn.key().addr);
                            if config.echo_inbound {
                                tokio::spawn(echo_loop(conn));
                            }
                        }
                        Direction::ClientToServer if connected && !chatting => {
                            chatting = true;
                            tracing::info!("chatting with {} at {}", node.id(), conn.key().addr);
                            let exit_command = config.exit_command.clone();
                            let done = chat_done_tx.clone();
                            tokio::spawn(async move {
                                let stdin = BufReader::new(tokio::io::stdin());
                                let stdout = tokio::io::stdout();
                                match run_chat(conn.as_ref(), stdin, stdout, &exit_command).await {
                                    Ok(n) => tracing::info!("chat ended after {n} messages"),
                                    Err(e) => tracing::warn!("chat failed: {e:#}"),
                                }
                                let _ = done.send(()).await;
                            });
                        }
                        Direction::ClientToServer => {
                            tracing::info!(
                                "discovered {} at {} (connected: {connected})",
                                node.id(),
                                conn.key().addr
                            );
                        }
                    }
                }
                Ok(NetworkEvent::NodeUpdated(id)) => tracing::debug!("peer {id} updated"),
                Ok(NetworkEvent::NodeRemoved(id)) => tracing::info!("peer {id} left"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("missed {n} network events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    network.shutdown();
    tracing::info!("calcp2p stopped");

    // A pending stdin read cannot be cancelled and would hold the runtime open.
    std::process::exit(0);
}
