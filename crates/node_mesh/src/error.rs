use std::net::SocketAddr;

use thiserror::Error;

use crate::node::NodeId;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The accepting side of a connection never dials back.
    #[error("connection to {addr} was accepted, not initiated; refusing to connect")]
    NotInitiator { addr: SocketAddr },
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl ConnectionError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("failed to start event loop: {0}")]
    Runtime(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("discovery {0} is not registered")]
    DiscoveryNotFound(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
