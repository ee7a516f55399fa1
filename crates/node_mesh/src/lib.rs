//! Peer discovery and connection management for calcp2p nodes.
//!
//! Discovery back-ends (mDNS via [`ZeroconfService`], passive accept via
//! [`TcpServer`], or both via [`TcpDiscovery`]) report peers as [`Node`]s;
//! a [`Network`] subscribes to them and keeps the registry of known peers.

pub mod connection;
pub mod discovery;
pub mod error;
pub mod network;
pub mod node;
pub mod peer_dir;
pub mod tcp_connection;
pub mod tcp_discovery;
pub mod tcp_server;
pub mod zeroconf;

pub use connection::{Connection, ConnectionKey, Direction, MockConnection, TCP};
pub use discovery::{
    ActiveDiscovery, CallbackRegistry, DiscoveryEvent, DiscoveryHandler, EventKind, HandlerId,
};
pub use error::{ConnectionError, DiscoveryError, NetworkError};
pub use network::{Network, NetworkConfig, NetworkEvent};
pub use node::{Node, NodeId};
pub use peer_dir::PeerDirectory;
pub use tcp_connection::TcpConnection;
pub use tcp_discovery::TcpDiscovery;
pub use tcp_server::TcpServer;
pub use zeroconf::{ZeroconfService, SERVICE_TYPE};
