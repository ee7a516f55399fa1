//! Peer identity and the per-peer set of connections.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::connection::Connection;

/// Process-wide unique peer identifier (random 128-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the identifier embedded as the first label of an mDNS
    /// instance name, e.g. `<id>._calcp2p._tcp.local.`.
    pub fn from_instance_name(fullname: &str) -> Option<Self> {
        fullname.split('.').next()?.parse().ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A remote peer: a fixed identity plus every connection known to reach it.
///
/// Connections are only ever added. A stale one stays in place, marked
/// disconnected, and can be re-dialed.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    connections: RwLock<Vec<Arc<dyn Connection>>>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            connections: RwLock::new(Vec::new()),
        }
    }

    /// Convenience for discovery back-ends: a node holding one connection.
    pub fn with_connection(id: NodeId, conn: Arc<dyn Connection>) -> Self {
        let node = Self::new(id);
        node.add_connection(conn);
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Add a connection. Returns false, without mutating, if an equal
    /// connection is already present.
    pub fn add_connection(&self, conn: Arc<dyn Connection>) -> bool {
        let mut conns = self.connections.write();
        if conns.iter().any(|c| **c == *conn) {
            return false;
        }
        conns.push(conn);
        true
    }

    /// Snapshot in insertion order.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.read().clone()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn protocols(&self) -> BTreeSet<&'static str> {
        self.connections.read().iter().map(|c| c.protocol()).collect()
    }

    pub fn connected_protocols(&self) -> BTreeSet<&'static str> {
        self.connections
            .read()
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| c.protocol())
            .collect()
    }

    /// First connected connection matching `protocol`, else the first matching one.
    pub fn connection(&self, protocol: Option<&str>) -> Option<Arc<dyn Connection>> {
        let matching = self.matching(protocol);
        matching
            .iter()
            .find(|c| c.is_connected())
            .or_else(|| matching.first())
            .cloned()
    }

    pub async fn is_alive(&self, protocol: Option<&str>) -> bool {
        for conn in self.matching(protocol) {
            if conn.is_alive().await {
                return true;
            }
        }
        false
    }

    /// Try each matching connection in order; stop at the first that is
    /// (or becomes) connected.
    pub async fn connect(&self, protocol: Option<&str>) -> bool {
        for conn in self.matching(protocol) {
            match conn.connect().await {
                Ok(()) => return true,
                Err(e) => debug!("node {}: {} connect failed: {e}", self.id, conn.protocol()),
            }
        }
        false
    }

    /// Disconnects the first matching connection that is *not* connected and
    /// returns its result; true when no matching connection needed action.
    ///
    /// Connected matches are skipped. This mirrors the behaviour this layer
    /// has always had and is kept until the intended policy is settled.
    pub async fn disconnect(&self, protocol: Option<&str>) -> bool {
        for conn in self.matching(protocol) {
            if conn.is_connected() {
                continue;
            }
            return conn.disconnect().await;
        }
        true
    }

    fn matching(&self, protocol: Option<&str>) -> Vec<Arc<dyn Connection>> {
        self.connections
            .read()
            .iter()
            .filter(|c| protocol.map_or(true, |p| c.protocol() == p))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Direction, MockConnection, TCP};
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], port))
    }

    fn mock(port: u16, direction: Direction) -> Arc<MockConnection> {
        Arc::new(MockConnection::new(TCP, addr(port), direction))
    }

    #[test]
    fn node_id_roundtrips_through_instance_name() {
        let id = NodeId::random();
        let fullname = format!("{id}._calcp2p._tcp.local.");
        assert_eq!(NodeId::from_instance_name(&fullname), Some(id));
        assert_eq!(NodeId::from_instance_name("not-a-uuid._calcp2p._tcp.local."), None);
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn equal_connection_is_not_added_twice() {
        let node = Node::new(NodeId::random());
        assert!(node.add_connection(mock(9000, Direction::ClientToServer)));
        assert!(!node.add_connection(mock(9000, Direction::ClientToServer)));
        assert_eq!(node.len(), 1);

        // Same peer, opposite direction: both coexist.
        assert!(node.add_connection(mock(9000, Direction::ServerToClient)));
        assert_eq!(node.len(), 2);
    }

    #[tokio::test]
    async fn derived_protocol_sets() {
        let node = Node::new(NodeId::random());
        let conn = mock(9000, Direction::ClientToServer);
        node.add_connection(conn.clone());
        assert_eq!(node.protocols().into_iter().collect::<Vec<_>>(), vec![TCP]);
        assert!(node.connected_protocols().is_empty());

        assert!(node.connect(None).await);
        assert_eq!(node.connected_protocols().len(), 1);
        assert!(!node.connect(Some("UDP")).await);
    }

    #[tokio::test]
    async fn connect_short_circuits_on_first_success() {
        let node = Node::new(NodeId::random());
        let refused = mock(9000, Direction::ClientToServer);
        refused.set_reachable(false);
        let ok = mock(9001, Direction::ClientToServer);
        let spare = mock(9002, Direction::ClientToServer);
        node.add_connection(refused.clone());
        node.add_connection(ok.clone());
        node.add_connection(spare.clone());

        assert!(node.connect(Some(TCP)).await);
        assert_eq!(refused.connect_attempts(), 1);
        assert!(ok.is_connected());
        assert_eq!(spare.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn connect_skips_accepted_connections() {
        let node = Node::new(NodeId::random());
        let accepted = mock(9000, Direction::ServerToClient);
        node.add_connection(accepted);
        assert!(!node.connect(None).await);
    }

    #[tokio::test]
    async fn is_alive_checks_any_matching_connection() {
        let node = Node::new(NodeId::random());
        let idle = mock(9000, Direction::ClientToServer);
        let live = Arc::new(MockConnection::connected(
            TCP,
            addr(9001),
            Direction::ServerToClient,
        ));
        node.add_connection(idle.clone());
        node.add_connection(live.clone());

        assert!(node.is_alive(None).await);
        assert!(!node.is_alive(Some("UDP")).await);
        assert_eq!(idle.probe_count(), 0);
        assert_eq!(live.probe_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_acts_only_on_idle_matches() {
        let node = Node::new(NodeId::random());
        let live = Arc::new(MockConnection::connected(
            TCP,
            addr(9000),
            Direction::ClientToServer,
        ));
        node.add_connection(live.clone());

        assert!(node.disconnect(None).await);
        assert!(live.is_connected(), "connected matches are skipped");
        assert_eq!(live.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_takes_the_first_idle_match() {
        let node = Node::new(NodeId::random());
        let idle = mock(9000, Direction::ClientToServer);
        let live = Arc::new(MockConnection::connected(
            TCP,
            addr(9001),
            Direction::ClientToServer,
        ));
        let spare = mock(9002, Direction::ClientToServer);
        node.add_connection(live.clone());
        node.add_connection(idle.clone());
        node.add_connection(spare.clone());

        assert!(node.disconnect(Some(TCP)).await);
        assert_eq!(idle.disconnect_count(), 1);
        assert_eq!(spare.disconnect_count(), 0);
        assert_eq!(live.disconnect_count(), 0);
        assert!(live.is_connected());

        // Idle first, connected second: only the idle one is touched.
        let node = Node::new(NodeId::random());
        let idle = mock(9100, Direction::ClientToServer);
        let live = Arc::new(MockConnection::connected(
            TCP,
            addr(9101),
            Direction::ClientToServer,
        ));
        node.add_connection(idle.clone());
        node.add_connection(live.clone());

        assert!(node.disconnect(None).await);
        assert_eq!(idle.disconnect_count(), 1);
        assert_eq!(live.disconnect_count(), 0);
        assert!(live.is_connected());
    }

    #[test]
    fn connection_prefers_connected() {
        let node = Node::new(NodeId::random());
        let idle = mock(9000, Direction::ClientToServer);
        let live = Arc::new(MockConnection::connected(
            TCP,
            addr(9001),
            Direction::ServerToClient,
        ));
        node.add_connection(idle);
        node.add_connection(live);

        let picked = node.connection(Some(TCP)).unwrap();
        assert_eq!(picked.key().addr.port(), 9001);
        assert!(node.connection(Some("UDP")).is_none());
    }
}
