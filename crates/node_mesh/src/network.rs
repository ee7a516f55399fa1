//! The registry of known peers, fed by any number of discovery back-ends.
//!
//! Discovery handlers run on the back-ends' own threads, so they only
//! forward events into a channel. A single task owned by the Network drains
//! it: dialing newly discovered nodes, keeping the registry current, and
//! broadcasting [`NetworkEvent`]s to subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{ActiveDiscovery, DiscoveryEvent, EventKind, HandlerId};
use crate::error::NetworkError;
use crate::node::{Node, NodeId};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Dial newly discovered nodes before registering them.
    pub auto_connect: bool,
    pub connect_timeout: Duration,
    /// Buffer size of the subscriber broadcast channel.
    pub event_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Registry changes, as seen by subscribers.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    NodeAdded { node: Arc<Node>, connected: bool },
    NodeUpdated(NodeId),
    NodeRemoved(NodeId),
}

struct Subscription {
    discovery: Arc<dyn ActiveDiscovery>,
    handlers: Vec<(EventKind, HandlerId)>,
}

type Registry = Arc<RwLock<HashMap<NodeId, Arc<Node>>>>;

pub struct Network {
    host_id: NodeId,
    nodes: Registry,
    discoveries: Mutex<Vec<Subscription>>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    notify: broadcast::Sender<NetworkEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    /// Must be called within a Tokio runtime.
    pub fn new(host_id: NodeId) -> Self {
        Self::with_config(host_id, NetworkConfig::default())
    }

    pub fn with_config(host_id: NodeId, config: NetworkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(config.event_capacity.max(1));
        let nodes: Registry = Arc::new(RwLock::new(HashMap::new()));

        let worker = tokio::spawn(event_loop(
            nodes.clone(),
            events_rx,
            notify.clone(),
            config,
        ));

        Self {
            host_id,
            nodes,
            discoveries: Mutex::new(Vec::new()),
            events_tx,
            notify,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn host_id(&self) -> NodeId {
        self.host_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.notify.subscribe()
    }

    /// Subscribe to `discovery` and start it. On failure nothing stays
    /// registered.
    pub fn add_discovery(&self, discovery: Arc<dyn ActiveDiscovery>) -> Result<(), NetworkError> {
        let mut handlers = Vec::with_capacity(3);
        for kind in [EventKind::Discover, EventKind::Update, EventKind::Remove] {
            let tx = self.events_tx.clone();
            let id = discovery.register_callback(
                kind,
                Arc::new(move |event: &DiscoveryEvent| {
                    if tx.send(event.clone()).is_err() {
                        debug!("network closed; dropping {} from {}", event.kind, event.source);
                    }
                }),
            );
            handlers.push((kind, id));
        }

        if let Err(e) = discovery.start() {
            for (kind, id) in handlers {
                discovery.unregister_callback(kind, id);
            }
            return Err(e.into());
        }

        info!("network {}: added discovery {}", self.host_id, discovery.name());
        self.discoveries.lock().push(Subscription { discovery, handlers });
        Ok(())
    }

    /// Stop and unsubscribe a discovery previously passed to `add_discovery`.
    pub fn remove_discovery(
        &self,
        discovery: &Arc<dyn ActiveDiscovery>,
    ) -> Result<(), NetworkError> {
        let sub = {
            let mut subs = self.discoveries.lock();
            let pos = subs
                .iter()
                .position(|s| Arc::ptr_eq(&s.discovery, discovery))
                .ok_or_else(|| NetworkError::DiscoveryNotFound(discovery.name().to_string()))?;
            subs.remove(pos)
        };
        release(sub);
        Ok(())
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.lock().len()
    }

    /// Insert or replace the node registered under its id.
    pub async fn add_node(&self, node: Arc<Node>) -> Option<Arc<Node>> {
        let connected = !node.connected_protocols().is_empty();
        insert_node(&self.nodes, &self.notify, node, connected).await
    }

    pub async fn remove_node(&self, id: &NodeId) -> Result<Arc<Node>, NetworkError> {
        remove_node(&self.nodes, &self.notify, id).await
    }

    pub async fn node(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Stop every discovery and the event task. Registered nodes are kept.
    ///
    /// Blocks while back-ends wind down their threads.
    pub fn shutdown(&self) {
        let subs: Vec<Subscription> = self.discoveries.lock().drain(..).collect();
        for sub in subs {
            release(sub);
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
            info!("network {} shut down", self.host_id);
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release(sub: Subscription) {
    sub.discovery.stop();
    for (kind, id) in sub.handlers {
        sub.discovery.unregister_callback(kind, id);
    }
    debug!("released discovery {}", sub.discovery.name());
}

async fn insert_node(
    nodes: &Registry,
    notify: &broadcast::Sender<NetworkEvent>,
    node: Arc<Node>,
    connected: bool,
) -> Option<Arc<Node>> {
    let previous = nodes.write().await.insert(node.id(), node.clone());
    // No subscribers is fine.
    let _ = notify.send(NetworkEvent::NodeAdded { node, connected });
    previous
}

async fn remove_node(
    nodes: &Registry,
    notify: &broadcast::Sender<NetworkEvent>,
    id: &NodeId,
) -> Result<Arc<Node>, NetworkError> {
    let removed = nodes
        .write()
        .await
        .remove(id)
        .ok_or(NetworkError::NodeNotFound(*id))?;
    let _ = notify.send(NetworkEvent::NodeRemoved(*id));
    Ok(removed)
}

async fn event_loop(
    nodes: Registry,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    notify: broadcast::Sender<NetworkEvent>,
    config: NetworkConfig,
) {
    while let Some(event) = events.recv().await {
        let id = event.node.id();
        match event.kind {
            EventKind::Discover => {
                let connected = if config.auto_connect {
                    dial(&event.node, config.connect_timeout).await
                } else {
                    false
                };
                info!("{} discovered node {id} (connected: {connected})", event.source);
                insert_node(&nodes, &notify, event.node, connected).await;
            }
            EventKind::Update => {
                debug!("{} updated node {id}", event.source);
                let _ = notify.send(NetworkEvent::NodeUpdated(id));
            }
            EventKind::Remove => match remove_node(&nodes, &notify, &id).await {
                Ok(_) => info!("{} removed node {id}", event.source),
                Err(e) => debug!("{}: {e}", event.source),
            },
            EventKind::Connect | EventKind::Disconnect => {
                debug!("{} raised {} for node {id}", event.source, event.kind);
            }
        }
    }
    debug!("network event loop finished");
}

async fn dial(node: &Node, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, node.connect(None)).await {
        Ok(connected) => connected,
        Err(_) => {
            warn!("connecting to node {} timed out after {timeout:?}", node.id());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Direction, MockConnection, TCP};
    use crate::discovery::{CallbackRegistry, DiscoveryHandler};
    use crate::error::DiscoveryError;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeDiscovery {
        callbacks: CallbackRegistry,
        active: AtomicBool,
        fail_start: bool,
    }

    impl FakeDiscovery {
        fn failing() -> Self {
            Self {
                fail_start: true,
                ..Self::default()
            }
        }

        fn emit(&self, kind: EventKind, node: Arc<Node>) -> usize {
            self.callbacks.fire(kind, "fake", node)
        }
    }

    impl ActiveDiscovery for FakeDiscovery {
        fn name(&self) -> &str {
            "fake"
        }

        fn register_callback(&self, kind: EventKind, handler: DiscoveryHandler) -> HandlerId {
            self.callbacks.register(kind, handler)
        }

        fn unregister_callback(&self, kind: EventKind, id: HandlerId) -> bool {
            self.callbacks.unregister(kind, id)
        }

        fn start(&self) -> Result<(), DiscoveryError> {
            if self.fail_start {
                return Err(DiscoveryError::Runtime(std::io::Error::other("boom")));
            }
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.active.store(false, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    fn peer(port: u16) -> (Arc<Node>, Arc<MockConnection>) {
        let addr = SocketAddr::from(([10, 0, 0, 2], port));
        let conn = Arc::new(MockConnection::new(TCP, addr, Direction::ClientToServer));
        let node = Arc::new(Node::with_connection(NodeId::random(), conn.clone()));
        (node, conn)
    }

    async fn next(rx: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for network event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn add_discovery_subscribes_and_starts() {
        let network = Network::new(NodeId::random());
        let fake = Arc::new(FakeDiscovery::default());
        network.add_discovery(fake.clone()).unwrap();

        assert!(fake.is_active());
        assert_eq!(network.discovery_count(), 1);
        for kind in [EventKind::Discover, EventKind::Update, EventKind::Remove] {
            assert_eq!(fake.callbacks.handler_count(kind), 1);
        }
        assert_eq!(fake.callbacks.handler_count(EventKind::Connect), 0);

        let as_dyn: Arc<dyn ActiveDiscovery> = fake.clone();
        network.remove_discovery(&as_dyn).unwrap();
        assert!(!fake.is_active());
        assert_eq!(fake.callbacks.handler_count(EventKind::Discover), 0);
        assert!(matches!(
            network.remove_discovery(&as_dyn),
            Err(NetworkError::DiscoveryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_registered() {
        let network = Network::new(NodeId::random());
        let fake = Arc::new(FakeDiscovery::failing());

        let err = network.add_discovery(fake.clone()).unwrap_err();
        assert!(matches!(err, NetworkError::Discovery(_)));
        assert_eq!(network.discovery_count(), 0);
        assert_eq!(fake.callbacks.handler_count(EventKind::Discover), 0);
    }

    #[tokio::test]
    async fn discovered_node_is_dialed_and_registered() {
        let network = Network::new(NodeId::random());
        let mut events = network.subscribe();
        let fake = Arc::new(FakeDiscovery::default());
        network.add_discovery(fake.clone()).unwrap();

        let (node, conn) = peer(7000);
        assert_eq!(fake.emit(EventKind::Discover, node.clone()), 1);

        match next(&mut events).await {
            NetworkEvent::NodeAdded { node: added, connected } => {
                assert_eq!(added.id(), node.id());
                assert!(connected);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(conn.is_connected());
        assert_eq!(network.node(&node.id()).await.unwrap().id(), node.id());
        assert_eq!(network.len().await, 1);
    }

    #[tokio::test]
    async fn unreachable_node_is_still_registered() {
        let network = Network::new(NodeId::random());
        let mut events = network.subscribe();
        let fake = Arc::new(FakeDiscovery::default());
        network.add_discovery(fake.clone()).unwrap();

        let (node, conn) = peer(7001);
        conn.set_reachable(false);
        fake.emit(EventKind::Discover, node.clone());

        match next(&mut events).await {
            NetworkEvent::NodeAdded { connected, .. } => assert!(!connected),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(network.node(&node.id()).await.is_some());
    }

    #[tokio::test]
    async fn auto_connect_off_skips_dialing() {
        let config = NetworkConfig {
            auto_connect: false,
            ..NetworkConfig::default()
        };
        let network = Network::with_config(NodeId::random(), config);
        let mut events = network.subscribe();
        let fake = Arc::new(FakeDiscovery::default());
        network.add_discovery(fake.clone()).unwrap();

        let (node, conn) = peer(7002);
        fake.emit(EventKind::Discover, node);
        next(&mut events).await;
        assert_eq!(conn.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn remove_event_drops_the_node() {
        let network = Network::new(NodeId::random());
        let mut events = network.subscribe();
        let fake = Arc::new(FakeDiscovery::default());
        network.add_discovery(fake.clone()).unwrap();

        let (node, _) = peer(7003);
        fake.emit(EventKind::Discover, node.clone());
        next(&mut events).await;

        fake.emit(EventKind::Update, node.clone());
        let event = next(&mut events).await;
        assert!(matches!(event, NetworkEvent::NodeUpdated(id) if id == node.id()));

        fake.emit(EventKind::Remove, node.clone());
        let event = next(&mut events).await;
        assert!(matches!(event, NetworkEvent::NodeRemoved(id) if id == node.id()));
        assert!(network.is_empty().await);

        // A second removal is absorbed by the event loop.
        fake.emit(EventKind::Remove, node.clone());
        let (other, _) = peer(7004);
        fake.emit(EventKind::Discover, other.clone());
        match next(&mut events).await {
            NetworkEvent::NodeAdded { node: added, .. } => assert_eq!(added.id(), other.id()),
            ev => panic!("unexpected event {ev:?}"),
        }
    }

    #[tokio::test]
    async fn direct_registry_operations() {
        let network = Network::new(NodeId::random());
        let (node, _) = peer(7005);

        assert!(network.add_node(node.clone()).await.is_none());
        assert!(network.add_node(node.clone()).await.is_some());
        assert_eq!(network.nodes().await.len(), 1);

        let removed = network.remove_node(&node.id()).await.unwrap();
        assert_eq!(removed.id(), node.id());
        assert!(matches!(
            network.remove_node(&node.id()).await,
            Err(NetworkError::NodeNotFound(id)) if id == node.id()
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_every_discovery() {
        let network = Network::new(NodeId::random());
        let a = Arc::new(FakeDiscovery::default());
        let b = Arc::new(FakeDiscovery::default());
        network.add_discovery(a.clone()).unwrap();
        network.add_discovery(b.clone()).unwrap();
        let (node, _) = peer(7006);
        network.add_node(node).await;

        network.shutdown();
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert_eq!(network.discovery_count(), 0);
        assert_eq!(network.len().await, 1);

        // Events raised after shutdown have nowhere to go.
        let (late, _) = peer(7007);
        assert_eq!(a.emit(EventKind::Discover, late), 0);
    }
}
