//! mDNS/DNS-SD discovery using mdns-sd.
//!
//! Each node registers `<node_id>._calcp2p._tcp.local.` with the port of its
//! TCP listener, and browses the same service type. Every peer resolved this
//! way becomes a Node holding one outbound TcpConnection.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::discovery::{ActiveDiscovery, CallbackRegistry, DiscoveryHandler, EventKind, HandlerId};
use crate::error::DiscoveryError;
use crate::node::{Node, NodeId};
use crate::peer_dir::PeerDirectory;
use crate::tcp_connection::TcpConnection;

pub const SERVICE_TYPE: &str = "_calcp2p._tcp.local.";
const PROP_NODE_ID: &str = "node_id";
const PROP_VERSION: &str = "version";
const SOURCE: &str = "zeroconf";

const BROWSE_POLL: Duration = Duration::from_millis(200);
const UNREGISTER_WAIT: Duration = Duration::from_secs(1);

/// Announces this node over mDNS and reports the peers it hears.
pub struct ZeroconfService {
    inner: Arc<Inner>,
    ip: String,
    port: AtomicU16,
    running: Mutex<Option<Running>>,
}

/// State shared with the browse thread.
struct Inner {
    instance: NodeId,
    service_type: String,
    callbacks: CallbackRegistry,
    peers: Mutex<PeerDirectory>,
}

struct Running {
    daemon: ServiceDaemon,
    fullname: String,
    shutdown: Arc<AtomicBool>,
    browser: thread::JoinHandle<()>,
}

impl ZeroconfService {
    pub fn new(instance: NodeId, ip: impl Into<String>, port: u16) -> Self {
        Self::with_service_type(SERVICE_TYPE, instance, ip, port)
    }

    /// Use a service type other than [`SERVICE_TYPE`], e.g. to isolate test runs.
    pub fn with_service_type(
        service_type: &str,
        instance: NodeId,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance,
                service_type: service_type.to_string(),
                callbacks: CallbackRegistry::new(),
                peers: Mutex::new(PeerDirectory::new()),
            }),
            ip: ip.into(),
            port: AtomicU16::new(port),
            running: Mutex::new(None),
        }
    }

    pub fn with_max_peers(self, max_peers: usize) -> Self {
        *self.inner.peers.lock() = PeerDirectory::with_max_peers(max_peers);
        self
    }

    pub fn instance(&self) -> NodeId {
        self.inner.instance
    }

    pub fn service_type(&self) -> &str {
        &self.inner.service_type
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Port to advertise on the next `start()`.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn is_broadcasting(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |r| !r.browser.is_finished())
    }

    /// Peers currently known to this service.
    pub fn peers(&self) -> Vec<Arc<Node>> {
        self.inner.peers.lock().all()
    }

    fn register(&self, daemon: &ServiceDaemon) -> Result<String, DiscoveryError> {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "calcp2p-node".into());

        let instance_name = self.inner.instance.to_string();
        let port = self.port();

        let properties = [
            (PROP_NODE_ID.to_string(), instance_name.clone()),
            (
                PROP_VERSION.to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ];

        let auto_addr = self
            .ip
            .parse::<IpAddr>()
            .map_or(true, |ip| ip.is_unspecified());
        let ip = if auto_addr { "" } else { self.ip.as_str() };

        let mut service = ServiceInfo::new(
            &self.inner.service_type,
            &instance_name,
            &format!("{host}.local."),
            ip,
            port,
            &properties[..],
        )?;
        if auto_addr {
            service = service.enable_addr_auto();
        }

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        info!("mDNS: registered {instance_name} on port {port}");
        Ok(fullname)
    }

    fn launch(&self, daemon: &ServiceDaemon) -> Result<Running, DiscoveryError> {
        let fullname = self.register(daemon)?;
        let receiver = daemon.browse(&self.inner.service_type)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let inner = self.inner.clone();

        let browser = thread::Builder::new()
            .name("zeroconf-browse".into())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    match receiver.recv_timeout(BROWSE_POLL) {
                        Ok(event) => inner.handle_event(event),
                        Err(_) if receiver.is_disconnected() => {
                            debug!("mDNS browse channel closed");
                            break;
                        }
                        Err(_) => {
                            // Timeout, just loop again
                        }
                    }
                }
            })
            .map_err(DiscoveryError::Runtime)?;

        Ok(Running {
            daemon: daemon.clone(),
            fullname,
            shutdown,
            browser,
        })
    }
}

impl Inner {
    fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let addrs: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                self.on_resolved(info.get_fullname(), &addrs, info.get_port());
            }
            ServiceEvent::ServiceRemoved(_type, fullname) => {
                self.on_removed(&fullname);
            }
            ServiceEvent::SearchStarted(_) => {
                trace!("mDNS: browse started");
            }
            _ => {}
        }
    }

    /// A peer's record resolved. Returns the node when it is newly discovered.
    fn on_resolved(&self, fullname: &str, addrs: &[IpAddr], port: u16) -> Option<Arc<Node>> {
        let Some(id) = NodeId::from_instance_name(fullname) else {
            debug!("mDNS: ignoring {fullname}: instance name is not a node id");
            return None;
        };

        if id == self.instance {
            debug!("mDNS: ignoring self-discovered instance {id}");
            return None;
        }

        let Some(ip) = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
        else {
            debug!("mDNS: service {fullname} has no address, ignoring");
            return None;
        };
        let addr = SocketAddr::new(ip, port);

        let node = {
            let mut peers = self.peers.lock();
            if peers.contains(&id) {
                drop(peers);
                self.on_updated(id, addr);
                return None;
            }
            let node = Arc::new(Node::with_connection(
                id,
                Arc::new(TcpConnection::outbound(addr)),
            ));
            if let Some(evicted) = peers.insert(node.clone()) {
                debug!("mDNS: peer directory full, forgot {}", evicted.id());
            }
            node
        };

        info!("mDNS: discovered peer {id} at {addr}");
        self.callbacks.fire(EventKind::Discover, SOURCE, node.clone());
        Some(node)
    }

    /// Re-announcement of a known peer. No update policy yet: accepted, no event.
    fn on_updated(&self, id: NodeId, addr: SocketAddr) {
        debug!("mDNS: refreshed peer {id} at {addr}");
    }

    /// Returns true when the removal matched a known peer.
    fn on_removed(&self, fullname: &str) -> bool {
        let Some(id) = NodeId::from_instance_name(fullname) else {
            debug!("mDNS: service removed: {fullname}");
            return false;
        };

        let removed = self.peers.lock().remove(&id);
        match removed {
            Some(node) => {
                info!("mDNS: peer {id} went away");
                self.callbacks.fire(EventKind::Remove, SOURCE, node);
                true
            }
            None => {
                debug!("mDNS: removal for unknown peer {id}, ignoring");
                false
            }
        }
    }
}

impl ActiveDiscovery for ZeroconfService {
    fn name(&self) -> &str {
        SOURCE
    }

    fn register_callback(&self, kind: EventKind, handler: DiscoveryHandler) -> HandlerId {
        self.inner.callbacks.register(kind, handler)
    }

    fn unregister_callback(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.callbacks.unregister(kind, id)
    }

    fn start(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("mDNS: already running");
            return Ok(());
        }

        let daemon = ServiceDaemon::new()?;
        self.inner.callbacks.open();
        match self.launch(&daemon) {
            Ok(r) => {
                *running = Some(r);
                info!("mDNS: browsing for {}", self.inner.service_type);
                Ok(())
            }
            Err(e) => {
                if let Err(err) = daemon.shutdown() {
                    debug!("mDNS: daemon shutdown failed: {err}");
                }
                Err(e)
            }
        }
    }

    fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        self.inner.callbacks.close();
        running.shutdown.store(true, Ordering::SeqCst);

        match running.daemon.unregister(&running.fullname) {
            Ok(status) => {
                if status.recv_timeout(UNREGISTER_WAIT).is_err() {
                    debug!("mDNS: no unregister confirmation for {}", running.fullname);
                }
            }
            Err(e) => debug!("mDNS: failed to unregister: {e}"),
        }
        if let Err(e) = running.daemon.stop_browse(&self.inner.service_type) {
            debug!("mDNS: failed to stop browse: {e}");
        }
        if running.browser.join().is_err() {
            warn!("mDNS: browse thread panicked");
        }
        if let Err(e) = running.daemon.shutdown() {
            debug!("mDNS: daemon shutdown failed: {e}");
        }

        self.inner.peers.lock().drain();
        info!("mDNS: stopped {}", self.inner.instance);
    }

    fn is_active(&self) -> bool {
        self.is_broadcasting() && self.is_listening()
    }
}

impl Drop for ZeroconfService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Direction};
    use crate::discovery::DiscoveryEvent;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn counting(service: &ZeroconfService, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        service.register_callback(
            kind,
            Arc::new(move |_: &DiscoveryEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    fn fullname(id: NodeId) -> String {
        format!("{id}.{SERVICE_TYPE}")
    }

    fn local() -> Vec<IpAddr> {
        vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))]
    }

    #[test]
    fn service_type_is_valid() {
        assert!(SERVICE_TYPE.ends_with(".local."));
        assert!(SERVICE_TYPE.starts_with('_'));
    }

    #[test]
    fn own_announcement_is_filtered() {
        let own = NodeId::random();
        let service = ZeroconfService::new(own, "127.0.0.1", 9000);
        let discovered = counting(&service, EventKind::Discover);

        assert!(service.inner.on_resolved(&fullname(own), &local(), 9000).is_none());
        assert_eq!(discovered.load(Ordering::SeqCst), 0);
        assert!(service.peers().is_empty());
    }

    #[test]
    fn foreign_peer_becomes_outbound_node() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        let discovered = counting(&service, EventKind::Discover);
        let peer = NodeId::random();

        let node = service
            .inner
            .on_resolved(&fullname(peer), &local(), 9100)
            .unwrap();
        assert_eq!(discovered.load(Ordering::SeqCst), 1);
        assert_eq!(node.id(), peer);

        let conns = node.connections();
        assert_eq!(conns.len(), 1);
        let key = conns[0].key();
        assert_eq!(key.direction, Direction::ClientToServer);
        assert_eq!(key.addr, "192.168.1.20:9100".parse().unwrap());
        assert!(!conns[0].is_connected());
    }

    #[test]
    fn re_resolution_is_an_update_not_a_discovery() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        let discovered = counting(&service, EventKind::Discover);
        let updated = counting(&service, EventKind::Update);
        let peer = NodeId::random();

        service.inner.on_resolved(&fullname(peer), &local(), 9100);
        assert!(service.inner.on_resolved(&fullname(peer), &local(), 9100).is_none());
        assert_eq!(discovered.load(Ordering::SeqCst), 1);
        assert_eq!(updated.load(Ordering::SeqCst), 0);
        assert_eq!(service.peers().len(), 1);
    }

    #[test]
    fn unresolvable_or_malformed_records_are_dropped() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        let discovered = counting(&service, EventKind::Discover);

        assert!(service
            .inner
            .on_resolved(&fullname(NodeId::random()), &[], 9100)
            .is_none());
        assert!(service
            .inner
            .on_resolved("printer._calcp2p._tcp.local.", &local(), 9100)
            .is_none());
        assert_eq!(discovered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ipv4_address_is_preferred() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        let addrs = vec!["fe80::1".parse().unwrap(), "10.0.0.7".parse().unwrap()];
        let node = service
            .inner
            .on_resolved(&fullname(NodeId::random()), &addrs, 9100)
            .unwrap();
        assert_eq!(node.connections()[0].key().addr.ip().to_string(), "10.0.0.7");
    }

    #[test]
    fn removal_of_unknown_peer_is_silent() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        let removed = counting(&service, EventKind::Remove);

        assert!(!service.inner.on_removed(&fullname(NodeId::random())));
        assert!(!service.inner.on_removed("garbage"));
        assert_eq!(removed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removal_resolves_known_peer_once() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        let removed = counting(&service, EventKind::Remove);
        let peer = NodeId::random();

        service.inner.on_resolved(&fullname(peer), &local(), 9100);
        assert!(service.inner.on_removed(&fullname(peer)));
        assert!(!service.inner.on_removed(&fullname(peer)));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(service.peers().is_empty());
    }

    #[test]
    fn peer_collection_is_bounded() {
        let service =
            ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000).with_max_peers(2);
        for _ in 0..3 {
            service
                .inner
                .on_resolved(&fullname(NodeId::random()), &local(), 9100);
        }
        assert_eq!(service.peers().len(), 2);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let service = ZeroconfService::new(NodeId::random(), "127.0.0.1", 9000);
        assert!(!service.is_active());
        service.stop();
        service.stop();
        assert!(!service.is_broadcasting());
        assert!(!service.is_listening());
    }

    #[test]
    fn set_port_changes_advertised_port() {
        let service = ZeroconfService::new(NodeId::random(), "0.0.0.0", 0);
        service.set_port(4242);
        assert_eq!(service.port(), 4242);
        assert_eq!(service.service_type(), SERVICE_TYPE);
    }
}
