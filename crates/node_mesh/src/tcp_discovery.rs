//! TCP discovery: accept inbound peers and announce the accepting port over
//! mDNS, as one [`ActiveDiscovery`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::discovery::{ActiveDiscovery, DiscoveryHandler, EventKind, HandlerId};
use crate::error::DiscoveryError;
use crate::node::NodeId;
use crate::tcp_server::TcpServer;
use crate::zeroconf::ZeroconfService;

pub struct TcpDiscovery {
    zeroconf: ZeroconfService,
    server: TcpServer,
    // Composite id (the zeroconf one) -> the server's id for the same handler.
    handlers: Mutex<HashMap<HandlerId, HandlerId>>,
}

impl TcpDiscovery {
    pub fn new(node_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self::from_parts(
            ZeroconfService::new(node_id, host.clone(), port),
            TcpServer::new(host, port),
        )
    }

    pub fn from_parts(zeroconf: ZeroconfService, server: TcpServer) -> Self {
        Self {
            zeroconf,
            server,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn zeroconf(&self) -> &ZeroconfService {
        &self.zeroconf
    }

    pub fn server(&self) -> &TcpServer {
        &self.server
    }
}

impl ActiveDiscovery for TcpDiscovery {
    fn name(&self) -> &str {
        "tcp"
    }

    fn register_callback(&self, kind: EventKind, handler: DiscoveryHandler) -> HandlerId {
        let id = self.zeroconf.register_callback(kind, handler.clone());
        let server_id = self.server.register_callback(kind, handler);
        self.handlers.lock().insert(id, server_id);
        id
    }

    fn unregister_callback(&self, kind: EventKind, id: HandlerId) -> bool {
        let Some(server_id) = self.handlers.lock().get(&id).copied() else {
            return false;
        };
        let zeroconf = self.zeroconf.unregister_callback(kind, id);
        let server = self.server.unregister_callback(kind, server_id);
        if zeroconf || server {
            self.handlers.lock().remove(&id);
        }
        zeroconf && server
    }

    /// Binds first, so the announced port is the one actually listening.
    fn start(&self) -> Result<(), DiscoveryError> {
        self.server.start()?;
        if let Some(addr) = self.server.local_addr() {
            self.zeroconf.set_port(addr.port());
        }
        if let Err(e) = self.zeroconf.start() {
            self.server.stop();
            return Err(e);
        }
        info!(
            "TcpDiscovery up: {} on port {}",
            self.zeroconf.instance(),
            self.zeroconf.port()
        );
        Ok(())
    }

    fn stop(&self) {
        self.zeroconf.stop();
        self.server.stop();
    }

    fn is_active(&self) -> bool {
        self.zeroconf.is_active() && self.server.is_active()
    }
}
