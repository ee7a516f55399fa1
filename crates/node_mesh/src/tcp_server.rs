//! Passive discovery: every inbound TCP connection is reported as a newly
//! discovered peer.
//!
//! The accept loop runs on a dedicated thread driving its own single-threaded
//! Tokio runtime, so `start()` returns as soon as the socket is bound. The
//! accepted streams stay registered with that runtime and are closed when
//! the server stops.

use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::discovery::{ActiveDiscovery, CallbackRegistry, DiscoveryHandler, EventKind, HandlerId};
use crate::error::DiscoveryError;
use crate::node::{Node, NodeId};
use crate::peer_dir::PeerDirectory;
use crate::tcp_connection::TcpConnection;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const SOURCE: &str = "tcp-server";

/// A TCP listener that turns each accepted connection into a Node.
pub struct TcpServer {
    host: String,
    port: u16,
    callbacks: Arc<CallbackRegistry>,
    peers: Arc<Mutex<PeerDirectory>>,
    shutdown_timeout: Duration,
    running: Mutex<Option<ServerHandle>>,
}

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    done_rx: mpsc::Receiver<()>,
    thread: thread::JoinHandle<()>,
}

impl TcpServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            callbacks: Arc::new(CallbackRegistry::new()),
            peers: Arc::new(Mutex::new(PeerDirectory::new())),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            running: Mutex::new(None),
        }
    }

    /// Upper bound on how long `stop()` waits for the accept thread.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_peers(self, max_peers: usize) -> Self {
        *self.peers.lock() = PeerDirectory::with_max_peers(max_peers);
        self
    }

    /// The bound address while running; resolves port 0 to the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|h| h.local_addr)
    }

    /// Peers accepted since the last start.
    pub fn peers(&self) -> Vec<Arc<Node>> {
        self.peers.lock().all()
    }

    fn bind(&self) -> Result<std::net::TcpListener, DiscoveryError> {
        let bind_err = |source| DiscoveryError::Bind {
            addr: format!("{}:{}", self.host, self.port),
            source,
        };
        let listener =
            std::net::TcpListener::bind((self.host.as_str(), self.port)).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        Ok(listener)
    }
}

impl ActiveDiscovery for TcpServer {
    fn name(&self) -> &str {
        SOURCE
    }

    fn register_callback(&self, kind: EventKind, handler: DiscoveryHandler) -> HandlerId {
        self.callbacks.register(kind, handler)
    }

    fn unregister_callback(&self, kind: EventKind, id: HandlerId) -> bool {
        self.callbacks.unregister(kind, id)
    }

    fn start(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("TcpServer already running");
            return Ok(());
        }

        let listener = self.bind()?;
        let local_addr = listener.local_addr().map_err(|source| DiscoveryError::Bind {
            addr: format!("{}:{}", self.host, self.port),
            source,
        })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(DiscoveryError::Runtime)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let callbacks = self.callbacks.clone();
        let peers = self.peers.clone();

        self.callbacks.open();
        let thread = thread::Builder::new()
            .name("tcp-server".into())
            .spawn(move || {
                runtime.block_on(accept_loop(listener, shutdown_rx, callbacks, peers));
                let _ = done_tx.send(());
            })
            .map_err(DiscoveryError::Runtime)?;

        info!("TcpServer listening on {local_addr}");
        *running = Some(ServerHandle {
            local_addr,
            shutdown_tx,
            done_rx,
            thread,
        });
        Ok(())
    }

    fn stop(&self) {
        let Some(handle) = self.running.lock().take() else {
            return;
        };

        self.callbacks.close();
        let _ = handle.shutdown_tx.send(());

        match handle.done_rx.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    warn!("TcpServer accept thread panicked");
                }
                info!("TcpServer on {} stopped", handle.local_addr);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "TcpServer on {} did not stop within {:?}; detaching its thread",
                    handle.local_addr, self.shutdown_timeout
                );
            }
        }
    }

    fn is_active(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |h| !h.thread.is_finished())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    mut shutdown: oneshot::Receiver<()>,
    callbacks: Arc<CallbackRegistry>,
    peers: Arc<Mutex<PeerDirectory>>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!("TcpServer: failed to register listener: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => on_accept(stream, peer_addr, &callbacks, &peers),
                Err(e) => {
                    warn!("TcpServer: accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    let accepted = peers.lock().drain();
    for node in accepted {
        for conn in node.connections() {
            conn.disconnect().await;
        }
    }
    debug!("TcpServer accept loop finished");
}

fn on_accept(
    stream: TcpStream,
    peer_addr: SocketAddr,
    callbacks: &CallbackRegistry,
    peers: &Mutex<PeerDirectory>,
) {
    info!("TcpServer: new connection from {peer_addr}");
    // Inbound peers carry no shared identity, so each gets a fresh one.
    let node = Arc::new(Node::with_connection(
        NodeId::random(),
        Arc::new(TcpConnection::inbound(stream, peer_addr)),
    ));
    if let Some(evicted) = peers.lock().insert(node.clone()) {
        debug!("TcpServer: peer directory full, forgot {}", evicted.id());
    }
    callbacks.fire(EventKind::Discover, SOURCE, node);
}
