//! Connection abstraction for a bidirectional byte stream to one peer.
//!
//! Phase 1: TCP (see `tcp_connection`).
//! Further protocols plug in by implementing [`Connection`].

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::ConnectionError;

/// Protocol identifier reported by TCP connections.
pub const TCP: &str = "TCP";

/// Which side opened the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// This side dialed the peer.
    ClientToServer,
    /// This side accepted the peer's dial.
    ServerToClient,
}

impl Direction {
    /// Only the dialing side may (re)connect.
    pub fn can_initiate(self) -> bool {
        matches!(self, Self::ClientToServer)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToServer => write!(f, "ClientToServer"),
            Self::ServerToClient => write!(f, "ServerToClient"),
        }
    }
}

/// Value identity of a connection. Used for dedup and lookup only,
/// never to infer liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub protocol: &'static str,
    pub addr: SocketAddr,
    pub direction: Direction,
}

/// A bidirectional byte-stream endpoint to a peer.
///
/// Transport failures never escape as errors: they flip the connection to
/// disconnected and surface as `false` / `None`. Only `connect` returns a
/// typed error, so a policy violation stays distinguishable from a refused
/// dial.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn key(&self) -> ConnectionKey;

    fn protocol(&self) -> &'static str {
        self.key().protocol
    }

    /// Cached state, no I/O.
    fn is_connected(&self) -> bool;

    /// Probe the channel. Returns false without probing when not connected;
    /// a failed probe also marks the connection disconnected.
    async fn is_alive(&self) -> bool;

    /// Open the transport. A no-op when already connected. Safe to retry.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Close the channel. Idempotent and always returns true.
    async fn disconnect(&self) -> bool;

    async fn write(&self, data: &[u8]) -> bool;

    /// Next chunk from the peer, or `None` when disconnected or at end of stream.
    async fn read(&self) -> Option<Vec<u8>>;
}

impl PartialEq for dyn Connection {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for dyn Connection {}

/// Mock connection for testing: scripted reachability, queued inbound data,
/// recorded writes and probe counts.
#[derive(Debug)]
pub struct MockConnection {
    key: ConnectionKey,
    connected: AtomicBool,
    reachable: AtomicBool,
    probes: AtomicUsize,
    connect_attempts: AtomicUsize,
    disconnects: AtomicUsize,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockConnection {
    pub fn new(protocol: &'static str, addr: SocketAddr, direction: Direction) -> Self {
        Self {
            key: ConnectionKey {
                protocol,
                addr,
                direction,
            },
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A mock that starts out connected, like an accepted socket.
    pub fn connected(protocol: &'static str, addr: SocketAddr, direction: Direction) -> Self {
        let conn = Self::new(protocol, addr, direction);
        conn.connected.store(true, Ordering::SeqCst);
        conn
    }

    /// When false, dials are refused and probes/writes fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn push_incoming(&self, data: impl Into<Vec<u8>>) {
        self.inbox.lock().push_back(data.into());
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    fn key(&self) -> ConnectionKey {
        self.key
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_alive(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            true
        } else {
            self.connected.store(false, Ordering::SeqCst);
            false
        }
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        if !self.key.direction.can_initiate() {
            return Err(ConnectionError::NotInitiator {
                addr: self.key.addr,
            });
        }
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "mock refused").into())
        }
    }

    async fn disconnect(&self) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        true
    }

    async fn write(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        self.sent.lock().push(data.to_vec());
        true
    }

    async fn read(&self) -> Option<Vec<u8>> {
        if !self.is_connected() {
            return None;
        }
        self.inbox.lock().pop_front()
    }
}
