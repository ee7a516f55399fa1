//! TCP connection: raw byte stream, no framing.
//!
//! Outbound connections start disconnected and dial lazily on `connect()`.
//! Accepted connections arrive with a live stream and may never re-dial.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionKey, Direction, TCP};
use crate::error::ConnectionError;

const READ_CHUNK: usize = 1024;

/// A [`Connection`] over a TCP stream socket.
///
/// The stream is split so a pending `read` never blocks a `write`. Any
/// transition to disconnected cancels a pending `read`.
#[derive(Debug)]
pub struct TcpConnection {
    addr: SocketAddr,
    direction: Direction,
    connected: AtomicBool,
    closed: Notify,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpConnection {
    /// A disconnected connection this side will dial.
    pub fn outbound(addr: SocketAddr) -> Self {
        Self {
            addr,
            direction: Direction::ClientToServer,
            connected: AtomicBool::new(false),
            closed: Notify::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Wrap a stream returned by `accept()`.
    pub fn inbound(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self::from_stream(stream, peer_addr, Direction::ServerToClient)
    }

    /// Wrap an already-open stream.
    pub fn from_stream(stream: TcpStream, addr: SocketAddr, direction: Direction) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            addr,
            direction,
            connected: AtomicBool::new(true),
            closed: Notify::new(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.notify_waiters();
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    fn key(&self) -> ConnectionKey {
        ConnectionKey {
            protocol: TCP,
            addr: self.addr,
            direction: self.direction,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_alive(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            self.mark_closed();
            return false;
        };
        // Zero-byte write: surfaces a broken socket without touching the stream.
        let probe = async {
            writer.write(&[]).await?;
            writer.flush().await
        };
        match probe.await {
            Ok(()) => true,
            Err(e) => {
                debug!("liveness probe to {} failed: {e}", self.addr);
                self.mark_closed();
                false
            }
        }
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        if !self.direction.can_initiate() {
            warn!("refusing to dial {}: connection was accepted", self.addr);
            return Err(ConnectionError::NotInitiator { addr: self.addr });
        }

        let mut writer = self.writer.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        match TcpStream::connect(self.addr).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *writer = Some(write_half);
                *self.reader.lock().await = Some(read_half);
                self.connected.store(true, Ordering::SeqCst);
                info!("connected to {}", self.addr);
                Ok(())
            }
            Err(e) => {
                warn!("failed to connect to {}: {e}", self.addr);
                self.mark_closed();
                Err(e.into())
            }
        }
    }

    async fn disconnect(&self) -> bool {
        self.mark_closed();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown of {} failed: {e}", self.addr);
            }
        }
        // mark_closed woke any pending read, so the reader lock frees up.
        self.reader.lock().await.take();
        debug!("disconnected from {}", self.addr);
        true
    }

    async fn write(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        let sent = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match sent.await {
            Ok(()) => {
                debug!("sent {} bytes to {}", data.len(), self.addr);
                true
            }
            Err(e) => {
                warn!("write to {} failed: {e}", self.addr);
                self.mark_closed();
                false
            }
        }
    }

    async fn read(&self) -> Option<Vec<u8>> {
        // Register before checking the flag so a concurrent close is not missed.
        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if !self.is_connected() {
            return None;
        }

        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = &mut closed => return None,
        };
        let reader = guard.as_mut()?;
        let mut buf = vec![0u8; READ_CHUNK];
        let result = tokio::select! {
            result = reader.read(&mut buf) => result,
            _ = &mut closed => {
                debug!("pending read from {} cancelled: connection closed", self.addr);
                return None;
            }
        };
        match result {
            Ok(0) => {
                debug!("{} closed the stream", self.addr);
                self.mark_closed();
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(e) => {
                warn!("read from {} failed: {e}", self.addr);
                self.mark_closed();
                None
            }
        }
    }
}

impl PartialEq for TcpConnection {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TcpConnection {}

impl std::hash::Hash for TcpConnection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
