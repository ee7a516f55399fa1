//! Pluggable discovery: the [`ActiveDiscovery`] capability and the callback
//! registry its implementations share.
//!
//! Back-ends: `ZeroconfService` (mDNS announce + browse), `TcpServer`
//! (passive accept), `TcpDiscovery` (both).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::DiscoveryError;
use crate::node::Node;

/// Lifecycle events a discovery back-end can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Discover,
    Update,
    Remove,
    Connect,
    Disconnect,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover => write!(f, "OnDiscover"),
            Self::Update => write!(f, "OnUpdate"),
            Self::Remove => write!(f, "OnRemove"),
            Self::Connect => write!(f, "OnConnect"),
            Self::Disconnect => write!(f, "OnDisconnect"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub kind: EventKind,
    /// Name of the back-end that raised the event.
    pub source: String,
    pub node: Arc<Node>,
}

/// Handlers run on the back-end's own thread and must not block, nor stop
/// the discovery that invoked them.
pub type DiscoveryHandler = Arc<dyn Fn(&DiscoveryEvent) + Send + Sync>;

/// Token returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A mechanism that finds or accepts peers and reports them as events.
///
/// Handlers registered before `start()` see every event raised after it;
/// none fire once `stop()` has returned. `stop()` is safe on a discovery
/// that never started.
pub trait ActiveDiscovery: Send + Sync {
    fn name(&self) -> &str;

    fn register_callback(&self, kind: EventKind, handler: DiscoveryHandler) -> HandlerId;

    /// Returns false if `id` was not registered for `kind`.
    fn unregister_callback(&self, kind: EventKind, id: HandlerId) -> bool;

    /// Begin background work. Returns after setup; a no-op when running.
    fn start(&self) -> Result<(), DiscoveryError>;

    /// Halt background work and release its resources.
    fn stop(&self);

    fn is_active(&self) -> bool;
}

/// Multimap from event kind to handlers, plus the gate that keeps events
/// from firing after a stop.
pub struct CallbackRegistry {
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, DiscoveryHandler)>>>,
    open: RwLock<bool>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            open: RwLock::new(true),
        }
    }

    pub fn register(&self, kind: EventKind, handler: DiscoveryHandler) -> HandlerId {
        let id = HandlerId::next();
        self.handlers.lock().entry(kind).or_default().push((id, handler));
        id
    }

    pub fn unregister(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        before != list.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn open(&self) {
        *self.open.write() = true;
    }

    /// Waits for any dispatch in progress, then refuses further dispatch.
    pub fn close(&self) {
        *self.open.write() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Invoke every handler registered for `kind`. Returns how many ran.
    pub fn fire(&self, kind: EventKind, source: &str, node: Arc<Node>) -> usize {
        let open = self.open.read_recursive();
        if !*open {
            return 0;
        }
        let handlers: Vec<DiscoveryHandler> = self
            .handlers
            .lock()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        let event = DiscoveryEvent {
            kind,
            source: source.to_string(),
            node,
        };
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
