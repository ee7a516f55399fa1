//! Peer directory: the nodes a discovery back-end found itself, capped at
//! max_peers (default 30). Lets removal events resolve back to a Node.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::node::{Node, NodeId};

pub const DEFAULT_MAX_PEERS: usize = 30;

pub struct PeerDirectory {
    nodes: VecDeque<Arc<Node>>,
    max_peers: usize,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::with_max_peers(DEFAULT_MAX_PEERS)
    }

    pub fn with_max_peers(max_peers: usize) -> Self {
        Self {
            nodes: VecDeque::new(),
            max_peers: max_peers.max(1),
        }
    }

    /// Append a node, evicting the oldest entry when full. Returns the evicted node.
    pub fn insert(&mut self, node: Arc<Node>) -> Option<Arc<Node>> {
        let evicted = if self.nodes.len() >= self.max_peers {
            self.nodes.pop_front()
        } else {
            None
        };
        self.nodes.push_back(node);
        evicted
    }

    // Linear scan; the directory is small.
    pub fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.id() == *id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id() == *id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Arc<Node>> {
        let pos = self.nodes.iter().position(|n| n.id() == *id)?;
        self.nodes.remove(pos)
    }

    pub fn drain(&mut self) -> Vec<Arc<Node>> {
        self.nodes.drain(..).collect()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}
