//! # local
//!
//! why: run whole clusters inside one process for tests and demos
//! relations: implements transport.rs by calling straight into node.rs handlers
//! what: LocalNetwork registry with partition controls, LocalTransport

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_core::{AppendEntriesArgs, AppendEntriesReply, RaftError, RequestVoteArgs, RequestVoteReply, Result};

use crate::node::Node;
use crate::transport::Transport;

#[derive(Default)]
struct Registry {
    nodes: HashMap<u64, Node>,
    disconnected: HashSet<u64>,
}

/// In-process network connecting registered nodes.
///
/// A disconnected node can neither send nor receive; calls across the cut
/// fail with [`RaftError::Transport`], and so does a reply whose path was
/// cut while the call was in flight.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the node `from`. It holds the network weakly, so nodes
    /// registered here do not keep it alive.
    pub fn transport(&self, from: u64) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from,
            registry: Arc::downgrade(&self.registry),
        })
    }

    pub fn register(&self, node: Node) {
        self.registry.write().nodes.insert(node.id(), node);
    }

    /// Take `id` off the network, calls to it fail until it is registered again
    pub fn unregister(&self, id: u64) -> Option<Node> {
        self.registry.write().nodes.remove(&id)
    }

    pub fn node(&self, id: u64) -> Option<Node> {
        self.registry.read().nodes.get(&id).cloned()
    }

    /// Cut `id` off from every other node, in both directions
    pub fn disconnect(&self, id: u64) {
        tracing::debug!(node_id = id, "disconnecting node");
        self.registry.write().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: u64) {
        tracing::debug!(node_id = id, "reconnecting node");
        self.registry.write().disconnected.remove(&id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        !self.registry.read().disconnected.contains(&id)
    }
}

struct LocalTransport {
    from: u64,
    registry: Weak<RwLock<Registry>>,
}

impl LocalTransport {
    fn unreachable(&self, peer: u64, reason: &str) -> RaftError {
        RaftError::Transport {
            peer,
            reason: format!("{} -> {peer}: {reason}", self.from),
        }
    }

    fn route(&self, peer: u64) -> Result<Node> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| self.unreachable(peer, "network dropped"))?;
        let registry = registry.read();
        if registry.disconnected.contains(&self.from) || registry.disconnected.contains(&peer) {
            return Err(self.unreachable(peer, "disconnected"));
        }
        registry
            .nodes
            .get(&peer)
            .cloned()
            .ok_or_else(|| self.unreachable(peer, "unknown node"))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, peer: u64, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let node = self.route(peer)?;
        tokio::task::yield_now().await;
        let reply = node.handle_request_vote(args)?;
        // the reply travels back over the same link
        self.route(peer)?;
        Ok(reply)
    }

    async fn append_entries(&self, peer: u64, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        let node = self.route(peer)?;
        tokio::task::yield_now().await;
        let reply = node.handle_append_entries(args)?;
        self.route(peer)?;
        Ok(reply)
    }
}
