//! In-process transport
//!
//! Nodes living in one process talk through a shared `LocalNetwork`.
//! Isolating a node makes every message to or from it fail as if the
//! network were down, which is how tests simulate crashes and partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::cluster::NodeId;
use crate::config::RetryPolicy;
use crate::error::{HarborError, Result};
use crate::protocol::Message;

use super::{MessageHandler, Transport};

#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<NodeId, Weak<dyn MessageHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route messages for `node` to `handler`
    pub fn register(&self, node: NodeId, handler: Weak<dyn MessageHandler>) {
        self.handlers.write().insert(node, handler);
    }

    pub fn unregister(&self, node: NodeId) {
        self.handlers.write().remove(&node);
    }

    /// Cut `node` off from everyone
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.isolated.write().remove(&node);
    }

    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.isolated.read().contains(&node)
    }

    /// Transport used by `node` to reach the others
    pub fn transport(self: &Arc<Self>, node: NodeId, retry: RetryPolicy) -> LocalTransport {
        LocalTransport {
            node,
            network: Arc::clone(self),
            retry,
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: &Message) -> Result<Message> {
        if self.is_isolated(from) || self.is_isolated(to) {
            return Err(HarborError::Network(format!(
                "no route from node {} to node {}",
                from, to
            )));
        }
        let handler = self
            .handlers
            .read()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| HarborError::Network(format!("node {} is not running", to)))?;
        Ok(handler.handle(message.clone()))
    }
}

pub struct LocalTransport {
    node: NodeId,
    network: Arc<LocalNetwork>,
    retry: RetryPolicy,
}

impl Transport for LocalTransport {
    fn send(&self, node: NodeId, message: &Message) -> Result<Message> {
        self.retry
            .run(node, |_| self.network.deliver(self.node, node, message))
    }
}
