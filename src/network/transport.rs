//! Transport abstraction
//!
//! A transport delivers one request to one node and returns its reply,
//! retrying transient failures. It only reports reachability; deciding what
//! an unreachable node means is up to the controllers.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver};

use crate::cluster::NodeId;
use crate::error::{HarborError, Result};
use crate::protocol::Message;

/// Something that answers inter-node requests
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message) -> Message;
}

pub trait Transport: Send + Sync {
    /// Deliver `message` to `node` and wait for the reply
    fn send(&self, node: NodeId, message: &Message) -> Result<Message>;

    /// Send to every node in parallel and wait for all of them
    fn broadcast(&self, nodes: &[NodeId], message: &Message) -> Vec<(NodeId, Result<Message>)> {
        thread::scope(|scope| {
            let pending: Vec<_> = nodes
                .iter()
                .map(|&node| (node, scope.spawn(move || self.send(node, message))))
                .collect();

            pending
                .into_iter()
                .map(|(node, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(HarborError::Network(format!("send to node {} panicked", node)))
                    });
                    (node, result)
                })
                .collect()
        })
    }
}

/// Send to every node in parallel; replies arrive on the channel as they come
///
/// Lets a caller stop waiting once it has enough answers.
pub fn fan_out(
    transport: &Arc<dyn Transport>,
    nodes: &[NodeId],
    message: Message,
) -> Receiver<(NodeId, Result<Message>)> {
    let (tx, rx) = unbounded();
    let message = Arc::new(message);
    for &node in nodes {
        let transport = Arc::clone(transport);
        let message = Arc::clone(&message);
        let reply_tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("send-{}", node))
            .spawn(move || {
                let _ = reply_tx.send((node, transport.send(node, &message)));
            });
        if let Err(e) = spawned {
            let _ = tx.send((node, Err(HarborError::Io(e))));
        }
    }
    rx
}
