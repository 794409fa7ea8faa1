//! TCP transport
//!
//! One request/reply exchange per frame pair over cached connections. A
//! connection that fails is dropped and re-established on the next attempt.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::cluster::NodeId;
use crate::config::{Config, RetryPolicy};
use crate::error::{HarborError, Result};
use crate::protocol::{read_message, write_message, Message};

use super::Transport;

pub struct TcpTransport {
    peers: HashMap<NodeId, String>,
    /// Idle connections; a sender takes one out and returns it on success
    connections: Mutex<HashMap<NodeId, TcpStream>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl TcpTransport {
    pub fn new(
        peers: impl IntoIterator<Item = (NodeId, String)>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            connections: Mutex::new(HashMap::new()),
            timeout,
            retry,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .cluster
                .peers
                .iter()
                .map(|peer| (peer.id, peer.addr.clone())),
            config.timing.rpc_timeout,
            config.retry,
        )
    }

    fn connect(&self, node: NodeId) -> Result<TcpStream> {
        let addr = self
            .peers
            .get(&node)
            .ok_or_else(|| HarborError::Config(format!("no address for node {}", node)))?;
        let socket = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| HarborError::Config(format!("cannot resolve {}", addr)))?;

        let stream = TcpStream::connect_timeout(&socket, self.timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        trace!(node, %addr, "connected");
        Ok(stream)
    }

    fn attempt(&self, node: NodeId, message: &Message) -> Result<Message> {
        let cached = self.connections.lock().remove(&node);
        let mut stream = match cached {
            Some(stream) => stream,
            None => self.connect(node)?,
        };

        let exchange = write_message(&mut stream, message).and_then(|_| read_message(&mut stream));
        match exchange {
            Ok(reply) => {
                self.connections.lock().insert(node, stream);
                Ok(reply)
            }
            Err(HarborError::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(HarborError::Timeout { node })
            }
            Err(e) => Err(e),
        }
    }

    /// Drop every cached connection
    pub fn disconnect_all(&self) {
        self.connections.lock().clear();
    }
}

impl Transport for TcpTransport {
    fn send(&self, node: NodeId, message: &Message) -> Result<Message> {
        self.retry.run(node, |_| self.attempt(node, message))
    }
}
