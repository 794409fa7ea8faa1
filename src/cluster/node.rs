//! Node assembly
//!
//! Turns a `Config` into a running node: engine, transport, the controller
//! for the configured topology, the TCP server and the checkpointer.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, Topology};
use crate::engine::{Checkpointer, Engine};
use crate::error::Result;
use crate::network::{MessageHandler, Server, TcpTransport, Transport};
use crate::protocol::{Command, Message, Response};

use super::{respond, MasterlessController, PrimaryController};

/// Serves client commands straight from the engine, with no replication
pub struct StandaloneHandler {
    engine: Arc<Engine>,
}

impl StandaloneHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn execute(&self, command: Command) -> Response {
        let engine = &self.engine;
        match command {
            Command::Get { key } => respond(engine.get(&key), Some),
            Command::Set { key, value } => respond(engine.set(&key, &value), |_| None),
            Command::Delete { key } => respond(engine.delete(&key), |_| None),
            Command::BulkSet { pairs } => respond(engine.bulk_set(pairs), |_| None),
            Command::DeleteRange { start, end } => respond(engine.delete_range(&start, &end), |n| {
                Some(n.to_string().into_bytes())
            }),
            Command::Ping => Response::ok(Some(b"PONG".to_vec())),
            Command::Status => {
                let stats = engine.stats();
                let status = format!(
                    "node={} mode=standalone keys={} last_seq={} checkpoint_seq={}",
                    engine.node_id(),
                    stats.key_count,
                    stats.last_seq,
                    stats.checkpoint_seq
                );
                Response::ok(Some(status.into_bytes()))
            }
        }
    }
}

impl MessageHandler for StandaloneHandler {
    fn handle(&self, message: Message) -> Message {
        match message {
            Message::Client(command) => Message::ClientReply(self.execute(command)),
            other => Message::error(format!("{:?} is not served by a standalone node", other.kind())),
        }
    }
}

enum Controller {
    Standalone(Arc<StandaloneHandler>),
    Primary(Arc<PrimaryController>),
    Masterless(Arc<MasterlessController>),
}

impl Controller {
    fn handler(&self) -> Arc<dyn MessageHandler> {
        match self {
            Controller::Standalone(c) => c.clone(),
            Controller::Primary(c) => c.clone(),
            Controller::Masterless(c) => c.clone(),
        }
    }
}

/// A running node
pub struct Node {
    engine: Arc<Engine>,
    controller: Controller,
    server: Server,
    checkpointer: Option<Checkpointer>,
}

impl Node {
    /// Open storage, bind the listen address and start the background threads
    ///
    /// Peers are reached over TCP at the addresses in the config.
    pub fn start(config: Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::from_config(&config));
        Self::with_transport(config, transport)
    }

    /// Like `start`, with a caller-provided transport
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let topology = config.cluster.topology;
        let checkpoint_interval = config.checkpoint_interval;
        let engine = Arc::new(Engine::open(config.clone())?);

        let controller = match topology {
            Topology::Standalone => {
                Controller::Standalone(Arc::new(StandaloneHandler::new(Arc::clone(&engine))))
            }
            Topology::PrimarySecondary { .. } => {
                Controller::Primary(PrimaryController::new(Arc::clone(&engine), transport)?)
            }
            Topology::Masterless { .. } => {
                Controller::Masterless(MasterlessController::new(Arc::clone(&engine), transport)?)
            }
        };

        let server = Server::bind(&config, controller.handler())?;

        match &controller {
            Controller::Standalone(_) => {}
            Controller::Primary(c) => c.start()?,
            Controller::Masterless(c) => c.start()?,
        }
        let checkpointer = checkpoint_interval.map(|interval| engine.spawn_checkpointer(interval));

        info!(
            node = config.cluster.node_id,
            addr = ?server.local_addr().ok(),
            topology = ?topology,
            "node started"
        );

        Ok(Self {
            engine,
            controller,
            server,
            checkpointer,
        })
    }

    /// Serve connections until `shutdown` is called (blocking)
    pub fn run(&self) -> Result<()> {
        self.server.run()
    }

    /// Run a client command against this node
    pub fn execute(&self, command: Command) -> Response {
        match &self.controller {
            Controller::Standalone(c) => c.execute(command),
            Controller::Primary(c) => c.execute(command),
            Controller::Masterless(c) => c.execute(command),
        }
    }

    /// Stop accepting connections and stop the background threads
    pub fn shutdown(&mut self) {
        self.server.shutdown();
        match &self.controller {
            Controller::Standalone(_) => {}
            Controller::Primary(c) => c.shutdown(),
            Controller::Masterless(c) => c.shutdown(),
        }
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
        info!(node = self.engine.node_id(), "node stopped");
    }

    /// Flag that makes `run` return once set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.server.shutdown_flag()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn primary(&self) -> Option<&Arc<PrimaryController>> {
        match &self.controller {
            Controller::Primary(c) => Some(c),
            _ => None,
        }
    }

    pub fn masterless(&self) -> Option<&Arc<MasterlessController>> {
        match &self.controller {
            Controller::Masterless(c) => Some(c),
            _ => None,
        }
    }
}
