//! TCP Server
//!
//! Accepts connections and serves each one on its own thread.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;

use super::{Connection, MessageHandler};

/// How often the accept loop checks for shutdown when idle
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// TCP server for HarborKV nodes
pub struct Server {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    max_connections: usize,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listen address from `config`
    pub fn bind(config: &Config, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            handler,
            max_connections: config.max_connections,
            read_timeout_ms: config.read_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that stops the server when set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Serve until shutdown (blocking)
    pub fn run(&self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "server listening");

        while !self.shutdown.load(Ordering::Acquire) {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };

            if self.active.load(Ordering::Acquire) >= self.max_connections {
                warn!(%addr, limit = self.max_connections, "connection limit reached, refusing");
                continue;
            }
            stream.set_nonblocking(false)?;

            let mut connection =
                Connection::new(stream, Arc::clone(&self.handler), Arc::clone(&self.shutdown))?;
            connection.set_timeouts(self.read_timeout_ms, self.write_timeout_ms)?;

            let active = Arc::clone(&self.active);
            active.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("conn-{}", addr))
                .spawn(move || {
                    if let Err(e) = connection.handle() {
                        debug!("connection {} closed with error: {}", connection.peer_addr(), e);
                    }
                    active.fetch_sub(1, Ordering::AcqRel);
                });
            if let Err(e) = spawned {
                warn!("failed to spawn connection thread: {}", e);
                self.active.fetch_sub(1, Ordering::AcqRel);
            }
        }

        info!("server stopped");
        Ok(())
    }

    /// Number of open connections
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}
