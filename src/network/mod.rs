//! Network Module
//!
//! Moving messages between nodes.
//!
//! ## Architecture
//! - `Transport`: request/reply to one node, with bounded retries
//! - `TcpTransport`: cached TCP connections for real deployments
//! - `LocalNetwork`: in-process delivery with partition simulation
//! - `Server`: accept loop, one thread per connection, dispatching every
//!   frame to a `MessageHandler`

mod connection;
mod local;
mod retry;
mod server;
mod tcp;
mod transport;

pub use connection::Connection;
pub use local::{LocalNetwork, LocalTransport};
pub use server::Server;
pub use tcp::TcpTransport;
pub use transport::{fan_out, MessageHandler, Transport};
