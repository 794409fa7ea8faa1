//! Cluster Module
//!
//! Replication controllers and the state they share.
//!
//! ## Architecture
//! ```text
//!             ┌───────────────────────┐
//!  client ───▶│  Primary / Masterless │───▶ Transport ───▶ peers
//!             │      controller       │◀─── Server  ◀──── peers
//!             └──────────┬────────────┘
//!                        ▼
//!                     Engine (WAL + map + feed)
//! ```
//! - `PrimaryController`: elected leader ships its log to followers
//! - `MasterlessController`: any node writes, quorum reads, anti-entropy
//! - `Node`: wires config, engine, transport, controller and server

mod hard_state;
mod masterless;
mod membership;
mod node;
mod primary;
mod version;

use crate::error::HarborError;
use crate::protocol::Response;

pub use hard_state::{HardState, HardStateStore, HARD_STATE_FILE};
pub use masterless::{AntiEntropyReport, MasterlessController};
pub use membership::{ClusterMembership, Member, MemberRole, MembershipCell};
pub use node::{Node, StandaloneHandler};
pub use primary::{NodeStatus, PrimaryController, Role};
pub use version::{lww_winner, maximal, Causality, Version, VersionVector, Versioned};

/// Identifier of a cluster node
pub type NodeId = u64;

/// Map a controller outcome onto a client response
pub(crate) fn respond<T, F>(result: Result<T, HarborError>, payload: F) -> Response
where
    F: FnOnce(T) -> Option<Vec<u8>>,
{
    Response::from_result(result.map(payload))
}
