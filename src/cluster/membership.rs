//! Cluster membership
//!
//! Who is in the cluster, at which address, in which role, and (in
//! primary-secondary mode) which term and leader are current. Readers take
//! an `Arc` snapshot; writers copy, modify and swap, bumping the version.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{ClusterConfig, Topology};

use super::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Primary,
    Secondary,
    /// Masterless member, or any node in standalone mode
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// `None` for the local node
    pub addr: Option<String>,
    pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMembership {
    /// Bumped on every change
    pub version: u64,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub members: BTreeMap<NodeId, Member>,
}

impl ClusterMembership {
    pub fn from_config(cluster: &ClusterConfig) -> Self {
        let role = match cluster.topology {
            Topology::PrimarySecondary { .. } => MemberRole::Secondary,
            Topology::Standalone | Topology::Masterless { .. } => MemberRole::Peer,
        };

        let mut members = BTreeMap::new();
        members.insert(cluster.node_id, Member { addr: None, role });
        for peer in &cluster.peers {
            members.insert(
                peer.id,
                Member {
                    addr: Some(peer.addr.clone()),
                    role,
                },
            );
        }

        Self {
            version: 0,
            term: 0,
            leader: None,
            members,
        }
    }

    pub fn role_of(&self, node: NodeId) -> Option<MemberRole> {
        self.members.get(&node).map(|m| m.role)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    /// Record `leader` for `term`; every other member becomes a secondary
    pub fn set_leader(&mut self, term: u64, leader: Option<NodeId>) {
        self.term = term;
        self.leader = leader;
        for (&id, member) in self.members.iter_mut() {
            member.role = if Some(id) == leader {
                MemberRole::Primary
            } else {
                MemberRole::Secondary
            };
        }
    }
}

/// Append-and-swap holder of the current membership
#[derive(Debug)]
pub struct MembershipCell {
    current: RwLock<Arc<ClusterMembership>>,
}

impl MembershipCell {
    pub fn new(membership: ClusterMembership) -> Self {
        Self {
            current: RwLock::new(Arc::new(membership)),
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterMembership> {
        Arc::clone(&self.current.read())
    }

    /// Apply `change` to a copy and publish it if anything differs
    pub fn update<F>(&self, change: F) -> Arc<ClusterMembership>
    where
        F: FnOnce(&mut ClusterMembership),
    {
        let mut current = self.current.write();
        let mut next = ClusterMembership::clone(&current);
        change(&mut next);
        next.version = current.version;
        if next != **current {
            next.version += 1;
            *current = Arc::new(next);
        }
        Arc::clone(&current)
    }
}
