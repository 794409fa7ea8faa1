//! Per-key versions
//!
//! A `VersionVector` tracks, per node, how many writes to a key that node
//! has originated. Comparing two vectors tells whether one write causally
//! follows the other or whether they are concurrent. Concurrent versions are
//! ordered by last-writer-wins on `(timestamp, origin)`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Causal relation of one version to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// Self happened before the other
    Before,
    /// Self happened after the other
    After,
    Concurrent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<NodeId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NodeId) -> u64 {
        self.0.get(&node).copied().unwrap_or(0)
    }

    /// Bump the counter of `node`, returning the new value
    pub fn increment(&mut self, node: NodeId) -> u64 {
        let counter = self.0.entry(node).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VersionVector) {
        for (&node, &counter) in &other.0 {
            let entry = self.0.entry(node).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    pub fn merged(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut greater = false;
        let mut less = false;

        for node in self.0.keys().chain(other.0.keys()) {
            match self.get(*node).cmp(&other.get(*node)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return Causality::Concurrent;
            }
        }

        match (greater, less) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (true, true) => Causality::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.0.iter().map(|(&node, &counter)| (node, counter))
    }
}

impl FromIterator<(NodeId, u64)> for VersionVector {
    fn from_iter<T: IntoIterator<Item = (NodeId, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Version metadata attached to every key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Writes applied to this key on the local node
    pub counter: u64,
    /// Empty outside masterless mode
    pub vector: VersionVector,
    /// Hybrid-clock timestamp of the write
    pub timestamp: u64,
    /// Node that originated the write
    pub origin: NodeId,
}

impl Version {
    /// Last-writer-wins order: timestamp first, then the higher node id
    pub fn lww_cmp(&self, other: &Version) -> Ordering {
        (self.timestamp, self.origin).cmp(&(other.timestamp, other.origin))
    }

    /// Causal relation, falling back to LWW when neither side has a vector
    pub fn causality(&self, other: &Version) -> Causality {
        if self.vector.is_empty() && other.vector.is_empty() {
            return match self.lww_cmp(other) {
                Ordering::Greater => Causality::After,
                Ordering::Less => Causality::Before,
                Ordering::Equal => Causality::Equal,
            };
        }
        self.vector.compare(&other.vector)
    }

    /// Whether this version should replace `other`
    pub fn supersedes(&self, other: &Version) -> bool {
        match self.causality(other) {
            Causality::After => true,
            Causality::Concurrent => self.lww_cmp(other) == Ordering::Greater,
            Causality::Before | Causality::Equal => false,
        }
    }
}

/// A key with its value (or tombstone) and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub key: Vec<u8>,
    /// `None` is a tombstone
    pub value: Option<Vec<u8>>,
    pub version: Version,
}

impl Versioned {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Keep only the versions no other version dominates
///
/// Duplicates (equal vectors) collapse to the LWW winner among them.
pub fn maximal(versions: Vec<Versioned>) -> Vec<Versioned> {
    let mut out: Vec<Versioned> = Vec::new();
    'candidates: for candidate in versions {
        let mut i = 0;
        while i < out.len() {
            match candidate.version.causality(&out[i].version) {
                Causality::Before => continue 'candidates,
                Causality::Equal => {
                    if candidate.version.lww_cmp(&out[i].version) == Ordering::Greater {
                        out[i] = candidate;
                    }
                    continue 'candidates;
                }
                Causality::After => {
                    out.swap_remove(i);
                }
                Causality::Concurrent => i += 1,
            }
        }
        out.push(candidate);
    }
    out
}

/// Pick the LWW winner among concurrent siblings
pub fn lww_winner(siblings: &[Versioned]) -> Option<&Versioned> {
    siblings.iter().max_by(|a, b| a.version.lww_cmp(&b.version))
}
