//! MemTable Module
//!
//! In-memory key index rebuilt from the checkpoint and the WAL.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Single-writer/multi-reader access pattern
//! - Keep tombstones (and versions) so deletes replicate
//! - Ordered iteration for checkpoints, range deletes and digests
//!
//! ## Data Structure Choice
//! A BTreeMap wrapped in a parking_lot RwLock:
//! - Ordered keys for range operations and deterministic checkpoints
//! - Readers never block each other

mod table;

use serde::{Deserialize, Serialize};

use crate::cluster::Version;

pub use table::MemTable;

/// State of one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// `None` marks a tombstone
    pub value: Option<Vec<u8>>,
    pub version: Version,
    /// WAL sequence number of the write that produced this state
    pub seq: u64,
}

impl KeyEntry {
    pub fn live(value: Vec<u8>, version: Version, seq: u64) -> Self {
        Self {
            value: Some(value),
            version,
            seq,
        }
    }

    pub fn tombstone(version: Version, seq: u64) -> Self {
        Self {
            value: None,
            version,
            seq,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate heap footprint
    pub(crate) fn size_hint(&self, key: &[u8]) -> usize {
        key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}
