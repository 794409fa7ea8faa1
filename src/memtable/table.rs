//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::cluster::Version;

use super::KeyEntry;

/// In-memory table of every known key, tombstones included
pub struct MemTable {
    data: RwLock<BTreeMap<Vec<u8>, KeyEntry>>,
    /// Approximate size in bytes
    size: AtomicUsize,
    live: AtomicUsize,
    tombstones: AtomicUsize,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
        }
    }

    /// Full entry for a key, tombstones included
    pub fn get(&self, key: &[u8]) -> Option<KeyEntry> {
        self.data.read().get(key).cloned()
    }

    /// Live value for a key
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).and_then(|entry| entry.value.clone())
    }

    pub fn version(&self, key: &[u8]) -> Option<Version> {
        self.data.read().get(key).map(|entry| entry.version.clone())
    }

    /// Insert or replace the state of a key, returning the previous state
    pub fn apply(&self, key: Vec<u8>, entry: KeyEntry) -> Option<KeyEntry> {
        let mut data = self.data.write();
        self.insert_locked(&mut data, key, entry)
    }

    /// Apply several entries under a single write lock
    ///
    /// Readers observe either none or all of them.
    pub fn apply_batch(&self, entries: Vec<(Vec<u8>, KeyEntry)>) {
        let mut data = self.data.write();
        for (key, entry) in entries {
            self.insert_locked(&mut data, key, entry);
        }
    }

    fn insert_locked(
        &self,
        data: &mut BTreeMap<Vec<u8>, KeyEntry>,
        key: Vec<u8>,
        entry: KeyEntry,
    ) -> Option<KeyEntry> {
        self.account(&key, &entry, 1);
        let previous = data.insert(key.clone(), entry);
        if let Some(old) = &previous {
            self.account(&key, old, -1);
        }
        previous
    }

    fn account(&self, key: &[u8], entry: &KeyEntry, sign: isize) {
        let counter = if entry.is_tombstone() {
            &self.tombstones
        } else {
            &self.live
        };
        if sign > 0 {
            counter.fetch_add(1, Ordering::Relaxed);
            self.size.fetch_add(entry.size_hint(key), Ordering::Relaxed);
        } else {
            counter.fetch_sub(1, Ordering::Relaxed);
            self.size.fetch_sub(entry.size_hint(key), Ordering::Relaxed);
        }
    }

    /// Live keys in `[start, end)`, in key order
    pub fn live_keys_in(&self, range: Range<Vec<u8>>) -> Vec<Vec<u8>> {
        if range.start >= range.end {
            return Vec::new();
        }
        self.data
            .read()
            .range(range)
            .filter(|(_, entry)| !entry.is_tombstone())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Copy of every entry in key order
    pub fn entries(&self, include_tombstones: bool) -> Vec<(Vec<u8>, KeyEntry)> {
        self.data
            .read()
            .iter()
            .filter(|(_, entry)| include_tombstones || !entry.is_tombstone())
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Key → version for every entry, tombstones included
    pub fn digest(&self) -> Vec<(Vec<u8>, Version)> {
        self.data
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.version.clone()))
            .collect()
    }

    /// Replace the whole content (recovery and truncation rebuilds)
    pub fn replace_all(&self, entries: Vec<(Vec<u8>, KeyEntry)>) {
        let mut data = self.data.write();
        data.clear();
        self.size.store(0, Ordering::Relaxed);
        self.live.store(0, Ordering::Relaxed);
        self.tombstones.store(0, Ordering::Relaxed);
        for (key, entry) in entries {
            self.insert_locked(&mut data, key, entry);
        }
    }

    /// Drop tombstones written at or below `seq`
    pub fn purge_tombstones(&self, seq: u64) -> usize {
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data
            .iter()
            .filter(|(_, entry)| entry.is_tombstone() && entry.seq <= seq)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(entry) = data.remove(key) {
                self.account(key, &entry, -1);
            }
        }
        doomed.len()
    }

    /// Get approximate size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.load(Ordering::Relaxed)
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.replace_all(Vec::new());
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
