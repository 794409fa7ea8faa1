//! Engine Module
//!
//! The storage engine that coordinates the WAL, the in-memory map, the
//! checkpoint file and the change feed.
//!
//! ## Responsibilities
//! - Log every mutation before it becomes visible
//! - Apply committed records to the map, bulk blocks all-or-nothing
//! - Rebuild the map from checkpoint + WAL on startup and after truncation
//! - Accept records replicated from a leader or versioned writes from peers
//! - Periodic checkpoints and WAL segment discard

use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::HybridClock;
use crate::cluster::{Causality, NodeId, Version, VersionVector, Versioned};
use crate::config::{Config, Topology};
use crate::error::{HarborError, Result};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::memtable::{KeyEntry, MemTable};
use crate::storage::Checkpoint;
use crate::wal::{
    BlockAssembler, NewRecord, Opened, Operation, Record, RecoveryResult, Wal,
};

/// How the topology shapes local storage behaviour
#[derive(Debug, Clone, Copy)]
struct Mode {
    /// Maintain version vectors on local writes
    vectors: bool,
    /// Keep tombstones through checkpoints
    retain_tombstones: bool,
    /// Sequence numbers are assigned by a leader; no local-only records
    leader_log: bool,
}

impl Mode {
    fn from_topology(topology: &Topology) -> Self {
        match topology {
            Topology::Standalone => Self {
                vectors: false,
                retain_tombstones: false,
                leader_log: false,
            },
            Topology::PrimarySecondary { .. } => Self {
                vectors: false,
                retain_tombstones: false,
                leader_log: true,
            },
            Topology::Masterless { .. } => Self {
                vectors: true,
                retain_tombstones: true,
                leader_log: false,
            },
        }
    }
}

/// Everything guarded by the write lock
struct WriteState {
    wal: Wal,
    /// Holds a replicated bulk block until its end marker arrives
    assembler: BlockAssembler,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub key_count: usize,
    pub tombstone_count: usize,
    pub approximate_size: usize,
    pub last_seq: u64,
    pub checkpoint_seq: u64,
    pub segment_count: usize,
    pub wal_bytes: u64,
}

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (set/delete/bulk/replicated/checkpoint): serialized by the
///   `state` mutex, which owns the WAL. The map is updated while it is held,
///   and the change feed is reserved before it is released so events leave
///   in sequence order.
///
/// - **Reads** (get): never touch the write lock; the MemTable uses an
///   internal RwLock, so many readers proceed concurrently.
pub struct Engine {
    /// Engine configuration
    config: Config,

    mode: Mode,

    /// WAL and replication state (exclusive access needed)
    state: Mutex<WriteState>,

    /// Every known key, tombstones included (internal RwLock)
    memtable: MemTable,

    feed: ChangeFeed,

    clock: HybridClock,

    /// Term stamped on locally produced records
    term: AtomicU64,

    /// Highest seq known to be final; checkpoints never go past it
    commit_seq: AtomicU64,

    recovery: RecoveryResult,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Open/create data directory
    /// 2. Recover the WAL (torn tails and incomplete blocks are cut)
    /// 3. Load the checkpoint and replay records past it
    /// 4. Ready to serve requests
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let Opened {
            wal,
            checkpoint,
            recovery,
        } = Wal::open(&config.data_dir, config.segment_size_limit)?;

        let mode = Mode::from_topology(&config.cluster.topology);
        let commit_seq = if mode.leader_log {
            wal.checkpoint_seq()
        } else {
            u64::MAX
        };
        let term = wal.last_term();

        let engine = Self {
            config,
            mode,
            state: Mutex::new(WriteState {
                wal,
                assembler: BlockAssembler::new(),
            }),
            memtable: MemTable::new(),
            feed: ChangeFeed::new(),
            clock: HybridClock::new(),
            term: AtomicU64::new(term),
            commit_seq: AtomicU64::new(commit_seq),
            recovery,
        };

        {
            let mut state = engine.state.lock();
            engine.rebuild_locked(&mut state, checkpoint)?;
            info!(
                node = engine.node_id(),
                keys = engine.memtable.len(),
                last_seq = state.wal.last_seq(),
                checkpoint_seq = state.wal.checkpoint_seq(),
                "engine opened"
            );
        }

        Ok(engine)
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().data_dir(path).build();
        Self::open(config)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.memtable.get_value(key).ok_or(HarborError::KeyNotFound)
    }

    /// Full entry for a key, tombstones included
    pub fn get_entry(&self, key: &[u8]) -> Option<KeyEntry> {
        self.memtable.get(key)
    }

    /// The key's value (or tombstone) with its version
    pub fn get_versioned(&self, key: &[u8]) -> Option<Versioned> {
        self.memtable.get(key).map(|entry| Versioned {
            key: key.to_vec(),
            value: entry.value,
            version: entry.version,
        })
    }

    /// Versioned state of each requested key that exists locally
    pub fn entries_for(&self, keys: &[Vec<u8>]) -> Vec<Versioned> {
        keys.iter()
            .filter_map(|key| self.get_versioned(key))
            .collect()
    }

    /// Key → version for every key, tombstones included
    pub fn digest(&self) -> Vec<(Vec<u8>, Version)> {
        self.memtable.digest()
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Set a key; returns the record's sequence number
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let (seq, _) = self.write_one(self.state.lock(), key, Some(value))?;
        Ok(seq)
    }

    /// Delete a key
    ///
    /// Deleting a missing key writes nothing and returns `Ok(None)`.
    pub fn delete(&self, key: &[u8]) -> Result<Option<u64>> {
        let state = self.state.lock();
        if self.memtable.get_value(key).is_none() {
            return Ok(None);
        }
        let (seq, _) = self.write_one(state, key, None)?;
        Ok(Some(seq))
    }

    /// Set or tombstone a key unconditionally, returning the new version
    pub fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<Versioned> {
        let (_, versioned) = self.write_one(self.state.lock(), key, value)?;
        Ok(versioned)
    }

    /// Atomically set every pair
    ///
    /// Later pairs for the same key override earlier ones. An empty input
    /// writes nothing and returns `Ok(None)`.
    pub fn bulk_set(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Option<RangeInclusive<u64>>> {
        let items = pairs
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        let outcome = self.write_block(self.state.lock(), items)?;
        Ok(outcome.map(|(range, _)| range))
    }

    /// Atomically apply sets (`Some`) and deletes (`None`), returning versions
    pub fn bulk_write(&self, items: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> Result<Vec<Versioned>> {
        let outcome = self.write_block(self.state.lock(), items)?;
        Ok(outcome.map(|(_, written)| written).unwrap_or_default())
    }

    /// Delete every live key in `[start, end)` as one atomic block
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        Ok(self.delete_range_versioned(start, end)?.len())
    }

    /// `delete_range`, returning the tombstones written
    pub fn delete_range_versioned(&self, start: &[u8], end: &[u8]) -> Result<Vec<Versioned>> {
        let state = self.state.lock();
        let keys = self.memtable.live_keys_in(start.to_vec()..end.to_vec());
        let items = keys.into_iter().map(|key| (key, None)).collect();
        let outcome = self.write_block(state, items)?;
        Ok(outcome.map(|(_, written)| written).unwrap_or_default())
    }

    fn write_one(
        &self,
        state: MutexGuard<'_, WriteState>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(u64, Versioned)> {
        let previous = self.memtable.version(key);
        let version = self.next_version(previous.as_ref(), self.clock.now());
        let op = match value {
            Some(value) => Operation::Set {
                key: key.to_vec(),
                value: value.to_vec(),
            },
            None => Operation::Delete { key: key.to_vec() },
        };
        let record = NewRecord::new(self.term(), version.timestamp, op).with_version(version);
        self.append_and_apply(state, record)
    }

    fn write_block(
        &self,
        mut state: MutexGuard<'_, WriteState>,
        items: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    ) -> Result<Option<(RangeInclusive<u64>, Vec<Versioned>)>> {
        let latest: BTreeMap<Vec<u8>, Option<Vec<u8>>> = items.into_iter().collect();
        if latest.is_empty() {
            return Ok(None);
        }

        let term = self.term();
        let timestamp = self.clock.now();
        let ops = latest
            .into_iter()
            .map(|(key, value)| {
                let previous = self.memtable.version(&key);
                let version = self.next_version(previous.as_ref(), timestamp);
                let op = match value {
                    Some(value) => Operation::Set { key, value },
                    None => Operation::Delete { key },
                };
                NewRecord::new(term, timestamp, op).with_version(version)
            })
            .collect();

        let bulk = state.wal.append_bulk(ops)?;

        let mut entries = Vec::with_capacity(bulk.records.len());
        let mut events = Vec::with_capacity(bulk.records.len());
        let mut written = Vec::with_capacity(bulk.records.len());
        for record in bulk.records {
            if let Some((key, entry)) = self.materialize(record) {
                events.push(event_for(&key, &entry));
                written.push(versioned(&key, &entry));
                entries.push((key, entry));
            }
        }
        self.memtable.apply_batch(entries);

        let publisher = self.feed.publisher();
        drop(state);
        publisher.send(events);

        Ok(Some((bulk.range, written)))
    }

    fn append_and_apply(
        &self,
        mut state: MutexGuard<'_, WriteState>,
        record: NewRecord,
    ) -> Result<(u64, Versioned)> {
        let record = state.wal.append(record)?;
        let seq = record.seq;
        let (key, entry) = self
            .materialize(record)
            .ok_or_else(|| HarborError::WalWrite("not a data record".to_string()))?;

        let event = event_for(&key, &entry);
        let written = versioned(&key, &entry);
        self.memtable.apply(key, entry);

        let publisher = self.feed.publisher();
        drop(state);
        publisher.send(vec![event]);

        Ok((seq, written))
    }

    fn next_version(&self, previous: Option<&Version>, timestamp: u64) -> Version {
        let mut vector = previous
            .map(|version| version.vector.clone())
            .unwrap_or_default();
        if self.mode.vectors {
            vector.increment(self.node_id());
        }
        Version {
            counter: previous.map_or(0, |version| version.counter) + 1,
            vector,
            timestamp,
            origin: self.node_id(),
        }
    }

    fn materialize(&self, record: Record) -> Option<(Vec<u8>, KeyEntry)> {
        let node = self.node_id();
        materialize(record, node, |key| {
            self.memtable.version(key).map_or(0, |v| v.counter)
        })
    }

    // =========================================================================
    // Replicated writes
    // =========================================================================

    /// Append records shipped by the leader and apply the committed ones
    ///
    /// Records keep their leader-assigned seq and term. A bulk block cut
    /// across calls is held back until its end marker arrives.
    pub fn apply_replicated(&self, records: Vec<Record>) -> Result<u64> {
        let mut state = self.state.lock();
        if records.is_empty() {
            return Ok(state.wal.last_seq());
        }
        state.wal.append_replicated(&records)?;

        let mut ready = Vec::new();
        for record in records {
            self.clock.observe(record.timestamp);
            ready.extend(state.assembler.push(record));
        }

        let mut entries = Vec::with_capacity(ready.len());
        let mut events = Vec::with_capacity(ready.len());
        for record in ready {
            if let Some((key, entry)) = self.materialize(record) {
                events.push(event_for(&key, &entry));
                entries.push((key, entry));
            }
        }
        self.memtable.apply_batch(entries);

        let last_seq = state.wal.last_seq();
        let publisher = self.feed.publisher();
        drop(state);
        publisher.send(events);
        Ok(last_seq)
    }

    /// Apply a peer's version of a key if it wins against ours
    ///
    /// Returns whether anything changed. Concurrent versions merge their
    /// vectors and keep the last-writer-wins value, so both sides converge
    /// on the same state.
    pub fn apply_versioned(&self, incoming: Versioned) -> Result<bool> {
        let state = self.state.lock();
        self.clock.observe(incoming.version.timestamp);

        let current = self.memtable.get(&incoming.key);
        let counter = current.as_ref().map_or(0, |e| e.version.counter) + 1;

        let (value, version) = match current {
            None => (incoming.value, incoming.version),
            Some(current) => match incoming.version.causality(&current.version) {
                Causality::After => (incoming.value, incoming.version),
                Causality::Before | Causality::Equal => return Ok(false),
                Causality::Concurrent => {
                    let vector = current.version.vector.merged(&incoming.version.vector);
                    if incoming.version.supersedes(&current.version) {
                        (
                            incoming.value,
                            Version {
                                vector,
                                ..incoming.version
                            },
                        )
                    } else if vector == current.version.vector {
                        return Ok(false);
                    } else {
                        (
                            current.value,
                            Version {
                                vector,
                                ..current.version
                            },
                        )
                    }
                }
            },
        };

        let key = incoming.key;
        let op = match value {
            Some(value) => Operation::Set { key, value },
            None => Operation::Delete { key },
        };
        let version = Version { counter, ..version };
        let record = NewRecord::new(self.term(), version.timestamp, op).with_version(version);
        self.append_and_apply(state, record)?;
        Ok(true)
    }

    /// Drop every record above `seq` and rebuild the map
    pub fn truncate_after(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if seq >= state.wal.last_seq() {
            return Ok(());
        }
        warn!(
            from = state.wal.last_seq(),
            to = seq,
            "truncating divergent log tail"
        );
        state.wal.truncate_after(seq)?;
        let checkpoint = state.wal.load_checkpoint()?;
        self.rebuild_locked(&mut state, checkpoint)?;

        let publisher = self.feed.publisher();
        drop(state);
        publisher.send(vec![ChangeEvent::truncate(seq, self.clock.now())]);
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild the map from the checkpoint and the WAL
    ///
    /// Idempotent: running it again yields the same map.
    pub fn recover(&self) -> Result<()> {
        let mut state = self.state.lock();
        let checkpoint = state.wal.load_checkpoint()?;
        self.rebuild_locked(&mut state, checkpoint)
    }

    fn rebuild_locked(&self, state: &mut WriteState, checkpoint: Option<Checkpoint>) -> Result<()> {
        let (base_seq, mut map): (u64, BTreeMap<Vec<u8>, KeyEntry>) = match checkpoint {
            Some(checkpoint) => (
                checkpoint.through_seq,
                checkpoint.entries.into_iter().collect(),
            ),
            None => (0, BTreeMap::new()),
        };

        let node = self.node_id();
        let mut assembler = BlockAssembler::new();
        let mut replayed = 0u64;
        for record in state.wal.replay()? {
            let record = record?;
            if record.seq <= base_seq {
                continue;
            }
            self.clock.observe(record.timestamp);
            for ready in assembler.push(record) {
                let entry = materialize(ready, node, |key| {
                    map.get(key).map_or(0, |e| e.version.counter)
                });
                if let Some((key, entry)) = entry {
                    map.insert(key, entry);
                    replayed += 1;
                }
            }
        }

        if assembler.discarded() > 0 {
            warn!(
                blocks = assembler.discarded(),
                "skipped incomplete bulk blocks during replay"
            );
        }
        debug!(base_seq, replayed, "replayed WAL");

        self.memtable.replace_all(map.into_iter().collect());
        state.assembler = assembler;
        Ok(())
    }

    // =========================================================================
    // Checkpoints and compaction
    // =========================================================================

    /// Write a checkpoint of the current map
    ///
    /// Returns the seq it covers, or `None` when there is nothing new or the
    /// log tail is not final yet.
    pub fn checkpoint(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let through = state.wal.last_seq();

        let only_marker = state
            .wal
            .record(through)
            .is_some_and(|r| matches!(r.op, Operation::Checkpoint { .. }));
        if through <= state.wal.checkpoint_seq() || only_marker {
            return Ok(None);
        }
        if through > self.commit_seq.load(Ordering::Acquire) || state.assembler.has_open_block() {
            debug!(through, "log tail not committed, skipping checkpoint");
            return Ok(None);
        }

        let term = state.wal.term_at(through).unwrap_or_else(|| state.wal.last_term());
        let entries = self.memtable.entries(self.mode.retain_tombstones);
        let count = entries.len();
        state.wal.checkpoint(&Checkpoint::new(through, term, entries))?;

        if !self.mode.leader_log {
            state.wal.append(NewRecord::new(
                self.term(),
                self.clock.now(),
                Operation::Checkpoint {
                    through_seq: through,
                },
            ))?;
        }
        if !self.mode.retain_tombstones {
            self.memtable.purge_tombstones(through);
        }

        info!(through, entries = count, "checkpoint complete");
        Ok(Some(through))
    }

    /// Discard WAL segments covered by the checkpoint and by `seq`
    pub fn compact_through(&self, seq: u64) -> Result<usize> {
        self.state.lock().wal.discard_through(seq)
    }

    /// Discard segments using the local retention rule
    pub fn compact(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let limit = state
            .wal
            .checkpoint_seq()
            .saturating_sub(self.config.wal_retention_records);
        state.wal.discard_through(limit)
    }

    /// Run `checkpoint` on a timer thread until the handle is stopped
    ///
    /// Outside primary-secondary mode the thread also discards segments
    /// under the local retention rule.
    pub fn spawn_checkpointer(self: &Arc<Self>, interval: Duration) -> Checkpointer {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("checkpointer".to_string())
            .spawn(move || engine.checkpoint_loop(interval, shutdown_rx));

        match handle {
            Ok(handle) => Checkpointer {
                shutdown: shutdown_tx,
                handle: Some(handle),
            },
            Err(e) => {
                warn!("failed to start checkpointer: {}", e);
                Checkpointer {
                    shutdown: shutdown_tx,
                    handle: None,
                }
            }
        }
    }

    fn checkpoint_loop(&self, interval: Duration, shutdown: Receiver<()>) {
        let ticker = tick(interval);
        loop {
            crossbeam::select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(e) = self.checkpoint() {
                        warn!("periodic checkpoint failed: {}", e);
                        continue;
                    }
                    if !self.mode.leader_log {
                        if let Err(e) = self.compact() {
                            warn!("WAL compaction failed: {}", e);
                        }
                    }
                }
            }
        }
        debug!("checkpointer stopped");
    }

    // =========================================================================
    // Replication position
    // =========================================================================

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    /// Term stamped on records this node appends from now on
    pub fn set_term(&self, term: u64) {
        self.term.fetch_max(term, Ordering::AcqRel);
    }

    /// Records up to `seq` are final and may be checkpointed
    pub fn set_commit_seq(&self, seq: u64) {
        self.commit_seq.store(seq, Ordering::Release);
    }

    pub fn last_seq(&self) -> u64 {
        self.state.lock().wal.last_seq()
    }

    /// `(last_seq, last_term)` of the log
    pub fn last_position(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.wal.last_seq(), state.wal.last_term())
    }

    pub fn first_seq(&self) -> u64 {
        self.state.lock().wal.first_seq()
    }

    pub fn term_at(&self, seq: u64) -> Option<u64> {
        self.state.lock().wal.term_at(seq)
    }

    /// Up to `max` records from `seq` on; `None` if already discarded
    pub fn records_from(&self, seq: u64, max: usize) -> Option<Vec<Record>> {
        self.state.lock().wal.records_from(seq, max)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            key_count: self.memtable.len(),
            tombstone_count: self.memtable.tombstone_count(),
            approximate_size: self.memtable.size(),
            last_seq: state.wal.last_seq(),
            checkpoint_seq: state.wal.checkpoint_seq(),
            segment_count: state.wal.segment_count(),
            wal_bytes: state.wal.size_bytes(),
        }
    }

    /// What WAL recovery found when the engine was opened
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    pub fn node_id(&self) -> NodeId {
        self.config.cluster.node_id
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sync the WAL and close
    pub fn close(self) -> Result<()> {
        self.state.lock().wal.sync()
    }
}

/// Handle of the background checkpoint thread; stops it on drop
pub struct Checkpointer {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("checkpointer thread panicked");
            }
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Turn a data record into the map entry it produces
fn materialize<F>(record: Record, node: NodeId, counter_of: F) -> Option<(Vec<u8>, KeyEntry)>
where
    F: FnOnce(&[u8]) -> u64,
{
    let Record {
        seq,
        timestamp,
        op,
        version,
        ..
    } = record;
    let (key, value) = match op {
        Operation::Set { key, value } => (key, Some(value)),
        Operation::Delete { key } => (key, None),
        _ => return None,
    };
    let version = match version {
        Some(version) => version,
        None => Version {
            counter: counter_of(&key) + 1,
            vector: VersionVector::new(),
            timestamp,
            origin: node,
        },
    };
    let entry = KeyEntry {
        value,
        version,
        seq,
    };
    Some((key, entry))
}

fn event_for(key: &[u8], entry: &KeyEntry) -> ChangeEvent {
    match &entry.value {
        Some(value) => ChangeEvent::set(
            key.to_vec(),
            value.clone(),
            entry.seq,
            entry.version.timestamp,
        ),
        None => ChangeEvent::delete(key.to_vec(), entry.seq, entry.version.timestamp),
    }
}

fn versioned(key: &[u8], entry: &KeyEntry) -> Versioned {
    Versioned {
        key: key.to_vec(),
        value: entry.value.clone(),
        version: entry.version.clone(),
    }
}
