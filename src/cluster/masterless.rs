//! Masterless replication
//!
//! Every node accepts writes. A write is applied locally with a fresh
//! version, then replicated to the peers; reads ask `R` nodes and keep the
//! causally latest versions. A background thread exchanges digests with one
//! peer at a time so replicas converge even without new traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{ConflictPolicy, ReplicationMode, Topology};
use crate::engine::Engine;
use crate::error::{HarborError, Result};
use crate::network::{fan_out, MessageHandler, Transport};
use crate::protocol::{Command, Message, Response};

use super::{
    lww_winner, maximal, respond, Causality, ClusterMembership, MembershipCell, NodeId, Version,
    Versioned,
};

/// What one anti-entropy exchange repaired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AntiEntropyReport {
    /// Keys taken from the peer that changed local state
    pub pulled: usize,
    /// Keys sent to the peer that changed its state
    pub pushed: usize,
}

struct Ticker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Quorum reads and writes plus anti-entropy for one node
pub struct MasterlessController {
    me: Weak<MasterlessController>,
    node_id: NodeId,
    peers: Vec<NodeId>,
    write_quorum: usize,
    read_quorum: usize,
    write_mode: ReplicationMode,
    conflict_policy: ConflictPolicy,
    anti_entropy_interval: Duration,
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    membership: MembershipCell,
    /// Round-robin cursor over `peers`
    next_peer: AtomicUsize,
    ticker: Mutex<Option<Ticker>>,
}

impl MasterlessController {
    pub fn new(engine: Arc<Engine>, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let config = engine.config();
        let (write_quorum, read_quorum, write_mode, conflict_policy) =
            match config.cluster.topology {
                Topology::Masterless {
                    write_quorum,
                    read_quorum,
                    write_mode,
                    conflict_policy,
                } => (write_quorum, read_quorum, write_mode, conflict_policy),
                other => {
                    return Err(HarborError::Config(format!(
                        "masterless controller needs a masterless topology, got {:?}",
                        other
                    )))
                }
            };

        let node_id = config.cluster.node_id;
        let peers = config.cluster.peer_ids();
        let membership = MembershipCell::new(ClusterMembership::from_config(&config.cluster));
        let anti_entropy_interval = config.timing.anti_entropy_interval;

        info!(
            node = node_id,
            n = peers.len() + 1,
            w = write_quorum,
            r = read_quorum,
            "masterless controller ready"
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node_id,
            peers,
            write_quorum,
            read_quorum,
            write_mode,
            conflict_policy,
            anti_entropy_interval,
            engine,
            transport,
            membership,
            next_peer: AtomicUsize::new(0),
            ticker: Mutex::new(None),
        }))
    }

    /// Start the anti-entropy thread
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() || self.peers.is_empty() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let me = self.me.clone();
        let interval = self.anti_entropy_interval;
        let handle = thread::Builder::new()
            .name(format!("anti-entropy-{}", self.node_id))
            .spawn(move || run_anti_entropy(me, interval, shutdown_rx))?;

        *ticker = Some(Ticker {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.shutdown.try_send(());
            if ticker.handle.join().is_err() {
                warn!("anti-entropy thread panicked");
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write locally, then replicate per the write mode
    ///
    /// On `QuorumUnavailable` the local write stays; anti-entropy spreads it
    /// once the peers are reachable again.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<Versioned> {
        let written = self.engine.write(key, Some(value))?;
        self.replicate(vec![written.clone()])?;
        Ok(written)
    }

    /// Write a tombstone, even if the key is unknown locally
    pub fn delete(&self, key: &[u8]) -> Result<Versioned> {
        let written = self.engine.write(key, None)?;
        self.replicate(vec![written.clone()])?;
        Ok(written)
    }

    /// Atomic locally; replicas apply each key by its own version
    pub fn bulk_set(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<Versioned>> {
        let items = pairs
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        let written = self.engine.bulk_write(items)?;
        self.replicate(written.clone())?;
        Ok(written)
    }

    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        let written = self.engine.delete_range_versioned(start, end)?;
        let removed = written.len();
        self.replicate(written)?;
        Ok(removed)
    }

    fn replicate(&self, entries: Vec<Versioned>) -> Result<()> {
        if entries.is_empty() || self.peers.is_empty() {
            return Ok(());
        }

        let message = Message::WriteReplicate {
            from: self.node_id,
            entries,
        };
        let replies = fan_out(&self.transport, &self.peers, message);
        let needed = self.write_quorum.saturating_sub(1);

        if self.write_mode == ReplicationMode::Asynchronous || needed == 0 {
            drain_in_background(replies, "replicate");
            return Ok(());
        }

        let mut acked = 0;
        while acked < needed {
            match replies.recv() {
                Ok((_, Ok(Message::WriteAck { .. }))) => acked += 1,
                Ok((peer, Ok(other))) => {
                    warn!(peer, kind = ?other.kind(), "unexpected reply to replicate")
                }
                Ok((peer, Err(e))) => warn!(peer, "replication failed: {}", e),
                // Every peer answered
                Err(_) => break,
            }
        }

        if acked < needed {
            return Err(HarborError::QuorumUnavailable {
                required: self.write_quorum,
                acked: acked + 1,
            });
        }
        drain_in_background(replies, "replicate");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.read(key)?
            .and_then(|found| found.value)
            .ok_or(HarborError::KeyNotFound)
    }

    /// Quorum read: the causally latest version among `R` nodes
    ///
    /// Tombstones come back as entries with no value. Concurrent versions are
    /// resolved by last-writer-wins, or returned as
    /// `ConcurrentWriteConflict` under `ConflictPolicy::Surface`.
    pub fn read(&self, key: &[u8]) -> Result<Option<Versioned>> {
        let mut responses: Vec<(NodeId, Option<Versioned>)> =
            vec![(self.node_id, self.engine.get_versioned(key))];
        let needed = self.read_quorum.saturating_sub(1);

        if needed > 0 {
            let replies = fan_out(
                &self.transport,
                &self.peers,
                Message::ReadRequest { key: key.to_vec() },
            );
            while responses.len() <= needed {
                match replies.recv() {
                    Ok((peer, Ok(Message::ReadResponse { entry }))) => {
                        responses.push((peer, entry))
                    }
                    Ok((peer, Ok(other))) => {
                        warn!(peer, kind = ?other.kind(), "unexpected reply to read")
                    }
                    Ok((peer, Err(e))) => debug!(peer, "read failed: {}", e),
                    Err(_) => break,
                }
            }
            if responses.len() <= needed {
                return Err(HarborError::QuorumUnavailable {
                    required: self.read_quorum,
                    acked: responses.len(),
                });
            }
        }

        let found: Vec<Versioned> = responses
            .iter()
            .filter_map(|(_, entry)| entry.clone())
            .collect();
        let mut latest = maximal(found);

        let winner = match latest.len() {
            0 => return Ok(None),
            1 => latest.remove(0),
            _ => match self.conflict_policy {
                ConflictPolicy::Surface => {
                    return Err(HarborError::ConcurrentWriteConflict { siblings: latest })
                }
                ConflictPolicy::LastWriterWins => match lww_winner(&latest) {
                    Some(winner) => winner.clone(),
                    None => return Ok(None),
                },
            },
        };

        self.read_repair(&winner, &responses);
        Ok(Some(winner))
    }

    /// Push `winner` to every responder that returned something else
    fn read_repair(&self, winner: &Versioned, responses: &[(NodeId, Option<Versioned>)]) {
        let mut stale = Vec::new();
        for (node, entry) in responses {
            let current = entry.as_ref().map(|e| &e.version);
            if current == Some(&winner.version) {
                continue;
            }
            if *node == self.node_id {
                if let Err(e) = self.engine.apply_versioned(winner.clone()) {
                    warn!("local read repair failed: {}", e);
                }
            } else {
                stale.push(*node);
            }
        }

        if !stale.is_empty() {
            trace!(nodes = ?stale, "read repair");
            let message = Message::WriteReplicate {
                from: self.node_id,
                entries: vec![winner.clone()],
            };
            drain_in_background(fan_out(&self.transport, &stale, message), "read repair");
        }
    }

    // =========================================================================
    // Anti-entropy
    // =========================================================================

    /// Exchange digests with the next peer in round-robin order
    pub fn anti_entropy_tick(&self) -> Option<Result<AntiEntropyReport>> {
        if self.peers.is_empty() {
            return None;
        }
        let index = self.next_peer.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        let peer = self.peers[index];
        Some(self.run_anti_entropy_round(peer))
    }

    /// Reconcile every key with `peer`
    ///
    /// Keys the peer holds newer or concurrent versions of are pulled and
    /// merged locally; keys we hold newer or concurrent versions of are then
    /// pushed, so both sides end with the same versions.
    pub fn run_anti_entropy_round(&self, peer: NodeId) -> Result<AntiEntropyReport> {
        let ours: HashMap<Vec<u8>, Version> = self.engine.digest().into_iter().collect();
        let request = Message::AntiEntropyDigest {
            from: self.node_id,
            digest: ours.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };

        let theirs: HashMap<Vec<u8>, Version> = match self.transport.send(peer, &request)? {
            Message::AntiEntropyDigest { digest, .. } => digest.into_iter().collect(),
            other => return Err(unexpected(peer, &other)),
        };

        let pull: Vec<Vec<u8>> = theirs
            .iter()
            .filter(|(key, version)| wanted(ours.get(*key), version))
            .map(|(key, _)| key.clone())
            .collect();
        let push: Vec<Vec<u8>> = ours
            .iter()
            .filter(|(key, version)| wanted(theirs.get(*key), version))
            .map(|(key, _)| key.clone())
            .collect();

        let mut report = AntiEntropyReport::default();

        if !pull.is_empty() {
            match self.transport.send(peer, &Message::AntiEntropyPull { keys: pull })? {
                Message::AntiEntropyEntries { entries } => {
                    for entry in entries {
                        if self.engine.apply_versioned(entry)? {
                            report.pulled += 1;
                        }
                    }
                }
                other => return Err(unexpected(peer, &other)),
            }
        }

        if !push.is_empty() {
            let entries = self.engine.entries_for(&push);
            let message = Message::WriteReplicate {
                from: self.node_id,
                entries,
            };
            match self.transport.send(peer, &message)? {
                Message::WriteAck { applied } => report.pushed = applied,
                other => return Err(unexpected(peer, &other)),
            }
        }

        if report.pulled + report.pushed > 0 {
            debug!(peer, pulled = report.pulled, pushed = report.pushed, "anti-entropy repaired keys");
        }
        Ok(report)
    }

    // =========================================================================
    // Peer requests
    // =========================================================================

    fn apply_replicated(&self, from: NodeId, entries: Vec<Versioned>) -> Message {
        let mut applied = 0;
        for entry in entries {
            match self.engine.apply_versioned(entry) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(from, "failed to apply replicated write: {}", e);
                    return Message::error(e.to_string());
                }
            }
        }
        trace!(from, applied, "applied replicated writes");
        Message::WriteAck { applied }
    }

    /// Run a command from the client surface
    pub fn execute(&self, command: Command) -> Response {
        match command {
            Command::Get { key } => respond(self.get(&key), Some),
            Command::Set { key, value } => respond(self.set(&key, &value), |_| None),
            Command::Delete { key } => respond(self.delete(&key), |_| None),
            Command::BulkSet { pairs } => respond(self.bulk_set(pairs), |_| None),
            Command::DeleteRange { start, end } => respond(self.delete_range(&start, &end), |n| {
                Some(n.to_string().into_bytes())
            }),
            Command::Ping => Response::ok(Some(b"PONG".to_vec())),
            Command::Status => {
                let stats = self.engine.stats();
                let status = format!(
                    "node={} mode=masterless members={} w={} r={} keys={} last_seq={}",
                    self.node_id,
                    self.membership.snapshot().members.len(),
                    self.write_quorum,
                    self.read_quorum,
                    stats.key_count,
                    stats.last_seq
                );
                Response::ok(Some(status.into_bytes()))
            }
        }
    }

    pub fn membership(&self) -> Arc<ClusterMembership> {
        self.membership.snapshot()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl MessageHandler for MasterlessController {
    fn handle(&self, message: Message) -> Message {
        match message {
            Message::WriteReplicate { from, entries } => self.apply_replicated(from, entries),
            Message::ReadRequest { key } => Message::ReadResponse {
                entry: self.engine.get_versioned(&key),
            },
            Message::AntiEntropyDigest { from, digest } => {
                trace!(from, keys = digest.len(), "digest received");
                Message::AntiEntropyDigest {
                    from: self.node_id,
                    digest: self.engine.digest(),
                }
            }
            Message::AntiEntropyPull { keys } => Message::AntiEntropyEntries {
                entries: self.engine.entries_for(&keys),
            },
            Message::Client(command) => Message::ClientReply(self.execute(command)),
            other => Message::error(format!(
                "{:?} is not served in masterless mode",
                other.kind()
            )),
        }
    }
}

impl Drop for MasterlessController {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            let _ = ticker.shutdown.try_send(());
        }
    }
}

/// Whether `offered` should replace `held`: newer, concurrent, or unknown
fn wanted(held: Option<&Version>, offered: &Version) -> bool {
    match held {
        None => true,
        Some(held) => matches!(
            offered.causality(held),
            Causality::After | Causality::Concurrent
        ),
    }
}

fn unexpected(peer: NodeId, message: &Message) -> HarborError {
    match message {
        Message::Error { message } => {
            HarborError::Protocol(format!("node {} failed: {}", peer, message))
        }
        other => HarborError::Protocol(format!(
            "unexpected {:?} from node {}",
            other.kind(),
            peer
        )),
    }
}

/// Log the remaining replies of a fan-out without waiting for them
fn drain_in_background(replies: Receiver<(NodeId, Result<Message>)>, what: &'static str) {
    let spawned = thread::Builder::new()
        .name(format!("drain-{}", what))
        .spawn(move || {
            for (peer, reply) in replies {
                match reply {
                    Ok(Message::Error { message }) => warn!(peer, "{} rejected: {}", what, message),
                    Ok(_) => {}
                    Err(e) => debug!(peer, "{} failed: {}", what, e),
                }
            }
        });
    if let Err(e) = spawned {
        warn!("failed to spawn {} drain thread: {}", what, e);
    }
}

fn run_anti_entropy(controller: Weak<MasterlessController>, interval: Duration, shutdown: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        crossbeam::select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if let Some(Err(e)) = controller.anti_entropy_tick() {
                    warn!("anti-entropy round failed: {}", e);
                }
            }
        }
    }
    debug!("anti-entropy stopped");
}
