//! Primary-secondary replication
//!
//! A Raft-style controller: one elected leader assigns sequence numbers and
//! ships its WAL to followers, which append the records verbatim and apply
//! them in leader order.
//!
//! ## Roles
//! ```text
//!            timeout              majority of votes
//! Follower ──────────▶ Candidate ───────────────────▶ Leader
//!    ▲                    │                             │
//!    └────────────────────┴──── higher term / lease ────┘
//! ```
//!
//! ## Locking
//! `state` is never held across a network call. Lock order is
//! `state` → `hard_state` → engine internals.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::config::{ReplicationMode, TimingConfig, Topology};
use crate::engine::Engine;
use crate::error::{HarborError, Result};
use crate::network::{fan_out, MessageHandler, Transport};
use crate::protocol::{Command, Message, Response};
use crate::wal::Record;

use super::{
    respond, ClusterMembership, HardState, HardStateStore, MembershipCell, NodeId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Snapshot of a node's replication state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub last_seq: u64,
    pub commit_seq: u64,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leader = self
            .leader
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "node={} role={:?} term={} leader={} last_seq={} commit_seq={}",
            self.node_id, self.role, self.term, leader, self.last_seq, self.commit_seq
        )
    }
}

/// What the leader knows about one follower
#[derive(Debug, Clone, Copy)]
struct Progress {
    /// Next record to send
    next_seq: u64,
    /// Highest record known to be on the follower
    match_seq: u64,
    last_ack: Option<Instant>,
    /// A request to this follower is outstanding
    in_flight: bool,
}

struct RaftState {
    role: Role,
    term: u64,
    leader: Option<NodeId>,
    election_deadline: Instant,
    progress: HashMap<NodeId, Progress>,
    commit_seq: u64,
    lease_lost_since: Option<Instant>,
}

struct Ticker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Leader election and log shipping for one node
pub struct PrimaryController {
    me: Weak<PrimaryController>,
    node_id: NodeId,
    peers: Vec<NodeId>,
    majority: usize,
    replication: ReplicationMode,
    timing: TimingConfig,
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    state: Mutex<RaftState>,
    /// Signalled whenever a follower reply has been folded in
    replied: Condvar,
    hard_state: Mutex<HardStateStore>,
    membership: MembershipCell,
    /// Serializes follower-side log reconciliation
    follower_log: Mutex<()>,
    ticker: Mutex<Option<Ticker>>,
}

impl PrimaryController {
    /// Build a controller over an opened engine
    ///
    /// Fails unless the engine was configured for primary-secondary mode.
    pub fn new(engine: Arc<Engine>, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let config = engine.config();
        let replication = match config.cluster.topology {
            Topology::PrimarySecondary { replication } => replication,
            other => {
                return Err(HarborError::Config(format!(
                    "primary controller needs a primary-secondary topology, got {:?}",
                    other
                )))
            }
        };

        let hard_state = HardStateStore::open(engine.data_dir())?;
        let (_, last_term) = engine.last_position();
        let term = hard_state.get().term.max(last_term);
        let commit_seq = engine.stats().checkpoint_seq;
        let timing = config.timing;
        let peers = config.cluster.peer_ids();
        let majority = config.cluster.majority();
        let mut membership = ClusterMembership::from_config(&config.cluster);
        membership.term = term;
        let node_id = config.cluster.node_id;

        info!(node = node_id, term, commit_seq, "primary-secondary controller ready");

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node_id,
            peers,
            majority,
            replication,
            timing,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                term,
                leader: None,
                election_deadline: Instant::now() + random_timeout(&timing),
                progress: HashMap::new(),
                commit_seq,
                lease_lost_since: None,
            }),
            replied: Condvar::new(),
            hard_state: Mutex::new(hard_state),
            membership: MembershipCell::new(membership),
            follower_log: Mutex::new(()),
            ticker: Mutex::new(None),
            engine,
            transport,
        }))
    }

    /// Start the heartbeat/election timer thread
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let me = self.me.clone();
        let interval = self.timing.heartbeat_interval;
        let handle = thread::Builder::new()
            .name(format!("raft-{}", self.node_id))
            .spawn(move || run_ticker(me, interval, shutdown_rx))?;

        *ticker = Some(Ticker {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the timer thread; the node stops voting and leading
    pub fn shutdown(&self) {
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.shutdown.try_send(());
            if ticker.handle.join().is_err() {
                warn!("raft ticker panicked");
            }
        }
        let mut state = self.state.lock();
        if state.role == Role::Leader {
            let term = state.term;
            self.step_down(&mut state, term, None);
        }
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    /// Read from the local map; followers may lag the leader
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.engine.get(key)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.replicated(|engine| {
            let seq = engine.set(key, value)?;
            Ok((seq, Some(seq)))
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<Option<u64>> {
        self.replicated(|engine| {
            let seq = engine.delete(key)?;
            Ok((seq, seq))
        })
    }

    /// Atomic multi-key write, replicated as one block
    pub fn bulk_set(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Option<RangeInclusive<u64>>> {
        self.replicated(|engine| {
            let range = engine.bulk_set(pairs)?;
            let end = range.as_ref().map(|r| *r.end());
            Ok((range, end))
        })
    }

    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        self.replicated(|engine| {
            let removed = engine.delete_range(start, end)?;
            let seq = (removed > 0).then(|| engine.last_seq());
            Ok((removed, seq))
        })
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
            Command::Status => Response::ok(Some(self.status().to_string().into_bytes())),
        }
    }

    /// Apply a write locally, then replicate it per the replication mode
    ///
    /// `write` returns its result and the seq that must reach a majority
    /// (`None` when nothing was written).
    fn replicated<T, F>(&self, write: F) -> Result<T>
    where
        F: FnOnce(&Engine) -> Result<(T, Option<u64>)>,
    {
        let term = self.ensure_writable()?;
        let (out, seq) = write(&self.engine)?;

        if let Some(seq) = seq {
            self.advance_commit(&mut self.state.lock());
            match self.replication {
                ReplicationMode::Synchronous => self.await_replication(term, seq)?,
                ReplicationMode::Asynchronous => self.send_appends(),
            }
        }
        Ok(out)
    }

    fn ensure_writable(&self) -> Result<u64> {
        let state = self.state.lock();
        if state.role != Role::Leader {
            return Err(HarborError::NotLeader {
                leader: state.leader,
            });
        }
        let acked = self.lease_acks(&state, Instant::now());
        if acked < self.majority {
            return Err(HarborError::QuorumUnavailable {
                required: self.majority,
                acked,
            });
        }
        Ok(state.term)
    }

    /// Block until a majority, leader included, holds `seq`
    fn await_replication(&self, term: u64, seq: u64) -> Result<()> {
        let deadline = Instant::now() + self.timing.election_timeout_max;
        loop {
            self.send_appends();

            let mut state = self.state.lock();
            if state.term != term || state.role != Role::Leader {
                return Err(if state.term > term {
                    HarborError::StaleLeader {
                        term,
                        observed: state.term,
                    }
                } else {
                    HarborError::NotLeader {
                        leader: state.leader,
                    }
                });
            }

            let acked = 1 + state
                .progress
                .values()
                .filter(|p| p.match_seq >= seq)
                .count();
            if acked >= self.majority {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(seq, acked, required = self.majority, "write missed its quorum");
                return Err(HarborError::QuorumUnavailable {
                    required: self.majority,
                    acked,
                });
            }
            let wake = deadline.min(now + self.timing.heartbeat_interval);
            self.replied.wait_until(&mut state, wake);
        }
    }

    // =========================================================================
    // Leader side
    // =========================================================================

    /// One timer tick: heartbeat as leader, maybe start an election otherwise
    pub fn tick(&self) {
        let now = Instant::now();
        let (role, deadline) = {
            let state = self.state.lock();
            (state.role, state.election_deadline)
        };

        match role {
            Role::Leader => {
                self.check_lease(now);
                self.send_appends();
                self.compact_acknowledged();
            }
            Role::Follower | Role::Candidate => {
                if now >= deadline {
                    self.run_election();
                }
            }
        }
    }

    /// Send every idle follower what it is missing, or a heartbeat
    fn send_appends(&self) {
        let (term, commit, compact, targets) = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            let compact = self.compact_point(&state);
            let mut targets = Vec::new();
            for (&peer, progress) in state.progress.iter_mut() {
                if !progress.in_flight {
                    progress.in_flight = true;
                    targets.push((peer, progress.next_seq));
                }
            }
            (state.term, state.commit_seq, compact, targets)
        };

        for (peer, next_seq) in targets {
            match self.append_for(term, next_seq, commit, compact) {
                Some(message) => self.dispatch(peer, term, message),
                None => {
                    warn!(
                        peer,
                        next_seq,
                        first = self.engine.first_seq(),
                        "follower is behind the retained log"
                    );
                    self.clear_in_flight(peer);
                }
            }
        }
    }

    fn append_for(&self, term: u64, next_seq: u64, commit: u64, compact: u64) -> Option<Message> {
        let prev_seq = next_seq.saturating_sub(1);
        let prev_term = self.engine.term_at(prev_seq)?;
        let records = self
            .engine
            .records_from(prev_seq + 1, self.timing.max_append_batch)?;

        Some(if records.is_empty() {
            Message::Heartbeat {
                term,
                leader: self.node_id,
                prev_seq,
                prev_term,
                leader_commit: commit,
                compact_through: compact,
            }
        } else {
            Message::AppendEntries {
                term,
                leader: self.node_id,
                prev_seq,
                prev_term,
                records,
                leader_commit: commit,
                compact_through: compact,
            }
        })
    }

    fn dispatch(&self, peer: NodeId, term: u64, message: Message) {
        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name(format!("append-{}", peer))
            .spawn(move || {
                if let Some(controller) = me.upgrade() {
                    trace!(peer, kind = ?message.kind(), "shipping log");
                    let reply = controller.transport.send(peer, &message);
                    controller.on_append_reply(peer, term, reply);
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn replication thread: {}", e);
            self.clear_in_flight(peer);
        }
    }

    fn clear_in_flight(&self, peer: NodeId) {
        if let Some(progress) = self.state.lock().progress.get_mut(&peer) {
            progress.in_flight = false;
        }
    }

    fn on_append_reply(&self, peer: NodeId, sent_term: u64, reply: Result<Message>) {
        let mut state = self.state.lock();
        if let Some(progress) = state.progress.get_mut(&peer) {
            progress.in_flight = false;
        }

        match reply {
            Ok(Message::AppendAck {
                term,
                success,
                match_seq,
                conflict_hint,
            }) => {
                if term > state.term {
                    info!(peer, term, "follower reports a newer term");
                    self.step_down(&mut state, term, None);
                } else if term == sent_term && state.term == sent_term && state.role == Role::Leader
                {
                    if let Some(progress) = state.progress.get_mut(&peer) {
                        progress.last_ack = Some(Instant::now());
                        if success {
                            progress.match_seq = progress.match_seq.max(match_seq);
                            progress.next_seq = progress.next_seq.max(progress.match_seq + 1);
                        } else if let Some(hint) = conflict_hint {
                            debug!(peer, hint, "follower diverged, rewinding");
                            if hint <= progress.match_seq {
                                // A restart cut records the follower had acknowledged
                                warn!(
                                    peer,
                                    hint,
                                    match_seq = progress.match_seq,
                                    "follower lost acknowledged records"
                                );
                                progress.match_seq = hint.saturating_sub(1);
                            }
                            progress.next_seq = hint.max(progress.match_seq + 1);
                        }
                    }
                    self.advance_commit(&mut state);
                }
            }
            Ok(Message::Error { message }) => warn!(peer, "append rejected: {}", message),
            Ok(other) => warn!(peer, kind = ?other.kind(), "unexpected reply to append"),
            Err(e) => debug!(peer, "append failed: {}", e),
        }

        drop(state);
        self.replied.notify_all();
    }

    /// Commit the highest seq of this term held by a majority
    fn advance_commit(&self, state: &mut RaftState) {
        if state.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = state.progress.values().map(|p| p.match_seq).collect();
        matched.push(self.engine.last_seq());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = matched.get(self.majority - 1) else {
            return;
        };
        if candidate > state.commit_seq && self.engine.term_at(candidate) == Some(state.term) {
            trace!(commit = candidate, "commit advanced");
            state.commit_seq = candidate;
            self.engine.set_commit_seq(candidate);
        }
    }

    /// Highest seq every node holds, capped at the commit point
    fn compact_point(&self, state: &RaftState) -> u64 {
        state
            .progress
            .values()
            .map(|p| p.match_seq)
            .min()
            .unwrap_or(u64::MAX)
            .min(state.commit_seq)
    }

    fn compact_acknowledged(&self) {
        let compact = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            self.compact_point(&state)
        };
        if compact > 0 {
            if let Err(e) = self.engine.compact_through(compact) {
                warn!("WAL compaction failed: {}", e);
            }
        }
    }

    /// Nodes (self included) that acknowledged us within the lease window
    fn lease_acks(&self, state: &RaftState, now: Instant) -> usize {
        let window = self.timing.election_timeout_min;
        1 + state
            .progress
            .values()
            .filter(|p| p.last_ack.is_some_and(|t| now.duration_since(t) < window))
            .count()
    }

    fn check_lease(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.role != Role::Leader {
            return;
        }
        let acks = self.lease_acks(&state, now);
        if acks >= self.majority {
            state.lease_lost_since = None;
            return;
        }

        let since = *state.lease_lost_since.get_or_insert(now);
        if now.duration_since(since) >= self.timing.election_timeout_max {
            warn!(term = state.term, acks, "lost contact with a majority, stepping down");
            let term = state.term;
            self.step_down(&mut state, term, None);
        }
    }

    // =========================================================================
    // Elections
    // =========================================================================

    fn run_election(&self) {
        let (term, last_seq, last_term) = {
            let mut state = self.state.lock();
            if state.role == Role::Leader {
                return;
            }
            state.election_deadline = Instant::now() + random_timeout(&self.timing);
            let term = state.term + 1;
            if let Err(e) = self.persist(term, Some(self.node_id)) {
                warn!(term, "could not persist vote, skipping election: {}", e);
                return;
            }
            state.term = term;
            state.role = Role::Candidate;
            state.leader = None;
            let (last_seq, last_term) = self.engine.last_position();
            (term, last_seq, last_term)
        };

        info!(node = self.node_id, term, last_seq, "starting election");

        let request = Message::VoteRequest {
            term,
            candidate: self.node_id,
            last_seq,
            last_term,
        };
        let replies = fan_out(&self.transport, &self.peers, request);
        let deadline = Instant::now() + self.timing.election_timeout_min;

        let mut voters = Vec::new();
        while voters.len() + 1 < self.majority {
            match replies.recv_deadline(deadline) {
                Ok((peer, Ok(Message::VoteResponse { term: seen, granted }))) => {
                    if seen > term {
                        let mut state = self.state.lock();
                        if seen > state.term {
                            self.step_down(&mut state, seen, None);
                        }
                        return;
                    }
                    if granted && seen == term {
                        debug!(peer, term, "vote granted");
                        voters.push(peer);
                    }
                }
                Ok((peer, Ok(other))) => {
                    warn!(peer, kind = ?other.kind(), "unexpected reply to vote request")
                }
                Ok((peer, Err(e))) => debug!(peer, "vote request failed: {}", e),
                // Deadline passed or every peer answered
                Err(_) => break,
            }
        }

        if voters.len() + 1 >= self.majority {
            self.become_leader(term, &voters);
        } else {
            debug!(term, votes = voters.len() + 1, "election did not reach a majority");
        }
    }

    fn become_leader(&self, term: u64, voters: &[NodeId]) {
        {
            let mut state = self.state.lock();
            if state.term != term || state.role != Role::Candidate {
                return;
            }

            let now = Instant::now();
            let next_seq = self.engine.last_seq() + 1;
            state.role = Role::Leader;
            state.leader = Some(self.node_id);
            state.lease_lost_since = None;
            state.progress = self
                .peers
                .iter()
                .map(|&peer| {
                    let progress = Progress {
                        next_seq,
                        match_seq: 0,
                        last_ack: voters.contains(&peer).then_some(now),
                        in_flight: false,
                    };
                    (peer, progress)
                })
                .collect();
            self.engine.set_term(term);
            self.membership
                .update(|m| m.set_leader(term, Some(self.node_id)));
        }

        info!(node = self.node_id, term, "became leader");
        self.send_appends();
    }

    /// Become a follower of `leader` in `term`
    fn step_down(&self, state: &mut RaftState, term: u64, leader: Option<NodeId>) {
        if term > state.term {
            if let Err(e) = self.persist(term, None) {
                warn!(term, "could not persist term: {}", e);
            }
            state.term = term;
        }
        if state.role == Role::Leader {
            info!(node = self.node_id, term, "stepping down");
        }
        state.role = Role::Follower;
        state.leader = leader;
        state.progress.clear();
        state.lease_lost_since = None;
        state.election_deadline = Instant::now() + random_timeout(&self.timing);
        self.membership.update(|m| m.set_leader(term, leader));
    }

    fn persist(&self, term: u64, voted_for: Option<NodeId>) -> Result<()> {
        self.hard_state.lock().save(HardState { term, voted_for })
    }

    // =========================================================================
    // Follower side
    // =========================================================================

    fn handle_vote(&self, term: u64, candidate: NodeId, last_seq: u64, last_term: u64) -> Message {
        let mut state = self.state.lock();
        if term > state.term {
            self.step_down(&mut state, term, None);
        }
        if term < state.term {
            return Message::VoteResponse {
                term: state.term,
                granted: false,
            };
        }

        let voted_for = self.hard_state.lock().get().voted_for;
        let (our_seq, our_term) = self.engine.last_position();
        let up_to_date = (last_term, last_seq) >= (our_term, our_seq);
        let mut granted = up_to_date && voted_for.map_or(true, |v| v == candidate);

        if granted {
            if let Err(e) = self.persist(term, Some(candidate)) {
                warn!(term, "could not persist vote: {}", e);
                granted = false;
            } else {
                state.election_deadline = Instant::now() + random_timeout(&self.timing);
            }
        }
        debug!(candidate, term, granted, "vote requested");

        Message::VoteResponse {
            term: state.term,
            granted,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append(
        &self,
        term: u64,
        leader: NodeId,
        prev_seq: u64,
        prev_term: u64,
        records: Vec<Record>,
        leader_commit: u64,
        compact_through: u64,
    ) -> Message {
        let current = {
            let mut state = self.state.lock();
            if term < state.term {
                return Message::AppendAck {
                    term: state.term,
                    success: false,
                    match_seq: 0,
                    conflict_hint: None,
                };
            }
            if term > state.term || state.role != Role::Follower || state.leader != Some(leader) {
                self.step_down(&mut state, term, Some(leader));
            }
            state.election_deadline = Instant::now() + random_timeout(&self.timing);
            state.term
        };

        let _log = self.follower_log.lock();
        match self.reconcile(prev_seq, prev_term, records) {
            Ok(match_seq) => {
                self.follow_commit(leader_commit.min(match_seq), compact_through);
                Message::AppendAck {
                    term: current,
                    success: true,
                    match_seq,
                    conflict_hint: None,
                }
            }
            Err(HarborError::LogDivergence { seq }) => Message::AppendAck {
                term: current,
                success: false,
                match_seq: 0,
                conflict_hint: Some(seq),
            },
            Err(e) => {
                warn!(leader, "failed to apply replicated records: {}", e);
                Message::AppendAck {
                    term: current,
                    success: false,
                    match_seq: 0,
                    conflict_hint: None,
                }
            }
        }
    }

    /// Make the local log agree with the leader's up to the last record sent
    ///
    /// Records already present with the same term are skipped; the first
    /// conflicting record truncates the local tail from there on.
    fn reconcile(&self, prev_seq: u64, prev_term: u64, records: Vec<Record>) -> Result<u64> {
        let mut last = self.engine.last_seq();
        if prev_seq > last {
            return Err(HarborError::LogDivergence { seq: last + 1 });
        }
        if !self.holds(prev_seq, prev_term) {
            self.engine.truncate_after(prev_seq.saturating_sub(1))?;
            return Err(HarborError::LogDivergence { seq: prev_seq });
        }

        let match_seq = prev_seq + records.len() as u64;
        let mut fresh = Vec::with_capacity(records.len());
        for record in records {
            if fresh.is_empty() && record.seq <= last {
                if self.holds(record.seq, record.term) {
                    continue;
                }
                self.engine.truncate_after(record.seq - 1)?;
                last = record.seq - 1;
            }
            fresh.push(record);
        }

        if !fresh.is_empty() {
            trace!(count = fresh.len(), "appending replicated records");
            self.engine.apply_replicated(fresh)?;
        }
        Ok(match_seq)
    }

    /// Whether the local record at `seq` carries `term`
    ///
    /// Discarded records were committed, so they match by definition.
    fn holds(&self, seq: u64, term: u64) -> bool {
        match self.engine.term_at(seq) {
            Some(local) => local == term,
            None => seq < self.engine.first_seq(),
        }
    }

    fn follow_commit(&self, commit: u64, compact_through: u64) {
        {
            let mut state = self.state.lock();
            if commit > state.commit_seq {
                state.commit_seq = commit;
                self.engine.set_commit_seq(commit);
            }
        }
        if compact_through > 0 {
            if let Err(e) = self.engine.compact_through(compact_through.min(commit)) {
                warn!("WAL compaction failed: {}", e);
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock();
        NodeStatus {
            node_id: self.node_id,
            role: state.role,
            term: state.term,
            leader: state.leader,
            last_seq: self.engine.last_seq(),
            commit_seq: state.commit_seq,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
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

impl MessageHandler for PrimaryController {
    fn handle(&self, message: Message) -> Message {
        match message {
            Message::VoteRequest {
                term,
                candidate,
                last_seq,
                last_term,
            } => self.handle_vote(term, candidate, last_seq, last_term),
            Message::Heartbeat {
                term,
                leader,
                prev_seq,
                prev_term,
                leader_commit,
                compact_through,
            } => self.handle_append(
                term,
                leader,
                prev_seq,
                prev_term,
                Vec::new(),
                leader_commit,
                compact_through,
            ),
            Message::AppendEntries {
                term,
                leader,
                prev_seq,
                prev_term,
                records,
                leader_commit,
                compact_through,
            } => self.handle_append(
                term,
                leader,
                prev_seq,
                prev_term,
                records,
                leader_commit,
                compact_through,
            ),
            Message::Client(command) => Message::ClientReply(self.execute(command)),
            other => Message::error(format!(
                "{:?} is not served in primary-secondary mode",
                other.kind()
            )),
        }
    }
}

impl Drop for PrimaryController {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            let _ = ticker.shutdown.try_send(());
        }
    }
}

fn run_ticker(controller: Weak<PrimaryController>, interval: Duration, shutdown: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        crossbeam::select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.tick();
            }
        }
    }
    debug!("raft ticker stopped");
}

fn random_timeout(timing: &TimingConfig) -> Duration {
    let min = timing.election_timeout_min.as_millis() as u64;
    let max = timing.election_timeout_max.as_millis() as u64;
    if max <= min {
        return timing.election_timeout_min;
    }
    Duration::from_millis(rand::rng().random_range(min..max))
}
