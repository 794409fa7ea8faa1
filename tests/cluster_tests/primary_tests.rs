//! Tests for primary-secondary replication
//!
//! These tests verify:
//! - A three-node cluster elects exactly one leader
//! - Writes on the leader reach every follower, bulk writes included
//! - Followers refuse writes and name the leader
//! - A new leader takes over when the old one is cut off
//! - A leader without a majority refuses writes
//! - A bulk write survives the loss of the leader
//! - Followers that restart or lose their data catch up again
//! - Term and vote are persisted

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use harborkv::cluster::{HardStateStore, MemberRole, NodeId, PrimaryController, Role};
use harborkv::config::{ReplicationMode, Topology};
use harborkv::engine::Engine;
use harborkv::error::HarborError;
use harborkv::network::{LocalNetwork, MessageHandler, Transport};
use harborkv::protocol::{Command, Message, Status};
use harborkv::wal::Record;
use tempfile::TempDir;

use crate::common::{fast_retry, node_config, wait_until, PrimaryCluster};

const SETTLE: Duration = Duration::from_secs(5);

// =============================================================================
// Helper Functions
// =============================================================================

fn value_on(node: &PrimaryController, key: &[u8]) -> Option<Vec<u8>> {
    node.get(key).ok()
}

fn primary_engine(dir: &Path, node: NodeId) -> Arc<Engine> {
    let topology = Topology::PrimarySecondary {
        replication: ReplicationMode::Synchronous,
    };
    Arc::new(Engine::open(node_config(dir, node, &[1, 2, 3], topology)).unwrap())
}

/// A controller that is never started, so only the messages a test sends
/// reach it
fn idle_follower(dir: &Path) -> Arc<PrimaryController> {
    let network = LocalNetwork::new();
    let transport: Arc<dyn Transport> = Arc::new(network.transport(2, fast_retry()));
    PrimaryController::new(primary_engine(dir, 2), transport).unwrap()
}

fn append(prev_seq: u64, prev_term: u64, records: Vec<Record>) -> Message {
    Message::AppendEntries {
        term: 1,
        leader: 1,
        prev_seq,
        prev_term,
        records,
        leader_commit: 0,
        compact_through: 0,
    }
}

// =============================================================================
// Election Tests
// =============================================================================

#[test]
fn test_single_leader_elected() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);

    let leader = cluster.await_leader(SETTLE).expect("no leader elected");

    let leaders = cluster.nodes.iter().filter(|n| n.is_leader()).count();
    assert_eq!(leaders, 1);

    let term = cluster.node(leader).term();
    assert!(term >= 1);
    for follower in cluster.followers(leader) {
        let status = follower.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.leader, Some(leader));
        assert_eq!(status.term, term);
    }

    let membership = cluster.node(leader).membership();
    assert_eq!(membership.leader, Some(leader));
    assert_eq!(membership.role_of(leader), Some(MemberRole::Primary));
}

#[test]
fn test_vote_is_persisted() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader = cluster.await_leader(SETTLE).expect("no leader elected");
    let term = cluster.node(leader).term();

    let node = cluster.node(leader);
    let store = HardStateStore::open(node.engine().data_dir()).unwrap();
    let saved = store.get();

    assert!(saved.term <= term);
    assert!(saved.term >= 1);
    if saved.term == term {
        assert_eq!(saved.voted_for, Some(leader));
    }
}

// =============================================================================
// Replication Tests
// =============================================================================

#[test]
fn test_writes_replicate_to_followers() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let leader = cluster.node(leader_id);

    let seq = leader.set(b"alpha", b"1").unwrap();
    leader.set(b"beta", b"2").unwrap();
    leader.delete(b"alpha").unwrap();

    assert!(seq >= 1);
    for follower in cluster.followers(leader_id) {
        assert!(wait_until(SETTLE, || {
            value_on(follower, b"beta") == Some(b"2".to_vec())
                && value_on(follower, b"alpha").is_none()
        }));
        assert!(wait_until(SETTLE, || {
            follower.engine().last_position() == leader.engine().last_position()
        }));
    }
}

#[test]
fn test_bulk_write_replicates_as_a_block() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let leader = cluster.node(leader_id);

    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
        .map(|i| (format!("key{:02}", i).into_bytes(), format!("v{}", i).into_bytes()))
        .collect();
    let range = leader.bulk_set(pairs).unwrap().unwrap();
    assert_eq!(range.end() - range.start() + 1, 22);

    for follower in cluster.followers(leader_id) {
        assert!(wait_until(SETTLE, || {
            follower.engine().last_seq() >= *range.end()
        }));
        for i in 0..20 {
            assert_eq!(
                follower.get(format!("key{:02}", i).as_bytes()).unwrap(),
                format!("v{}", i).into_bytes()
            );
        }
    }

    let removed = leader.delete_range(b"key00", b"key10").unwrap();
    assert_eq!(removed, 10);
    for follower in cluster.followers(leader_id) {
        assert!(wait_until(SETTLE, || value_on(follower, b"key05").is_none()));
        assert_eq!(follower.get(b"key10").unwrap(), b"v10".to_vec());
    }
}

#[test]
fn test_commit_advances_on_followers() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let leader = cluster.node(leader_id);

    let seq = leader.set(b"k", b"v").unwrap();

    assert!(leader.status().commit_seq >= seq);
    for follower in cluster.followers(leader_id) {
        assert!(wait_until(SETTLE, || follower.status().commit_seq >= seq));
    }
}

#[test]
fn test_async_replication_catches_up() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Asynchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let leader = cluster.node(leader_id);

    for i in 0..50u32 {
        leader.set(&i.to_be_bytes(), b"x").unwrap();
    }

    let last = leader.engine().last_seq();
    for follower in cluster.followers(leader_id) {
        assert!(wait_until(SETTLE, || follower.engine().last_seq() == last));
        assert_eq!(follower.engine().stats().key_count, 50);
    }
}

#[test]
fn test_followers_refuse_writes() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");

    for follower in cluster.followers(leader_id) {
        match follower.set(b"k", b"v") {
            Err(HarborError::NotLeader { leader }) => assert_eq!(leader, Some(leader_id)),
            other => panic!("expected NotLeader, got {:?}", other),
        }

        let response = follower.execute(Command::Set {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        });
        assert_eq!(response.status, Status::NotLeader);
        assert_eq!(response.leader_hint(), Some(leader_id));
    }
}

#[test]
fn test_follower_reads_are_local() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    cluster.node(leader_id).set(b"k", b"v").unwrap();

    let follower = cluster.followers(leader_id)[0];
    assert!(wait_until(SETTLE, || value_on(follower, b"k").is_some()));

    let response = follower.execute(Command::Get { key: b"k".to_vec() });
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.payload, Some(b"v".to_vec()));

    let missing = follower.execute(Command::Get { key: b"nope".to_vec() });
    assert_eq!(missing.status, Status::NotFound);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_bulk_write_survives_leader_loss() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let old_id = cluster.await_leader(SETTLE).expect("no leader elected");

    cluster
        .node(old_id)
        .bulk_set(vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ])
        .unwrap();

    cluster.network.isolate(old_id);
    cluster.node(old_id).shutdown();
    let new_id = cluster.await_leader(SETTLE).expect("no new leader");

    assert_ne!(new_id, old_id);
    let new_leader = cluster.node(new_id);
    assert_eq!(new_leader.get(b"a").unwrap(), b"1".to_vec());
    assert_eq!(new_leader.get(b"b").unwrap(), b"2".to_vec());
}

#[test]
fn test_follower_restart_inside_bulk_block() {
    let (leader_dir, follower_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let leader = primary_engine(leader_dir.path(), 1);
    leader.set_term(1);
    leader
        .bulk_set(vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ])
        .unwrap();
    let records = leader.records_from(1, 16).unwrap();
    assert_eq!(records.len(), 4);

    // Only the first half of the block arrives before the restart
    {
        let follower = idle_follower(follower_dir.path());
        let reply = follower.handle(append(0, 0, records[..2].to_vec()));
        assert!(matches!(
            reply,
            Message::AppendAck {
                success: true,
                match_seq: 2,
                ..
            }
        ));
    }

    let follower = idle_follower(follower_dir.path());
    assert_eq!(follower.engine().last_seq(), 0);

    let reply = follower.handle(Message::Heartbeat {
        term: 1,
        leader: 1,
        prev_seq: 2,
        prev_term: 1,
        leader_commit: 0,
        compact_through: 0,
    });
    assert!(matches!(
        reply,
        Message::AppendAck {
            success: false,
            conflict_hint: Some(1),
            ..
        }
    ));

    let reply = follower.handle(append(0, 0, records));
    assert!(matches!(
        reply,
        Message::AppendAck {
            success: true,
            match_seq: 4,
            ..
        }
    ));
    assert_eq!(follower.get(b"a").unwrap(), b"1".to_vec());
    assert_eq!(follower.get(b"b").unwrap(), b"2".to_vec());
}

#[test]
fn test_follower_that_lost_its_log_catches_up() {
    let mut cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    for i in 0..10u32 {
        cluster.node(leader_id).set(&i.to_be_bytes(), b"x").unwrap();
    }
    let follower_id = cluster.followers(leader_id)[0].node_id();
    let last = cluster.node(leader_id).engine().last_seq();
    assert!(wait_until(SETTLE, || {
        cluster.node(follower_id).engine().last_seq() == last
    }));

    // The leader still believes the follower holds everything
    cluster.restart(follower_id, true);
    assert_eq!(cluster.node(follower_id).engine().last_seq(), 0);

    let leader_id = cluster.await_leader(SETTLE).expect("no leader after restart");
    let last = cluster.node(leader_id).engine().last_seq();
    let follower = cluster.node(follower_id);
    assert!(wait_until(SETTLE, || follower.engine().last_seq() == last));
    for i in 0..10u32 {
        assert_eq!(follower.get(&i.to_be_bytes()).unwrap(), b"x".to_vec());
    }
}

#[test]
fn test_failover_after_leader_isolated() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let old_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let old_term = cluster.node(old_id).term();
    cluster.node(old_id).set(b"before", b"1").unwrap();

    cluster.network.isolate(old_id);
    let new_id = cluster.await_leader(SETTLE).expect("no new leader");

    assert_ne!(new_id, old_id);
    let new_leader = cluster.node(new_id);
    assert!(new_leader.term() > old_term);
    assert_eq!(new_leader.get(b"before").unwrap(), b"1".to_vec());

    new_leader.set(b"after", b"2").unwrap();
    let survivor = cluster
        .followers(new_id)
        .into_iter()
        .find(|n| n.node_id() != old_id)
        .unwrap();
    assert!(wait_until(SETTLE, || value_on(survivor, b"after").is_some()));

    // The cut-off leader gives up leadership on its own
    assert!(wait_until(SETTLE, || !cluster.node(old_id).is_leader()));
}

#[test]
fn test_old_leader_rejoins_as_follower() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let old_id = cluster.await_leader(SETTLE).expect("no leader elected");

    cluster.network.isolate(old_id);
    let new_id = cluster.await_leader(SETTLE).expect("no new leader");
    cluster.node(new_id).set(b"k", b"new").unwrap();

    cluster.network.heal(old_id);

    let old = cluster.node(old_id);
    assert!(wait_until(SETTLE, || value_on(old, b"k") == Some(b"new".to_vec())));
    assert!(cluster.await_leader(SETTLE).is_some());
}

#[test]
fn test_isolated_leader_refuses_writes() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let leader = cluster.node(leader_id);
    let before = leader.engine().last_seq();

    cluster.network.isolate(leader_id);
    // Outlive the lease but not the step-down grace period
    thread::sleep(Duration::from_millis(200));

    match leader.set(b"k", b"v") {
        Err(HarborError::QuorumUnavailable { required, acked }) => {
            assert_eq!(required, 2);
            assert_eq!(acked, 1);
        }
        other => panic!("expected QuorumUnavailable, got {:?}", other),
    }
    assert_eq!(leader.engine().last_seq(), before);
}

#[test]
fn test_shutdown_leader_steps_down() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");
    let leader = cluster.node(leader_id);

    leader.shutdown();

    assert!(!leader.is_leader());
    assert!(matches!(
        leader.set(b"k", b"v"),
        Err(HarborError::NotLeader { .. })
    ));
}

#[test]
fn test_status_command() {
    let cluster = PrimaryCluster::start(3, ReplicationMode::Synchronous);
    let leader_id = cluster.await_leader(SETTLE).expect("no leader elected");

    let response = cluster.node(leader_id).execute(Command::Status);

    assert_eq!(response.status, Status::Ok);
    let text = response.text();
    assert!(text.contains(&format!("node={}", leader_id)));
    assert!(text.contains("role=Leader"));

    let pong = cluster.node(leader_id).execute(Command::Ping);
    assert_eq!(pong.text(), "PONG");
}
