//! Shared helpers for the cluster tests
//!
//! Clusters here run in one process over a `LocalNetwork`, with timers
//! short enough that an election settles in well under a second.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use harborkv::cluster::{MasterlessController, NodeId, PrimaryController};
use harborkv::config::{
    Config, ConflictPolicy, ReplicationMode, RetryPolicy, TimingConfig, Topology,
};
use harborkv::engine::Engine;
use harborkv::network::{LocalNetwork, MessageHandler, Transport};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_interval: Duration::from_millis(20),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        anti_entropy_interval: Duration::from_secs(60),
        rpc_timeout: Duration::from_millis(200),
        max_append_batch: 64,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn node_config(dir: &Path, node: NodeId, members: &[NodeId], topology: Topology) -> Config {
    let mut builder = Config::builder()
        .data_dir(dir)
        .node_id(node)
        .topology(topology)
        .timing(fast_timing())
        .retry(fast_retry())
        .checkpoint_interval(None);
    for &peer in members.iter().filter(|&&m| m != node) {
        builder = builder.peer(peer, format!("local-{}", peer));
    }
    builder.build()
}

fn open_engine(temp: &TempDir, node: NodeId, members: &[NodeId], topology: Topology) -> Arc<Engine> {
    let dir = temp.path().join(format!("node-{}", node));
    let config = node_config(&dir, node, members, topology);
    config.validate().unwrap();
    Arc::new(Engine::open(config).unwrap())
}

// =============================================================================
// Primary-Secondary Cluster
// =============================================================================

pub struct PrimaryCluster {
    pub nodes: Vec<Arc<PrimaryController>>,
    pub network: Arc<LocalNetwork>,
    members: Vec<NodeId>,
    topology: Topology,
    temp: TempDir,
}

impl PrimaryCluster {
    /// Start `size` nodes with ids `1..=size`
    pub fn start(size: u64, replication: ReplicationMode) -> Self {
        let temp = TempDir::new().unwrap();
        let network = LocalNetwork::new();
        let members: Vec<NodeId> = (1..=size).collect();
        let topology = Topology::PrimarySecondary { replication };

        let nodes: Vec<Arc<PrimaryController>> = members
            .iter()
            .map(|&id| {
                let engine = open_engine(&temp, id, &members, topology);
                let transport: Arc<dyn Transport> = Arc::new(network.transport(id, fast_retry()));
                let controller = PrimaryController::new(engine, transport).unwrap();
                let handler = Arc::downgrade(&controller) as Weak<dyn MessageHandler>;
                network.register(id, handler);
                controller
            })
            .collect();

        for node in &nodes {
            node.start().unwrap();
        }

        Self {
            nodes,
            network,
            members,
            topology,
            temp,
        }
    }

    /// Stop a node and bring it back on the same data dir, or on an empty
    /// one when `wipe` is set
    pub fn restart(&mut self, id: NodeId, wipe: bool) {
        let index = (id - 1) as usize;
        self.network.unregister(id);
        let old = self.nodes.remove(index);
        old.shutdown();
        assert!(wait_until(Duration::from_secs(5), || Arc::strong_count(&old) == 1));
        drop(old);

        if wipe {
            std::fs::remove_dir_all(self.temp.path().join(format!("node-{}", id))).unwrap();
        }
        let engine = open_engine(&self.temp, id, &self.members, self.topology);
        let transport: Arc<dyn Transport> = Arc::new(self.network.transport(id, fast_retry()));
        let controller = PrimaryController::new(engine, transport).unwrap();
        let handler = Arc::downgrade(&controller) as Weak<dyn MessageHandler>;
        self.network.register(id, handler);
        controller.start().unwrap();
        self.nodes.insert(index, controller);
    }

    pub fn node(&self, id: NodeId) -> &Arc<PrimaryController> {
        &self.nodes[(id - 1) as usize]
    }

    /// Wait for exactly one leader among the reachable nodes that everyone
    /// reachable agrees on
    pub fn await_leader(&self, timeout: Duration) -> Option<NodeId> {
        let mut found = None;
        let settled = wait_until(timeout, || {
            let reachable: Vec<_> = self
                .nodes
                .iter()
                .filter(|n| !self.network.is_isolated(n.node_id()))
                .collect();
            let leaders: Vec<NodeId> = reachable
                .iter()
                .filter(|n| n.is_leader())
                .map(|n| n.node_id())
                .collect();
            if leaders.len() != 1 {
                return false;
            }
            let leader = leaders[0];
            found = Some(leader);
            reachable.iter().all(|n| n.leader() == Some(leader))
        });
        if settled {
            found
        } else {
            None
        }
    }

    pub fn followers(&self, leader: NodeId) -> Vec<&Arc<PrimaryController>> {
        self.nodes.iter().filter(|n| n.node_id() != leader).collect()
    }
}

impl Drop for PrimaryCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

// =============================================================================
// Masterless Cluster
// =============================================================================

pub struct MasterlessCluster {
    pub nodes: Vec<Arc<MasterlessController>>,
    pub network: Arc<LocalNetwork>,
    _temp: TempDir,
}

impl MasterlessCluster {
    /// Build `size` nodes; anti-entropy only runs when a test asks for it
    pub fn new(size: u64, write_quorum: usize, read_quorum: usize, policy: ConflictPolicy) -> Self {
        let temp = TempDir::new().unwrap();
        let network = LocalNetwork::new();
        let members: Vec<NodeId> = (1..=size).collect();
        let topology = Topology::Masterless {
            write_quorum,
            read_quorum,
            write_mode: ReplicationMode::Synchronous,
            conflict_policy: policy,
        };

        let nodes = members
            .iter()
            .map(|&id| {
                let engine = open_engine(&temp, id, &members, topology);
                let transport: Arc<dyn Transport> = Arc::new(network.transport(id, fast_retry()));
                let controller = MasterlessController::new(engine, transport).unwrap();
                let handler = Arc::downgrade(&controller) as Weak<dyn MessageHandler>;
                network.register(id, handler);
                controller
            })
            .collect();

        Self {
            nodes,
            network,
            _temp: temp,
        }
    }

    pub fn node(&self, id: NodeId) -> &Arc<MasterlessController> {
        &self.nodes[(id - 1) as usize]
    }

    pub fn isolate(&self, node: NodeId) {
        self.network.isolate(node);
    }

    pub fn heal(&self, node: NodeId) {
        // Background fan-out retries aimed at the isolated node must finish
        // failing before it becomes reachable again
        thread::sleep(Duration::from_millis(100));
        self.network.heal(node);
    }
}

impl Drop for MasterlessCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
