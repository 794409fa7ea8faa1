//! Configuration for HarborKV
//!
//! Centralized configuration with sensible defaults. Everything here is
//! static: it is read once at node startup and never mutated at runtime.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::NodeId;
use crate::error::{HarborError, Result};

/// Main configuration for a HarborKV node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal/               (WAL segments, wal-NNN.log)
    ///     ├── checkpoint.snap    (latest checkpoint)
    ///     └── hard_state         (term + vote, primary-secondary only)
    pub data_dir: PathBuf,

    /// Rotate to a new WAL segment once the active one exceeds this (bytes)
    pub segment_size_limit: u64,

    /// Records kept behind a checkpoint before their segments may be
    /// discarded (standalone and masterless modes)
    pub wal_retention_records: u64,

    /// Period of the background checkpointer, `None` disables it
    pub checkpoint_interval: Option<Duration>,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Cluster Configuration
    // -------------------------------------------------------------------------
    pub cluster: ClusterConfig,

    pub timing: TimingConfig,

    pub retry: RetryPolicy,
}

/// Identity of this node and the static peer list
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub peers: Vec<PeerConfig>,
    pub topology: Topology,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: String,
}

/// Replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Single node, no replication
    Standalone,

    /// One elected leader, replicated followers
    PrimarySecondary { replication: ReplicationMode },

    /// Leaderless quorum replication
    Masterless {
        write_quorum: usize,
        read_quorum: usize,
        write_mode: ReplicationMode,
        conflict_policy: ConflictPolicy,
    },
}

/// When a replicated write is acknowledged to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// After the required quorum confirmed receipt
    Synchronous,

    /// After the local WAL append; replicas catch up in the background
    Asynchronous,
}

/// How concurrent masterless versions are handled on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Pick the version with the highest (timestamp, origin node id)
    LastWriterWins,

    /// Return every concurrent version to the caller
    Surface,
}

/// Timers driving elections, heartbeats and anti-entropy
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub anti_entropy_interval: Duration,
    /// Per-attempt I/O timeout for inter-node RPCs
    pub rpc_timeout: Duration,
    /// Maximum records shipped in one AppendEntries
    pub max_append_batch: usize,
}

/// Bounded exponential backoff for network retries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in either direction (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./harborkv_data"),
            segment_size_limit: 16 * 1024 * 1024, // 16 MB
            wal_retention_records: 10_000,
            checkpoint_interval: Some(Duration::from_secs(30)),
            listen_addr: "127.0.0.1:7001".to_string(),
            max_connections: 1024,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            cluster: ClusterConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            topology: Topology::Standalone,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            anti_entropy_interval: Duration::from_secs(5),
            rpc_timeout: Duration::from_millis(1000),
            max_append_batch: 512,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ClusterConfig {
    /// Number of nodes in the cluster, this one included
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Majority of the cluster
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn peer_addr(&self, id: NodeId) -> Option<&str> {
        self.peers.iter().find(|p| p.id == id).map(|p| p.addr.as_str())
    }
}

impl Topology {
    /// Tombstones are kept through checkpoints so anti-entropy can spread deletes
    pub fn retains_tombstones(&self) -> bool {
        matches!(self, Topology::Masterless { .. })
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject configurations that can never work
    pub fn validate(&self) -> Result<()> {
        let cluster = &self.cluster;

        let mut seen = BTreeSet::new();
        seen.insert(cluster.node_id);
        for peer in &cluster.peers {
            if !seen.insert(peer.id) {
                return Err(HarborError::Config(format!(
                    "duplicate node id {} in peer list",
                    peer.id
                )));
            }
        }

        if let Topology::Masterless {
            write_quorum,
            read_quorum,
            ..
        } = cluster.topology
        {
            let n = cluster.cluster_size();
            if write_quorum == 0 || write_quorum > n {
                return Err(HarborError::Config(format!(
                    "write quorum {} outside 1..={}",
                    write_quorum, n
                )));
            }
            if read_quorum == 0 || read_quorum > n {
                return Err(HarborError::Config(format!(
                    "read quorum {} outside 1..={}",
                    read_quorum, n
                )));
            }
            if write_quorum + read_quorum <= n {
                tracing::warn!(
                    w = write_quorum,
                    r = read_quorum,
                    n,
                    "W + R <= N: reads may miss the latest acknowledged write"
                );
            }
        }

        let timing = &self.timing;
        if timing.election_timeout_min >= timing.election_timeout_max {
            return Err(HarborError::Config(
                "election_timeout_min must be below election_timeout_max".to_string(),
            ));
        }
        if timing.heartbeat_interval >= timing.election_timeout_min {
            return Err(HarborError::Config(
                "heartbeat_interval must be below election_timeout_min".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarborError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL segment rotation threshold (in bytes)
    pub fn segment_size_limit(mut self, size: u64) -> Self {
        self.config.segment_size_limit = size;
        self
    }

    pub fn wal_retention_records(mut self, count: u64) -> Self {
        self.config.wal_retention_records = count;
        self
    }

    /// Set the background checkpoint period (`None` disables it)
    pub fn checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn node_id(mut self, id: NodeId) -> Self {
        self.config.cluster.node_id = id;
        self
    }

    /// Add a peer node
    pub fn peer(mut self, id: NodeId, addr: impl Into<String>) -> Self {
        self.config.cluster.peers.push(PeerConfig {
            id,
            addr: addr.into(),
        });
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.config.cluster.topology = topology;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
