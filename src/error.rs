//! Error types for HarborKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::cluster::{NodeId, Versioned};

/// Result type alias using HarborError
pub type Result<T> = std::result::Result<T, HarborError>;

/// Unified error type for HarborKV operations
#[derive(Debug, Error)]
pub enum HarborError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    /// A WAL write, flush or fsync failed. Fatal to the in-flight operation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    /// Follower log conflicts with the leader at `seq`
    #[error("log divergence at sequence {seq}")]
    LogDivergence { seq: u64 },

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found")]
    KeyNotFound,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("request to node {node} timed out")]
    Timeout { node: NodeId },

    #[error("node {node} unreachable after {attempts} attempts")]
    Unreachable { node: NodeId, attempts: u32 },

    // -------------------------------------------------------------------------
    // Replication Errors
    // -------------------------------------------------------------------------
    #[error("quorum unavailable: {acked} of {required} required acknowledgements")]
    QuorumUnavailable { required: usize, acked: usize },

    /// A higher term was observed; the local leadership is void
    #[error("stale leader: local term {term}, observed term {observed}")]
    StaleLeader { term: u64, observed: u64 },

    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("{} concurrent versions need reconciliation", siblings.len())]
    ConcurrentWriteConflict { siblings: Vec<Versioned> },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("node is shutting down")]
    Shutdown,
}

impl From<bincode::Error> for HarborError {
    fn from(e: bincode::Error) -> Self {
        HarborError::Serialization(e.to_string())
    }
}

impl HarborError {
    /// Whether a transport-level retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            HarborError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            HarborError::Network(_) | HarborError::Timeout { .. } => true,
            _ => false,
        }
    }
}
