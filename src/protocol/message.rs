//! Inter-node messages
//!
//! Every request gets exactly one reply message on the same connection.
//! Replication messages carry the sender's term (primary-secondary) or the
//! versions of the keys involved (masterless).

use serde::{Deserialize, Serialize};

use crate::cluster::{NodeId, Version, Versioned};
use crate::wal::Record;

use super::{Command, Response};

/// Frame kind byte for each message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    VoteRequest = 0x10,
    VoteResponse = 0x11,
    Heartbeat = 0x12,
    AppendEntries = 0x13,
    AppendAck = 0x14,
    WriteReplicate = 0x20,
    WriteAck = 0x21,
    ReadRequest = 0x22,
    ReadResponse = 0x23,
    AntiEntropyDigest = 0x24,
    AntiEntropyPull = 0x25,
    AntiEntropyEntries = 0x26,
    Client = 0x30,
    ClientReply = 0x31,
    Error = 0x3f,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let kind = match byte {
            0x10 => MessageKind::VoteRequest,
            0x11 => MessageKind::VoteResponse,
            0x12 => MessageKind::Heartbeat,
            0x13 => MessageKind::AppendEntries,
            0x14 => MessageKind::AppendAck,
            0x20 => MessageKind::WriteReplicate,
            0x21 => MessageKind::WriteAck,
            0x22 => MessageKind::ReadRequest,
            0x23 => MessageKind::ReadResponse,
            0x24 => MessageKind::AntiEntropyDigest,
            0x25 => MessageKind::AntiEntropyPull,
            0x26 => MessageKind::AntiEntropyEntries,
            0x30 => MessageKind::Client,
            0x31 => MessageKind::ClientReply,
            0x3f => MessageKind::Error,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // -------------------------------------------------------------------------
    // Primary-secondary
    // -------------------------------------------------------------------------
    VoteRequest {
        term: u64,
        candidate: NodeId,
        last_seq: u64,
        last_term: u64,
    },

    VoteResponse {
        term: u64,
        granted: bool,
    },

    /// AppendEntries without records, sent to caught-up followers
    Heartbeat {
        term: u64,
        leader: NodeId,
        prev_seq: u64,
        prev_term: u64,
        leader_commit: u64,
        compact_through: u64,
    },

    AppendEntries {
        term: u64,
        leader: NodeId,
        prev_seq: u64,
        prev_term: u64,
        records: Vec<Record>,
        leader_commit: u64,
        /// Followers may discard segments up to here
        compact_through: u64,
    },

    AppendAck {
        term: u64,
        success: bool,
        /// Highest seq known to match the leader's log
        match_seq: u64,
        /// On divergence, where the leader should resume
        conflict_hint: Option<u64>,
    },

    // -------------------------------------------------------------------------
    // Masterless
    // -------------------------------------------------------------------------
    WriteReplicate {
        from: NodeId,
        entries: Vec<Versioned>,
    },

    WriteAck {
        applied: usize,
    },

    ReadRequest {
        key: Vec<u8>,
    },

    ReadResponse {
        entry: Option<Versioned>,
    },

    AntiEntropyDigest {
        from: NodeId,
        digest: Vec<(Vec<u8>, Version)>,
    },

    AntiEntropyPull {
        keys: Vec<Vec<u8>>,
    },

    AntiEntropyEntries {
        entries: Vec<Versioned>,
    },

    // -------------------------------------------------------------------------
    // Client surface
    // -------------------------------------------------------------------------
    Client(Command),

    ClientReply(Response),

    Error {
        message: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::VoteRequest { .. } => MessageKind::VoteRequest,
            Message::VoteResponse { .. } => MessageKind::VoteResponse,
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::AppendEntries { .. } => MessageKind::AppendEntries,
            Message::AppendAck { .. } => MessageKind::AppendAck,
            Message::WriteReplicate { .. } => MessageKind::WriteReplicate,
            Message::WriteAck { .. } => MessageKind::WriteAck,
            Message::ReadRequest { .. } => MessageKind::ReadRequest,
            Message::ReadResponse { .. } => MessageKind::ReadResponse,
            Message::AntiEntropyDigest { .. } => MessageKind::AntiEntropyDigest,
            Message::AntiEntropyPull { .. } => MessageKind::AntiEntropyPull,
            Message::AntiEntropyEntries { .. } => MessageKind::AntiEntropyEntries,
            Message::Client(_) => MessageKind::Client,
            Message::ClientReply(_) => MessageKind::ClientReply,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Term carried by primary-secondary messages
    pub fn term(&self) -> Option<u64> {
        match self {
            Message::VoteRequest { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::Heartbeat { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendAck { term, .. } => Some(*term),
            _ => None,
        }
    }
}
