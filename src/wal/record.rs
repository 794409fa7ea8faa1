//! WAL Record definitions
//!
//! Defines the structure of individual WAL records and their on-disk frame.

use serde::{Deserialize, Serialize};

use crate::cluster::Version;
use crate::error::{HarborError, Result};

/// Frame header: Seq (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single record payload (64 MB)
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// A single record in the WAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Sequence number - monotonically increasing, gap-free within a WAL
    pub seq: u64,

    /// Leader term that produced the record (0 outside primary-secondary mode)
    pub term: u64,

    /// Logical timestamp from the node's hybrid clock
    pub timestamp: u64,

    /// The operation to perform
    pub op: Operation,

    /// Version attached by the masterless controller
    pub version: Option<Version>,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair
    Set { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key (tombstone)
    Delete { key: Vec<u8> },

    /// Opens an atomic block of `len` Set/Delete records
    BulkBegin { len: u32 },

    /// Closes the block opened at `begin_seq`
    BulkEnd { begin_seq: u64 },

    /// Everything up to `through_seq` is captured in the checkpoint file
    Checkpoint { through_seq: u64 },
}

/// Record kinds as exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Set,
    Delete,
    BulkSet,
    Checkpoint,
}

/// A record before the WAL assigns its sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub term: u64,
    pub timestamp: u64,
    pub op: Operation,
    pub version: Option<Version>,
}

impl NewRecord {
    pub fn new(term: u64, timestamp: u64, op: Operation) -> Self {
        Self {
            term,
            timestamp,
            op,
            version: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn into_record(self, seq: u64) -> Record {
        Record {
            seq,
            term: self.term,
            timestamp: self.timestamp,
            op: self.op,
            version: self.version,
        }
    }
}

impl Operation {
    /// Key touched by a data operation
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Operation::Set { key, .. } | Operation::Delete { key } => Some(key),
            _ => None,
        }
    }

    /// Whether the operation mutates the key space
    pub fn is_data(&self) -> bool {
        matches!(self, Operation::Set { .. } | Operation::Delete { .. })
    }
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self.op {
            Operation::Set { .. } => RecordKind::Set,
            Operation::Delete { .. } => RecordKind::Delete,
            Operation::BulkBegin { .. } | Operation::BulkEnd { .. } => RecordKind::BulkSet,
            Operation::Checkpoint { .. } => RecordKind::Checkpoint,
        }
    }

    /// Encode into an on-disk frame
    ///
    /// ```text
    /// ┌─────────┬─────────┬─────────┬──────────────────┐
    /// │ Seq (8) │ CRC (4) │ Len (4) │ bincode(Record)  │
    /// └─────────┴─────────┴─────────┴──────────────────┘
    /// ```
    /// The CRC covers the seq bytes and the payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_RECORD_SIZE as usize {
            return Err(HarborError::WalWrite(format!(
                "record of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }

        let seq_bytes = self.seq.to_le_bytes();
        let crc = checksum(&seq_bytes, &payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&seq_bytes);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a full frame (header + payload)
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_SIZE {
            return Err(HarborError::WalCorruption(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        let header = FrameHeader::parse(&frame[..HEADER_SIZE])?;
        let end = HEADER_SIZE + header.len as usize;
        if frame.len() < end {
            return Err(HarborError::WalCorruption(format!(
                "truncated payload: expected {} bytes, got {}",
                header.len,
                frame.len() - HEADER_SIZE
            )));
        }
        header.decode_payload(&frame[HEADER_SIZE..end])
    }
}

/// Parsed fixed-size frame header
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub seq: u64,
    pub crc: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let field = |range: std::ops::Range<usize>| -> Result<&[u8]> {
            bytes
                .get(range)
                .ok_or_else(|| HarborError::WalCorruption("short frame header".to_string()))
        };
        let seq = u64::from_le_bytes(to_array(field(0..8)?)?);
        let crc = u32::from_le_bytes(to_array(field(8..12)?)?);
        let len = u32::from_le_bytes(to_array(field(12..16)?)?);

        if len > MAX_RECORD_SIZE {
            return Err(HarborError::WalCorruption(format!(
                "record length {} exceeds limit",
                len
            )));
        }
        Ok(Self { seq, crc, len })
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<Record> {
        let computed = checksum(&self.seq.to_le_bytes(), payload);
        if computed != self.crc {
            return Err(HarborError::WalCorruption(format!(
                "CRC mismatch at seq {}: stored {:08x}, computed {:08x}",
                self.seq, self.crc, computed
            )));
        }

        let record: Record = bincode::deserialize(payload)
            .map_err(|e| HarborError::WalCorruption(format!("undecodable record: {}", e)))?;
        if record.seq != self.seq {
            return Err(HarborError::WalCorruption(format!(
                "frame seq {} does not match record seq {}",
                self.seq, record.seq
            )));
        }
        Ok(record)
    }
}

fn checksum(seq_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(seq_bytes);
    hasher.update(payload);
    hasher.finalize()
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| HarborError::WalCorruption("short frame header".to_string()))
}
