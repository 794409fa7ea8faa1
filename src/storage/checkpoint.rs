//! Checkpoint file
//!
//! A full image of the key map as of `through_seq`. Written to a temp file,
//! fsynced, renamed over the previous checkpoint and the directory synced,
//! so a crash leaves either the old or the new checkpoint in place.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Header (30 bytes)                                                │
//! │   Magic "HKCP" (4) | Version u16 (2) | ThroughSeq u64 (8)        │
//! │   Term u64 (8) | Count u64 (8)                                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Entries                                                          │
//! │   [Len: u32][bincode(key, KeyEntry)]  ... repeated ...           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                                 │
//! │   DataCRC u32 (4) | Padding (4)                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{HarborError, Result};
use crate::memtable::KeyEntry;
use crate::wal::sync_dir;

/// File name of the checkpoint inside the data directory
pub const CHECKPOINT_FILE: &str = "checkpoint.snap";

/// Magic bytes identifying a HarborKV checkpoint
pub(crate) const MAGIC: &[u8; 4] = b"HKCP";

/// Current checkpoint format version
pub(crate) const VERSION: u16 = 1;

/// Magic (4) + Version (2) + ThroughSeq (8) + Term (8) + Count (8)
pub(crate) const HEADER_SIZE: usize = 30;

/// DataCRC (4) + Padding (4)
pub(crate) const FOOTER_SIZE: usize = 8;

/// Snapshot of the key map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    /// Every record up to and including this seq is reflected
    pub through_seq: u64,
    /// Term of the record at `through_seq`
    pub term: u64,
    /// Entries in key order
    pub entries: Vec<(Vec<u8>, KeyEntry)>,
}

impl Checkpoint {
    pub fn new(through_seq: u64, term: u64, entries: Vec<(Vec<u8>, KeyEntry)>) -> Self {
        Self {
            through_seq,
            term,
            entries,
        }
    }

    /// Atomically replace the checkpoint at `path`; returns the bytes written
    pub fn write(&self, path: &Path) -> Result<u64> {
        let tmp = path.with_extension("snap.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&self.through_seq.to_le_bytes())?;
        writer.write_all(&self.term.to_le_bytes())?;
        writer.write_all(&(self.entries.len() as u64).to_le_bytes())?;

        let mut hasher = crc32fast::Hasher::new();
        let mut written = HEADER_SIZE as u64;
        for entry in &self.entries {
            let payload = bincode::serialize(entry)?;
            let len = (payload.len() as u32).to_le_bytes();
            writer.write_all(&len)?;
            writer.write_all(&payload)?;
            hasher.update(&len);
            hasher.update(&payload);
            written += 4 + payload.len() as u64;
        }

        writer.write_all(&hasher.finalize().to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        written += FOOTER_SIZE as u64;

        let file = writer
            .into_inner()
            .map_err(|e| HarborError::Storage(format!("failed to flush checkpoint: {}", e)))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }

        debug!(
            through_seq = self.through_seq,
            entries = self.entries.len(),
            bytes = written,
            "checkpoint written"
        );
        Ok(written)
    }

    /// Load the checkpoint at `path`, `None` if there is none yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(HarborError::Storage(format!(
                "checkpoint {:?} too short: {} bytes",
                path,
                data.len()
            )));
        }
        if &data[0..4] != MAGIC {
            return Err(HarborError::Storage(format!(
                "invalid checkpoint magic: expected HKCP, got {:?}",
                &data[0..4]
            )));
        }

        let version = u16::from_le_bytes(read_array(&data, 4)?);
        if version != VERSION {
            return Err(HarborError::Storage(format!(
                "unsupported checkpoint version: {}",
                version
            )));
        }
        let through_seq = u64::from_le_bytes(read_array(&data, 6)?);
        let term = u64::from_le_bytes(read_array(&data, 14)?);
        let count = u64::from_le_bytes(read_array(&data, 22)?);

        let body_end = data.len() - FOOTER_SIZE;
        let stored_crc = u32::from_le_bytes(read_array(&data, body_end)?);
        let body = &data[HEADER_SIZE..body_end];
        let computed = crc32fast::hash(body);
        if computed != stored_crc {
            return Err(HarborError::Storage(format!(
                "checkpoint CRC mismatch: stored {:08x}, computed {:08x}",
                stored_crc, computed
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut pos = 0;
        while pos < body.len() {
            let len = u32::from_le_bytes(read_array(body, pos)?) as usize;
            pos += 4;
            let payload = body.get(pos..pos + len).ok_or_else(|| {
                HarborError::Storage("checkpoint entry runs past end of file".to_string())
            })?;
            entries.push(bincode::deserialize(payload)?);
            pos += len;
        }

        if entries.len() as u64 != count {
            return Err(HarborError::Storage(format!(
                "checkpoint holds {} entries, header says {}",
                entries.len(),
                count
            )));
        }

        Ok(Some(Self {
            through_seq,
            term,
            entries,
        }))
    }
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> Result<[u8; N]> {
    data.get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| HarborError::Storage("checkpoint truncated".to_string()))
}
