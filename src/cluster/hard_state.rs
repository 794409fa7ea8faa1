//! Durable election state
//!
//! The current term and the vote cast in it must survive restarts, or a
//! node could vote twice in one term.
//!
//! ## File Format
//! ```text
//! ┌──────────┬─────────┬─────────┬───────────────────┐
//! │ "HKHS"   │ Len (4) │ CRC (4) │ bincode(HardState)│
//! └──────────┴─────────┴─────────┴───────────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarborError, Result};
use crate::wal::sync_dir;

use super::NodeId;

pub const HARD_STATE_FILE: &str = "hard_state";

const MAGIC: &[u8; 4] = b"HKHS";
const PREFIX_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// The hard state of one node and the file backing it
#[derive(Debug)]
pub struct HardStateStore {
    path: PathBuf,
    current: HardState,
}

impl HardStateStore {
    /// Load from `data_dir`, starting at term 0 when no file exists
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(HARD_STATE_FILE);
        let current = if path.exists() {
            decode(&fs::read(&path)?)?
        } else {
            HardState::default()
        };
        Ok(Self { path, current })
    }

    pub fn get(&self) -> HardState {
        self.current
    }

    /// Persist `state`; durable when this returns
    pub fn save(&mut self, state: HardState) -> Result<()> {
        if state == self.current {
            return Ok(());
        }

        let payload = bincode::serialize(&state)?;
        let mut buf = Vec::with_capacity(PREFIX_SIZE + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        self.current = state;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<HardState> {
    if bytes.len() < PREFIX_SIZE || &bytes[..4] != MAGIC {
        return Err(HarborError::Storage("hard state: bad header".to_string()));
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let payload = bytes
        .get(PREFIX_SIZE..PREFIX_SIZE + len)
        .ok_or_else(|| HarborError::Storage("hard state: truncated".to_string()))?;
    if crc32fast::hash(payload) != crc {
        return Err(HarborError::Storage("hard state: checksum mismatch".to_string()));
    }
    bincode::deserialize(payload)
        .map_err(|e| HarborError::Storage(format!("hard state: {}", e)))
}
