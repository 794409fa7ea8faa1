//! WAL segment files
//!
//! The log is split into append-only segment files named by a monotonically
//! increasing index. Each segment starts with a fixed header recording the
//! position (seq, term) of the record just before its first one, so a
//! segment stays self-describing after older segments are discarded.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (22 bytes)                                            │
//! │   Magic "HKWL" (4) | Version u16 (2) | PrevSeq (8) | PrevTerm (8) │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Frame | Frame | ...                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{HarborError, Result};

/// Magic bytes identifying a HarborKV WAL segment
pub(crate) const SEGMENT_MAGIC: &[u8; 4] = b"HKWL";

/// Current segment format version
pub(crate) const SEGMENT_VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + PrevSeq (8) + PrevTerm (8)
pub const SEGMENT_HEADER_SIZE: u64 = 22;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Position of the record preceding a segment's first record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentHeader {
    pub prev_seq: u64,
    pub prev_term: u64,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[6..14].copy_from_slice(&self.prev_seq.to_le_bytes());
        buf[14..22].copy_from_slice(&self.prev_term.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SEGMENT_HEADER_SIZE as usize]) -> Result<Self> {
        if &buf[0..4] != SEGMENT_MAGIC {
            return Err(HarborError::WalCorruption(format!(
                "invalid segment magic: expected HKWL, got {:?}",
                &buf[0..4]
            )));
        }

        let mut version = [0u8; 2];
        version.copy_from_slice(&buf[4..6]);
        let version = u16::from_le_bytes(version);
        if version != SEGMENT_VERSION {
            return Err(HarborError::WalCorruption(format!(
                "unsupported segment version: {}",
                version
            )));
        }

        let mut prev_seq = [0u8; 8];
        prev_seq.copy_from_slice(&buf[6..14]);
        let mut prev_term = [0u8; 8];
        prev_term.copy_from_slice(&buf[14..22]);

        Ok(Self {
            prev_seq: u64::from_le_bytes(prev_seq),
            prev_term: u64::from_le_bytes(prev_term),
        })
    }
}

/// Bookkeeping for one segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub index: u64,
    pub header: SegmentHeader,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    /// File size in bytes, header included
    pub size: u64,
}

impl SegmentMeta {
    pub fn new(index: u64, header: SegmentHeader) -> Self {
        Self {
            index,
            header,
            first_seq: None,
            last_seq: None,
            size: SEGMENT_HEADER_SIZE,
        }
    }

    /// Highest sequence number covered by this segment
    pub fn high_water(&self) -> u64 {
        self.last_seq.unwrap_or(self.header.prev_seq)
    }

    pub fn contains(&self, seq: u64) -> bool {
        match (self.first_seq, self.last_seq) {
            (Some(first), Some(last)) => first <= seq && seq <= last,
            _ => false,
        }
    }

    pub(crate) fn record(&mut self, seq: u64, bytes: u64) {
        self.first_seq.get_or_insert(seq);
        self.last_seq = Some(seq);
        self.size += bytes;
    }
}

/// Path of segment `index` inside `dir`
pub fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{}{:020}{}", SEGMENT_PREFIX, index, SEGMENT_SUFFIX))
}

/// Parse the segment index from a file name like `wal-00000000000000000001.log`
pub fn parse_segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Segment indexes present in `dir`, ascending
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut indexes = Vec::new();
    if !dir.exists() {
        return Ok(indexes);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(index) = parse_segment_index(&path) {
                indexes.push(index);
            }
        }
    }

    indexes.sort_unstable();
    Ok(indexes)
}

/// Make directory entry changes (create/rename/remove) durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
