//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append records before any mutation becomes visible
//! - CRC32 checksums for corruption detection
//! - Sequence numbers for ordering (gap-free)
//! - Atomic bulk blocks (one buffer, one fsync)
//! - Segment rotation, discard behind checkpoints, tail truncation
//! - Crash recovery and replay
//!
//! ## File Format
//! ```text
//! {data_dir}/wal/wal-00000000000000000001.log
//! ┌─────────────────────────────────────────┐
//! │ Segment header (22 bytes)               │
//! ├─────────────────────────────────────────┤
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ Seq (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ Seq (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```

mod arena;
mod reader;
mod record;
mod recovery;
mod segment;
mod writer;

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{HarborError, Result};
use crate::storage::{Checkpoint, CHECKPOINT_FILE};

pub use arena::RecordArena;
pub use reader::{Replay, SegmentReader, WalReader};
pub use record::{NewRecord, Operation, Record, RecordKind, HEADER_SIZE, MAX_RECORD_SIZE};
pub use recovery::{BlockAssembler, BlockFilter, Recovered, RecoveryResult, WalRecovery};
pub use segment::{
    list_segments, segment_path, sync_dir, SegmentHeader, SegmentMeta, SEGMENT_HEADER_SIZE,
};
pub use writer::WalWriter;

/// Directory holding the segments, relative to the data directory
pub const WAL_DIR: &str = "wal";

/// Outcome of a bulk append
#[derive(Debug, Clone)]
pub struct BulkWrite {
    /// Sequence numbers of the whole block, markers included
    pub range: RangeInclusive<u64>,
    /// The data records inside the block
    pub records: Vec<Record>,
}

/// What opening a WAL found on disk
pub struct Opened {
    pub wal: Wal,
    pub checkpoint: Option<Checkpoint>,
    pub recovery: RecoveryResult,
}

/// The write-ahead log of one engine
pub struct Wal {
    dir: PathBuf,
    checkpoint_path: PathBuf,
    writer: WalWriter,
    arena: RecordArena,
    checkpoint_seq: u64,
}

impl Wal {
    /// Open the WAL under `data_dir`, recovering whatever is on disk
    pub fn open(data_dir: &Path, segment_size_limit: u64) -> Result<Opened> {
        let dir = data_dir.join(WAL_DIR);
        fs::create_dir_all(&dir)?;
        let checkpoint_path = data_dir.join(CHECKPOINT_FILE);

        let checkpoint = Checkpoint::load(&checkpoint_path)?;
        let (checkpoint_seq, checkpoint_term) = checkpoint
            .as_ref()
            .map(|c| (c.through_seq, c.term))
            .unwrap_or((0, 0));

        let Recovered {
            mut records,
            mut segments,
            result,
        } = WalRecovery::recover(&dir)?;

        let mut floor = segments
            .first()
            .map(|meta| meta.header)
            .unwrap_or(SegmentHeader {
                prev_seq: checkpoint_seq,
                prev_term: checkpoint_term,
            });
        let log_end = records.last().map(|r| r.seq).unwrap_or(floor.prev_seq);

        if checkpoint_seq > log_end {
            // The checkpoint already covers more than the log holds; restart
            // the log right after it.
            warn!(
                checkpoint_seq,
                log_end, "WAL ends before the checkpoint, starting a fresh log"
            );
            for meta in &segments {
                fs::remove_file(segment_path(&dir, meta.index))?;
            }
            sync_dir(&dir)?;
            segments.clear();
            records.clear();
            floor = SegmentHeader {
                prev_seq: checkpoint_seq,
                prev_term: checkpoint_term,
            };
        } else if floor.prev_seq > checkpoint_seq {
            return Err(HarborError::WalCorruption(format!(
                "log starts after seq {} but the checkpoint only covers {}",
                floor.prev_seq, checkpoint_seq
            )));
        }

        let last_seq = records.last().map(|r| r.seq).unwrap_or(floor.prev_seq);
        let last_term = records.last().map(|r| r.term).unwrap_or(floor.prev_term);
        let arena = RecordArena::from_records(floor.prev_seq, floor.prev_term, records);
        let writer = WalWriter::resume(&dir, segments, last_seq + 1, last_term, segment_size_limit)?;

        Ok(Opened {
            wal: Wal {
                dir,
                checkpoint_path,
                writer,
                arena,
                checkpoint_seq,
            },
            checkpoint,
            recovery: result,
        })
    }

    /// Append one record; durable when this returns
    pub fn append(&mut self, record: NewRecord) -> Result<Record> {
        let record = self.writer.append(record)?;
        self.arena.push(record.clone());
        Ok(record)
    }

    /// Append `ops` as one atomic block framed by begin/end markers
    pub fn append_bulk(&mut self, ops: Vec<NewRecord>) -> Result<BulkWrite> {
        let first = ops
            .first()
            .ok_or_else(|| HarborError::WalWrite("empty bulk block".to_string()))?;
        let (term, timestamp) = (first.term, first.timestamp);
        let len = u32::try_from(ops.len())
            .map_err(|_| HarborError::WalWrite("bulk block too large".to_string()))?;

        let begin_seq = self.writer.next_seq();
        let mut batch = Vec::with_capacity(ops.len() + 2);
        batch.push(NewRecord::new(term, timestamp, Operation::BulkBegin { len }));
        batch.extend(ops);
        batch.push(NewRecord::new(
            term,
            timestamp,
            Operation::BulkEnd { begin_seq },
        ));

        let written = self.writer.append_batch(batch)?;
        let end_seq = written.last().map(|r| r.seq).unwrap_or(begin_seq);
        for record in &written {
            self.arena.push(record.clone());
        }

        Ok(BulkWrite {
            range: begin_seq..=end_seq,
            records: written.into_iter().filter(|r| r.op.is_data()).collect(),
        })
    }

    /// Append records shipped by a leader, keeping their seq and term
    pub fn append_replicated(&mut self, records: &[Record]) -> Result<u64> {
        self.writer.append_exact(records)?;
        for record in records {
            self.arena.push(record.clone());
        }
        Ok(self.last_seq())
    }

    /// Iterate every durable record from disk, in order
    pub fn replay(&self) -> Result<Replay> {
        Ok(WalReader::open(&self.dir)?.entries())
    }

    /// Like `replay`, but with incomplete bulk blocks filtered out
    pub fn committed(&self) -> Result<BlockFilter<Replay>> {
        Ok(BlockFilter::new(self.replay()?))
    }

    /// Persist a checkpoint file; segments it covers become discardable
    pub fn checkpoint(&mut self, snapshot: &Checkpoint) -> Result<u64> {
        let bytes = snapshot.write(&self.checkpoint_path)?;
        self.checkpoint_seq = self.checkpoint_seq.max(snapshot.through_seq);
        Ok(bytes)
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Checkpoint::load(&self.checkpoint_path)
    }

    /// Delete segments fully covered by both `seq` and the last checkpoint
    pub fn discard_through(&mut self, seq: u64) -> Result<usize> {
        let limit = seq.min(self.checkpoint_seq);
        let removed = self.writer.discard_through(limit)?;
        if removed > 0 {
            self.arena.discard_through(self.writer.floor().prev_seq);
        }
        Ok(removed)
    }

    /// Remove every record above `seq`
    pub fn truncate_after(&mut self, seq: u64) -> Result<()> {
        if seq < self.checkpoint_seq {
            return Err(HarborError::WalWrite(format!(
                "cannot truncate to {}: checkpoint covers {}",
                seq, self.checkpoint_seq
            )));
        }
        self.writer.truncate_after(seq)?;
        self.arena.truncate_after(seq);
        Ok(())
    }

    pub fn last_seq(&self) -> u64 {
        self.writer.next_seq() - 1
    }

    pub fn last_term(&self) -> u64 {
        self.writer.last_term()
    }

    /// Oldest sequence number still in the log
    pub fn first_seq(&self) -> u64 {
        self.arena.first_seq()
    }

    pub fn term_at(&self, seq: u64) -> Option<u64> {
        self.arena.term_at(seq)
    }

    pub fn record(&self, seq: u64) -> Option<&Record> {
        self.arena.get(seq)
    }

    /// Up to `max` records from `seq` on; `None` if `seq` was discarded
    pub fn records_from(&self, seq: u64, max: usize) -> Option<Vec<Record>> {
        self.arena.records_from(seq, max)
    }

    pub fn checkpoint_seq(&self) -> u64 {
        self.checkpoint_seq
    }

    pub fn segment_count(&self) -> usize {
        self.writer.segments().len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.writer.size_bytes()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync()
    }
}
