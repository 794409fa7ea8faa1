//! WAL Recovery
//!
//! Handles crash recovery by scanning the WAL, cutting torn tails and
//! filtering out bulk blocks that never completed.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{HarborError, Result};

use super::reader::SegmentReader;
use super::record::{Operation, Record};
use super::segment::{list_segments, segment_path, sync_dir, SegmentMeta};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of records kept in the log
    pub records_recovered: u64,

    /// Bulk blocks dropped because their end marker never made it to disk
    pub incomplete_blocks: u64,

    /// Last valid sequence number
    pub last_seq: u64,

    /// Whether the WAL was (or, when verifying, would be) truncated
    pub was_truncated: bool,

    /// Segments deleted because they followed the truncation point
    pub segments_removed: usize,
}

/// Everything recovery learned about the log
#[derive(Debug)]
pub struct Recovered {
    pub records: Vec<Record>,
    pub segments: Vec<SegmentMeta>,
    pub result: RecoveryResult,
}

/// Position where the valid log ends; offset 0 drops the whole segment
#[derive(Debug, Clone, Copy)]
struct Cut {
    pos: usize,
    offset: u64,
}

/// A bulk block whose end marker has not been seen yet
#[derive(Debug, Clone, Copy)]
struct OpenTail {
    pos: usize,
    offset: u64,
    records_len: usize,
    remaining: u32,
}

impl WalRecovery {
    /// Recover records from a WAL directory
    ///
    /// This will:
    /// 1. Read all valid records, segment by segment
    /// 2. Stop at the first torn, corrupted or out-of-sequence frame
    /// 3. Truncate the log there (and drop any later segments)
    /// 4. Cut an unfinished trailing bulk block back to its begin marker
    pub fn recover(dir: &Path) -> Result<Recovered> {
        let recovered = scan(dir, true)?;
        let result = &recovered.result;
        if result.records_recovered > 0 || result.was_truncated {
            info!(
                records = result.records_recovered,
                last_seq = result.last_seq,
                truncated = result.was_truncated,
                incomplete_blocks = result.incomplete_blocks,
                "WAL recovery finished"
            );
        }
        Ok(recovered)
    }

    /// Verify integrity of a WAL directory without modifying it
    pub fn verify(dir: &Path) -> Result<RecoveryResult> {
        Ok(scan(dir, false)?.result)
    }
}

fn scan(dir: &Path, repair: bool) -> Result<Recovered> {
    let indexes = list_segments(dir)?;
    let mut records: Vec<Record> = Vec::new();
    let mut metas: Vec<SegmentMeta> = Vec::new();
    let mut expected: Option<u64> = None;
    let mut cut: Option<Cut> = None;
    let mut tail: Option<OpenTail> = None;

    'segments: for (pos, &index) in indexes.iter().enumerate() {
        let path = segment_path(dir, index);
        let mut reader = match SegmentReader::open(&path) {
            Ok(reader) => reader,
            Err(HarborError::WalCorruption(reason)) => {
                warn!("segment {} unreadable: {}", index, reason);
                cut = Some(Cut { pos, offset: 0 });
                break;
            }
            Err(e) => return Err(e),
        };

        let header = reader.header();
        match expected {
            Some(next) if header.prev_seq + 1 != next => {
                warn!(
                    "segment {} starts after seq {}, expected {}",
                    index,
                    header.prev_seq,
                    next - 1
                );
                cut = Some(Cut { pos, offset: 0 });
                break;
            }
            Some(_) => {}
            None => expected = Some(header.prev_seq + 1),
        }

        let mut meta = SegmentMeta::new(index, header);
        loop {
            let offset = reader.position();
            match reader.next_entry() {
                Ok(Some(record)) => {
                    let want = expected.unwrap_or(1);
                    if record.seq != want {
                        warn!("out-of-sequence record {} (expected {})", record.seq, want);
                        cut = Some(Cut { pos, offset });
                        metas.push(meta);
                        break 'segments;
                    }
                    expected = Some(want + 1);

                    match &record.op {
                        Operation::BulkBegin { len } => {
                            tail = Some(OpenTail {
                                pos,
                                offset,
                                records_len: records.len(),
                                remaining: *len,
                            })
                        }
                        Operation::BulkEnd { .. } => tail = None,
                        op if op.is_data() => {
                            if let Some(open) = tail.as_mut() {
                                if open.remaining > 0 {
                                    open.remaining -= 1;
                                } else {
                                    tail = None;
                                }
                            }
                        }
                        _ => tail = None,
                    }

                    meta.record(record.seq, reader.position() - offset);
                    records.push(record);
                }
                Ok(None) => break,
                Err(HarborError::WalCorruption(reason)) => {
                    warn!("segment {} damaged at offset {}: {}", index, offset, reason);
                    cut = Some(Cut { pos, offset });
                    metas.push(meta);
                    break 'segments;
                }
                Err(e) => return Err(e),
            }
        }
        metas.push(meta);
    }

    let mut result = RecoveryResult::default();

    if let Some(open) = tail {
        warn!(
            "discarding incomplete bulk block starting at seq {}",
            records.get(open.records_len).map(|r| r.seq).unwrap_or_default()
        );
        result.incomplete_blocks = 1;
        records.truncate(open.records_len);
        cut = Some(Cut {
            pos: open.pos,
            offset: open.offset,
        });
    }

    if let Some(cut) = cut {
        result.was_truncated = true;
        let keep_through = records.last().map(|r| r.seq);

        metas.truncate(cut.pos + 1);
        if cut.offset == 0 {
            metas.truncate(cut.pos);
        } else if let Some(meta) = metas.get_mut(cut.pos) {
            meta.size = cut.offset;
            meta.last_seq = match (meta.first_seq, keep_through) {
                (Some(first), Some(keep)) if keep >= first => meta.last_seq.map(|l| l.min(keep)),
                _ => None,
            };
            if meta.last_seq.is_none() {
                meta.first_seq = None;
            }
        }

        let doomed_from = if cut.offset == 0 { cut.pos } else { cut.pos + 1 };
        result.segments_removed = indexes.len().saturating_sub(doomed_from);

        if repair {
            for &index in &indexes[doomed_from.min(indexes.len())..] {
                fs::remove_file(segment_path(dir, index))?;
            }
            if cut.offset > 0 {
                let file = OpenOptions::new()
                    .write(true)
                    .open(segment_path(dir, indexes[cut.pos]))?;
                file.set_len(cut.offset)?;
                file.sync_all()?;
            }
            sync_dir(dir)?;
        }
    }

    result.records_recovered = records.len() as u64;
    result.last_seq = records
        .last()
        .map(|r| r.seq)
        .or_else(|| metas.last().map(|m| m.header.prev_seq))
        .unwrap_or(0);

    Ok(Recovered {
        records,
        segments: metas,
        result,
    })
}

// =============================================================================
// Bulk block assembly
// =============================================================================

/// Groups bulk blocks so they are applied all-or-nothing
///
/// Feed records in sequence order; data records outside a block come back
/// immediately, records inside a block come back together once its end
/// marker arrives. A block interrupted by anything else is dropped.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    open: Option<OpenBlock>,
    discarded: u64,
}

#[derive(Debug)]
struct OpenBlock {
    begin_seq: u64,
    remaining: u32,
    records: Vec<Record>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the next record; returns the data records now safe to apply
    pub fn push(&mut self, record: Record) -> Vec<Record> {
        match &record.op {
            Operation::BulkBegin { len } => {
                self.drop_open();
                self.open = Some(OpenBlock {
                    begin_seq: record.seq,
                    remaining: *len,
                    records: Vec::with_capacity(*len as usize),
                });
                Vec::new()
            }
            Operation::BulkEnd { begin_seq } => match self.open.take() {
                Some(block) if block.begin_seq == *begin_seq && block.remaining == 0 => {
                    block.records
                }
                Some(block) => {
                    warn!("bulk block {} ended early, discarding", block.begin_seq);
                    self.discarded += 1;
                    Vec::new()
                }
                None => Vec::new(),
            },
            op if op.is_data() => match self.open.as_mut() {
                Some(block) if block.remaining > 0 => {
                    block.remaining -= 1;
                    block.records.push(record);
                    Vec::new()
                }
                Some(_) => {
                    self.drop_open();
                    vec![record]
                }
                None => vec![record],
            },
            _ => {
                self.drop_open();
                Vec::new()
            }
        }
    }

    /// Whether a block is waiting for its end marker
    pub fn has_open_block(&self) -> bool {
        self.open.is_some()
    }

    /// Number of blocks dropped so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Forget any partially received block
    pub fn reset(&mut self) {
        self.open = None;
    }

    fn drop_open(&mut self) {
        if let Some(block) = self.open.take() {
            warn!("bulk block {} never completed, discarding", block.begin_seq);
            self.discarded += 1;
        }
    }
}

/// Iterator adapter yielding only committed data records
pub struct BlockFilter<I> {
    inner: I,
    assembler: BlockAssembler,
    ready: VecDeque<Record>,
}

impl<I> BlockFilter<I>
where
    I: Iterator<Item = Result<Record>>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            assembler: BlockAssembler::new(),
            ready: VecDeque::new(),
        }
    }

    /// Blocks dropped so far
    pub fn discarded(&self) -> u64 {
        self.assembler.discarded()
    }
}

impl<I> Iterator for BlockFilter<I>
where
    I: Iterator<Item = Result<Record>>,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }
            match self.inner.next()? {
                Ok(record) => self.ready.extend(self.assembler.push(record)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
