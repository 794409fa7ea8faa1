//! WAL Writer
//!
//! Handles appending records to the active segment, rotating segments and
//! removing them again on truncation or discard.
//!
//! Every append is written, flushed and `sync_data`'d before it returns.
//! If any of those steps fails the segment is cut back to its previous
//! length so the next append starts on a frame boundary.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::error::{HarborError, Result};

use super::reader::SegmentReader;
use super::record::{NewRecord, Record};
use super::segment::{segment_path, sync_dir, SegmentHeader, SegmentMeta, SEGMENT_HEADER_SIZE};

/// Writes records to the WAL segments
pub struct WalWriter {
    dir: PathBuf,
    file: File,
    /// Retained segments, oldest first; the last one is active
    segments: Vec<SegmentMeta>,
    next_seq: u64,
    last_term: u64,
    segment_size_limit: u64,
}

impl WalWriter {
    /// Continue writing after recovery
    ///
    /// `segments` is what recovery kept; an empty list starts a fresh segment
    /// positioned after `next_seq - 1`.
    pub fn resume(
        dir: &Path,
        mut segments: Vec<SegmentMeta>,
        next_seq: u64,
        last_term: u64,
        segment_size_limit: u64,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;

        if segments.is_empty() {
            let header = SegmentHeader {
                prev_seq: next_seq.saturating_sub(1),
                prev_term: last_term,
            };
            segments.push(create_segment(dir, 1, header)?);
        }

        let active = segments
            .last()
            .ok_or_else(|| HarborError::WalWrite("no active segment".to_string()))?;
        let file = open_for_append(dir, active.index)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            segments,
            next_seq,
            last_term,
            segment_size_limit,
        })
    }

    /// Append a single record, assigning the next sequence number
    pub fn append(&mut self, record: NewRecord) -> Result<Record> {
        let mut records = self.append_batch(vec![record])?;
        records
            .pop()
            .ok_or_else(|| HarborError::WalWrite("empty append".to_string()))
    }

    /// Append several records as one write with one fsync
    ///
    /// The batch never straddles a segment boundary.
    pub fn append_batch(&mut self, batch: Vec<NewRecord>) -> Result<Vec<Record>> {
        let records: Vec<Record> = batch
            .into_iter()
            .zip(self.next_seq..)
            .map(|(record, seq)| record.into_record(seq))
            .collect();
        self.write_records(&records)?;
        Ok(records)
    }

    /// Append records that already carry their sequence numbers
    ///
    /// The first record must be exactly `last_seq + 1` and the rest must
    /// follow without gaps.
    pub fn append_exact(&mut self, records: &[Record]) -> Result<()> {
        for (record, expected) in records.iter().zip(self.next_seq..) {
            if record.seq != expected {
                return Err(HarborError::LogDivergence { seq: expected });
            }
        }
        self.write_records(records)
    }

    fn write_records(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.rotate_if_needed()?;

        let mut buf = BytesMut::new();
        let mut sizes = Vec::with_capacity(records.len());
        for record in records {
            let frame = record.encode()?;
            sizes.push(frame.len() as u64);
            buf.put_slice(&frame);
        }

        self.write_durable(&buf)?;

        let meta = self.active_mut()?;
        for (record, size) in records.iter().zip(sizes) {
            meta.record(record.seq, size);
        }
        if let Some(last) = records.last() {
            self.next_seq = last.seq + 1;
            self.last_term = last.term;
        }
        Ok(())
    }

    fn write_durable(&mut self, buf: &[u8]) -> Result<()> {
        let start = self.active()?.size;
        let outcome = self
            .file
            .write_all(buf)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data());

        if let Err(e) = outcome {
            if let Err(rollback) = self.file.set_len(start) {
                warn!("failed to roll back partial WAL write: {}", rollback);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> Result<()> {
        let active = self.active()?;
        if active.size < self.segment_size_limit || active.last_seq.is_none() {
            return Ok(());
        }

        let index = active.index + 1;
        let header = SegmentHeader {
            prev_seq: self.next_seq - 1,
            prev_term: self.last_term,
        };
        self.file.sync_all()?;
        let meta = create_segment(&self.dir, index, header)?;
        self.file = open_for_append(&self.dir, index)?;
        self.segments.push(meta);
        debug!(segment = index, "rotated WAL segment");
        Ok(())
    }

    /// Remove every record with a sequence number above `seq`
    ///
    /// Returns the term of the record at `seq`.
    pub fn truncate_after(&mut self, seq: u64) -> Result<u64> {
        if seq + 1 >= self.next_seq {
            return Ok(self.last_term);
        }

        while self.segments.len() > 1 {
            match self.segments.last() {
                Some(meta) if meta.header.prev_seq >= seq => {
                    fs::remove_file(segment_path(&self.dir, meta.index))?;
                    self.segments.pop();
                }
                _ => break,
            }
        }

        let meta = self.active()?.clone();
        if meta.header.prev_seq > seq {
            return Err(HarborError::WalWrite(format!(
                "cannot truncate to {}: log starts after {}",
                seq, meta.header.prev_seq
            )));
        }

        // Find the byte offset of the first record past `seq`.
        let path = segment_path(&self.dir, meta.index);
        let mut reader = SegmentReader::open(&path)?;
        let mut offset = SEGMENT_HEADER_SIZE;
        let mut first_seq = None;
        let mut last_seq = None;
        let mut term = meta.header.prev_term;
        while let Some(record) = reader.next_entry()? {
            if record.seq > seq {
                break;
            }
            first_seq.get_or_insert(record.seq);
            last_seq = Some(record.seq);
            term = record.term;
            offset = reader.position();
        }
        drop(reader);

        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        sync_dir(&self.dir)?;
        self.file = open_for_append(&self.dir, meta.index)?;

        let active = self.active_mut()?;
        active.size = offset;
        active.first_seq = first_seq;
        active.last_seq = last_seq;

        self.next_seq = seq + 1;
        self.last_term = term;
        Ok(term)
    }

    /// Delete sealed segments whose records are all at or below `seq`
    ///
    /// The active segment is never deleted. Returns the number removed.
    pub fn discard_through(&mut self, seq: u64) -> Result<usize> {
        let mut removed = 0;
        while self.segments.len() > 1 && self.segments[0].high_water() <= seq {
            let meta = self.segments.remove(0);
            fs::remove_file(segment_path(&self.dir, meta.index))?;
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.dir)?;
            debug!(removed, through = seq, "discarded WAL segments");
        }
        Ok(removed)
    }

    /// Sequence number the next append receives
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    /// Header of the oldest retained segment
    pub fn floor(&self) -> SegmentHeader {
        self.segments
            .first()
            .map(|meta| meta.header)
            .unwrap_or_default()
    }

    pub fn segments(&self) -> &[SegmentMeta] {
        &self.segments
    }

    /// Total bytes across retained segments
    pub fn size_bytes(&self) -> u64 {
        self.segments.iter().map(|meta| meta.size).sum()
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn active(&self) -> Result<&SegmentMeta> {
        self.segments
            .last()
            .ok_or_else(|| HarborError::WalWrite("no active segment".to_string()))
    }

    fn active_mut(&mut self) -> Result<&mut SegmentMeta> {
        self.segments
            .last_mut()
            .ok_or_else(|| HarborError::WalWrite("no active segment".to_string()))
    }
}

fn create_segment(dir: &Path, index: u64, header: SegmentHeader) -> Result<SegmentMeta> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(segment_path(dir, index))?;
    file.write_all(&header.encode())?;
    file.sync_all()?;
    sync_dir(dir)?;
    Ok(SegmentMeta::new(index, header))
}

fn open_for_append(dir: &Path, index: u64) -> Result<File> {
    Ok(OpenOptions::new()
        .append(true)
        .open(segment_path(dir, index))?)
}
