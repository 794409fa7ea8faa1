//! WAL Reader
//!
//! Handles reading records from WAL segment files.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::error::{HarborError, Result};

use super::record::{FrameHeader, Record, HEADER_SIZE};
use super::segment::{list_segments, segment_path, SegmentHeader, SEGMENT_HEADER_SIZE};

/// Reads records from a single segment file
pub struct SegmentReader {
    reader: BufReader<File>,
    header: SegmentHeader,
    /// Offset just past the last successfully decoded frame
    position: u64,
}

impl SegmentReader {
    /// Open a segment and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        match read_full(&mut reader, &mut buf)? {
            n if n == buf.len() => {}
            n => {
                return Err(HarborError::WalCorruption(format!(
                    "segment {:?} has a truncated header ({} bytes)",
                    path, n
                )))
            }
        }
        let header = SegmentHeader::decode(&buf)?;

        Ok(Self {
            reader,
            header,
            position: SEGMENT_HEADER_SIZE,
        })
    }

    pub fn header(&self) -> SegmentHeader {
        self.header
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next record
    ///
    /// Returns `Ok(None)` at a clean end of file and `WalCorruption` for a
    /// torn or damaged frame.
    pub fn next_entry(&mut self) -> Result<Option<Record>> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => {
                return Err(HarborError::WalCorruption(format!(
                    "torn frame header at offset {} ({} of {} bytes)",
                    self.position, n, HEADER_SIZE
                )))
            }
            _ => {}
        }

        let frame = FrameHeader::parse(&header)?;
        let mut payload = vec![0u8; frame.len as usize];
        let read = read_full(&mut self.reader, &mut payload)?;
        if read < payload.len() {
            return Err(HarborError::WalCorruption(format!(
                "torn payload at offset {} ({} of {} bytes)",
                self.position,
                read,
                payload.len()
            )));
        }

        let record = frame.decode_payload(&payload)?;
        self.position += (HEADER_SIZE + payload.len()) as u64;
        Ok(Some(record))
    }
}

/// Reads records across all segments of a WAL directory, oldest first
pub struct WalReader {
    dir: PathBuf,
    pending: VecDeque<u64>,
    current: Option<SegmentReader>,
}

impl WalReader {
    /// Open a WAL directory for reading
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            pending: list_segments(dir)?.into(),
            current: None,
        })
    }

    /// Read the next record from the WAL
    pub fn next_entry(&mut self) -> Result<Option<Record>> {
        loop {
            if self.current.is_none() {
                let Some(index) = self.pending.pop_front() else {
                    return Ok(None);
                };
                self.current = Some(SegmentReader::open(&segment_path(&self.dir, index))?);
            }

            if let Some(reader) = self.current.as_mut() {
                match reader.next_entry()? {
                    Some(record) => return Ok(Some(record)),
                    None => self.current = None,
                }
            }
        }
    }

    /// Iterate over all valid records
    pub fn entries(self) -> Replay {
        Replay {
            reader: self,
            done: false,
        }
    }
}

/// Lazy iterator over WAL records
///
/// Stops quietly at a torn tail; I/O errors are yielded once and end the
/// iteration. Call `Wal::replay` again to restart from the beginning.
pub struct Replay {
    reader: WalReader,
    done: bool,
}

impl Iterator for Replay {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(HarborError::WalCorruption(reason)) => {
                tracing::debug!("replay stopped at damaged tail: {}", reason);
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the reader allows, returning the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
