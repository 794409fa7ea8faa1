//! In-memory index of retained WAL records
//!
//! Records are immutable once appended, so the arena is a plain
//! seq-indexed deque. The floor is the position (seq, term) just below the
//! oldest retained record; it moves up when segments are discarded.

use std::collections::VecDeque;

use super::record::Record;

#[derive(Debug, Default)]
pub struct RecordArena {
    floor_seq: u64,
    floor_term: u64,
    records: VecDeque<Record>,
}

impl RecordArena {
    pub fn new(floor_seq: u64, floor_term: u64) -> Self {
        Self {
            floor_seq,
            floor_term,
            records: VecDeque::new(),
        }
    }

    /// Build from recovered records; `records` must continue from the floor
    pub fn from_records(floor_seq: u64, floor_term: u64, records: Vec<Record>) -> Self {
        let records: VecDeque<Record> = records
            .into_iter()
            .skip_while(|r| r.seq <= floor_seq)
            .collect();
        Self {
            floor_seq,
            floor_term,
            records,
        }
    }

    pub fn floor(&self) -> (u64, u64) {
        (self.floor_seq, self.floor_term)
    }

    /// Oldest sequence number still retained
    pub fn first_seq(&self) -> u64 {
        self.floor_seq + 1
    }

    pub fn last_seq(&self) -> u64 {
        self.records.back().map(|r| r.seq).unwrap_or(self.floor_seq)
    }

    pub fn last_term(&self) -> u64 {
        self.records.back().map(|r| r.term).unwrap_or(self.floor_term)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        debug_assert_eq!(record.seq, self.last_seq() + 1);
        self.records.push_back(record);
    }

    pub fn get(&self, seq: u64) -> Option<&Record> {
        if seq <= self.floor_seq {
            return None;
        }
        self.records.get((seq - self.floor_seq - 1) as usize)
    }

    /// Term of the record at `seq`; position 0 has term 0
    pub fn term_at(&self, seq: u64) -> Option<u64> {
        if seq == 0 {
            return Some(0);
        }
        if seq == self.floor_seq {
            return Some(self.floor_term);
        }
        self.get(seq).map(|r| r.term)
    }

    /// Up to `max` records starting at `seq`
    ///
    /// `None` when `seq` has already been discarded.
    pub fn records_from(&self, seq: u64, max: usize) -> Option<Vec<Record>> {
        if seq <= self.floor_seq {
            return None;
        }
        let start = (seq - self.floor_seq - 1) as usize;
        Some(self.records.iter().skip(start).take(max).cloned().collect())
    }

    /// Drop every record above `seq`
    pub fn truncate_after(&mut self, seq: u64) {
        let keep = seq.saturating_sub(self.floor_seq) as usize;
        self.records.truncate(keep);
    }

    /// Forget records up to and including `seq`
    pub fn discard_through(&mut self, seq: u64) {
        while let Some(front) = self.records.front() {
            if front.seq > seq {
                break;
            }
            self.floor_seq = front.seq;
            self.floor_term = front.term;
            self.records.pop_front();
        }
    }
}

