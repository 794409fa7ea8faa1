//! Tests for the WAL facade
//!
//! These tests verify:
//! - The in-memory record index (lookups, terms, ranges)
//! - Replicated appends and divergence detection
//! - Tail truncation
//! - Checkpoints and segment discard
//! - Reopening with a checkpoint in place

use std::fs;

use harborkv::cluster::Version;
use harborkv::error::HarborError;
use harborkv::memtable::KeyEntry;
use harborkv::storage::{Checkpoint, CHECKPOINT_FILE};
use harborkv::wal::{list_segments, NewRecord, Operation, Record, RecordArena, Wal, WAL_DIR};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const SMALL_SEGMENTS: u64 = 256;

fn set(term: u64, key: &str) -> NewRecord {
    NewRecord::new(
        term,
        0,
        Operation::Set {
            key: key.as_bytes().to_vec(),
            value: b"value".to_vec(),
        },
    )
}

fn shipped(seq: u64, term: u64) -> Record {
    Record {
        seq,
        term,
        timestamp: 0,
        op: Operation::Delete {
            key: format!("k{}", seq).into_bytes(),
        },
        version: None,
    }
}

fn checkpoint_at(wal: &Wal, through: u64) -> Checkpoint {
    let entries = vec![(
        b"snap".to_vec(),
        KeyEntry::live(b"shot".to_vec(), Version::default(), through),
    )];
    Checkpoint::new(through, wal.term_at(through).unwrap(), entries)
}

// =============================================================================
// Record Index Tests
// =============================================================================

#[test]
fn test_index_lookup_and_terms() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;
    wal.append(set(1, "a")).unwrap();
    wal.append(set(1, "b")).unwrap();
    wal.append(set(2, "c")).unwrap();

    assert_eq!(wal.first_seq(), 1);
    assert_eq!(wal.last_seq(), 3);
    assert_eq!(wal.last_term(), 2);
    assert_eq!(wal.term_at(0), Some(0));
    assert_eq!(wal.term_at(2), Some(1));
    assert_eq!(wal.term_at(3), Some(2));
    assert_eq!(wal.term_at(4), None);
    assert_eq!(wal.record(3).unwrap().op.key(), Some(&b"c"[..]));

    let tail = wal.records_from(2, 10).unwrap();
    assert_eq!(tail.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(wal.records_from(1, 1).unwrap().len(), 1);
    assert!(wal.records_from(4, 10).unwrap().is_empty());
}

#[test]
fn test_arena_floor_behaviour() {
    let mut arena = RecordArena::new(10, 3);
    assert_eq!(arena.first_seq(), 11);
    assert_eq!(arena.last_seq(), 10);
    assert_eq!(arena.term_at(10), Some(3));
    assert!(arena.records_from(10, 5).is_none());
    assert!(arena.is_empty());

    arena.push(shipped(11, 3));
    arena.push(shipped(12, 4));
    arena.push(shipped(13, 4));
    assert_eq!(arena.len(), 3);
    assert_eq!(arena.last_term(), 4);

    arena.discard_through(12);
    assert_eq!(arena.floor(), (12, 4));
    assert!(arena.get(11).is_none());
    assert_eq!(arena.get(13).unwrap().seq, 13);

    arena.truncate_after(12);
    assert!(arena.is_empty());
    assert_eq!(arena.last_seq(), 12);
}

#[test]
fn test_arena_skips_records_below_floor() {
    let records = (1..=5).map(|seq| shipped(seq, 1)).collect();
    let arena = RecordArena::from_records(3, 1, records);

    assert_eq!(arena.len(), 2);
    assert_eq!(arena.first_seq(), 4);
    assert!(arena.get(3).is_none());
}

// =============================================================================
// Replicated Append Tests
// =============================================================================

#[test]
fn test_append_replicated() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;

    let last = wal
        .append_replicated(&[shipped(1, 1), shipped(2, 1), shipped(3, 2)])
        .unwrap();

    assert_eq!(last, 3);
    assert_eq!(wal.last_term(), 2);
    assert_eq!(wal.record(2), Some(&shipped(2, 1)));
}

#[test]
fn test_append_replicated_rejects_gap() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;
    wal.append_replicated(&[shipped(1, 1)]).unwrap();

    let err = wal.append_replicated(&[shipped(3, 1)]).unwrap_err();

    assert!(matches!(err, HarborError::LogDivergence { seq: 2 }));
    assert_eq!(wal.last_seq(), 1);
}

#[test]
fn test_bulk_rejects_empty_block() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;

    assert!(wal.append_bulk(Vec::new()).is_err());
    assert_eq!(wal.last_seq(), 0);
}

// =============================================================================
// Truncation Tests
// =============================================================================

#[test]
fn test_truncate_after_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;
        for i in 0..6 {
            wal.append(set(1, &format!("k{}", i))).unwrap();
        }
        wal.truncate_after(4).unwrap();
        assert_eq!(wal.last_seq(), 4);
        assert!(wal.record(5).is_none());
    }

    let wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;
    assert_eq!(wal.last_seq(), 4);
}

#[test]
fn test_truncate_below_checkpoint_rejected() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;
    for i in 0..5 {
        wal.append(set(1, &format!("k{}", i))).unwrap();
    }
    let snapshot = checkpoint_at(&wal, 3);
    wal.checkpoint(&snapshot).unwrap();

    assert!(wal.truncate_after(2).is_err());
    assert!(wal.truncate_after(3).is_ok());
    assert_eq!(wal.last_seq(), 3);
}

// =============================================================================
// Checkpoint and Discard Tests
// =============================================================================

#[test]
fn test_discard_requires_checkpoint() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), SMALL_SEGMENTS).unwrap().wal;
    for i in 0..30 {
        wal.append(set(1, &format!("key{:03}", i))).unwrap();
    }
    assert!(wal.segment_count() > 1);

    // Nothing is covered by a checkpoint yet
    assert_eq!(wal.discard_through(30).unwrap(), 0);
    assert_eq!(wal.first_seq(), 1);
}

#[test]
fn test_checkpoint_then_discard() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), SMALL_SEGMENTS).unwrap().wal;
    for i in 0..30 {
        wal.append(set(1, &format!("key{:03}", i))).unwrap();
    }
    let before = wal.segment_count();
    let size_before = wal.size_bytes();

    let snapshot = checkpoint_at(&wal, 30);
    assert!(wal.checkpoint(&snapshot).unwrap() > 0);
    assert_eq!(wal.checkpoint_seq(), 30);
    assert!(temp.path().join(CHECKPOINT_FILE).exists());

    let removed = wal.discard_through(30).unwrap();

    assert_eq!(removed, before - 1);
    assert!(wal.size_bytes() < size_before);
    assert!(wal.first_seq() > 1);
    assert!(wal.records_from(1, 10).is_none());
    assert_eq!(
        list_segments(&temp.path().join(WAL_DIR)).unwrap().len(),
        wal.segment_count()
    );
}

#[test]
fn test_reopen_with_checkpoint() {
    let temp = TempDir::new().unwrap();
    let first_seq;
    {
        let mut wal = Wal::open(temp.path(), SMALL_SEGMENTS).unwrap().wal;
        for i in 0..30 {
            wal.append(set(1, &format!("key{:03}", i))).unwrap();
        }
        let snapshot = checkpoint_at(&wal, 25);
        wal.checkpoint(&snapshot).unwrap();
        wal.discard_through(25).unwrap();
        first_seq = wal.first_seq();
    }

    let opened = Wal::open(temp.path(), SMALL_SEGMENTS).unwrap();
    let checkpoint = opened.checkpoint.unwrap();
    assert_eq!(checkpoint.through_seq, 25);
    assert_eq!(checkpoint.entries.len(), 1);

    let wal = opened.wal;
    assert_eq!(wal.first_seq(), first_seq);
    assert_eq!(wal.last_seq(), 30);
    assert_eq!(wal.checkpoint_seq(), 25);
}

#[test]
fn test_checkpoint_past_log_end_restarts_log() {
    let temp = TempDir::new().unwrap();
    {
        let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;
        wal.append(set(1, "a")).unwrap();
    }
    let snapshot = Checkpoint::new(100, 4, Vec::new());
    snapshot.write(&temp.path().join(CHECKPOINT_FILE)).unwrap();

    let mut wal = Wal::open(temp.path(), 1 << 20).unwrap().wal;

    assert_eq!(wal.last_seq(), 100);
    assert_eq!(wal.last_term(), 4);
    assert_eq!(wal.append(set(4, "b")).unwrap().seq, 101);
}

#[test]
fn test_corrupt_checkpoint_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(CHECKPOINT_FILE);
    let snapshot = Checkpoint::new(
        7,
        1,
        vec![(
            b"k".to_vec(),
            KeyEntry::live(b"v".to_vec(), Version::default(), 7),
        )],
    );
    snapshot.write(&path).unwrap();
    assert_eq!(Checkpoint::load(&path).unwrap(), Some(snapshot));

    let mut bytes = fs::read(&path).unwrap();
    bytes[32] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let err = Checkpoint::load(&path).unwrap_err();
    assert!(matches!(err, HarborError::Storage(_)));
}
