//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean WAL
//! - Torn tails cut at every possible crash point
//! - Corruption in the middle of the log
//! - Incomplete bulk blocks being dropped
//! - Verification without modification
//! - Bulk block assembly for replicated records

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use harborkv::wal::{
    segment_path, BlockAssembler, BlockFilter, NewRecord, Operation, Record, Wal, WalRecovery,
    SEGMENT_HEADER_SIZE, WAL_DIR,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const LIMIT: u64 = 64 * 1024 * 1024;

fn set(key: &str, value: &str) -> NewRecord {
    NewRecord::new(
        1,
        0,
        Operation::Set {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        },
    )
}

fn record(seq: u64, op: Operation) -> Record {
    Record {
        seq,
        term: 1,
        timestamp: 0,
        op,
        version: None,
    }
}

fn data(seq: u64) -> Record {
    record(
        seq,
        Operation::Set {
            key: format!("k{}", seq).into_bytes(),
            value: b"v".to_vec(),
        },
    )
}

/// Write `count` single records into a fresh data directory
fn setup_wal(count: usize) -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().to_path_buf();
    let mut wal = Wal::open(&data_dir, LIMIT).unwrap().wal;
    for i in 0..count {
        wal.append(set(&format!("key{}", i), &format!("value{}", i)))
            .unwrap();
    }
    (temp, data_dir)
}

fn first_segment(data_dir: &Path) -> PathBuf {
    segment_path(&data_dir.join(WAL_DIR), 1)
}

/// Byte offsets where each frame of a segment ends
fn frame_ends(bytes: &[u8]) -> Vec<u64> {
    let mut ends = Vec::new();
    let mut pos = SEGMENT_HEADER_SIZE as usize;
    while pos + 16 <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[pos + 12],
            bytes[pos + 13],
            bytes[pos + 14],
            bytes[pos + 15],
        ]) as usize;
        pos += 16 + len;
        ends.push(pos as u64);
    }
    ends
}

fn truncate_file(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
}

// =============================================================================
// Clean Recovery Tests
// =============================================================================

#[test]
fn test_recover_clean_wal() {
    let (_temp, data_dir) = setup_wal(10);

    let recovered = WalRecovery::recover(&data_dir.join(WAL_DIR)).unwrap();

    assert_eq!(recovered.records.len(), 10);
    assert_eq!(recovered.result.records_recovered, 10);
    assert_eq!(recovered.result.last_seq, 10);
    assert!(!recovered.result.was_truncated);
    assert_eq!(recovered.result.incomplete_blocks, 0);
}

#[test]
fn test_recover_empty_directory() {
    let temp = TempDir::new().unwrap();
    let recovered = WalRecovery::recover(temp.path()).unwrap();

    assert!(recovered.records.is_empty());
    assert!(recovered.segments.is_empty());
    assert_eq!(recovered.result.last_seq, 0);
}

#[test]
fn test_reopen_continues_sequence() {
    let (_temp, data_dir) = setup_wal(5);

    let opened = Wal::open(&data_dir, LIMIT).unwrap();
    assert_eq!(opened.recovery.records_recovered, 5);

    let mut wal = opened.wal;
    assert_eq!(wal.last_seq(), 5);
    assert_eq!(wal.append(set("next", "one")).unwrap().seq, 6);
}

// =============================================================================
// Crash Point Tests
// =============================================================================

#[test]
fn test_torn_tail_at_every_offset() {
    let (_temp, data_dir) = setup_wal(5);
    let original = fs::read(first_segment(&data_dir)).unwrap();
    let ends = frame_ends(&original);
    assert_eq!(ends.len(), 5);

    for cut in 0..=original.len() {
        let crash = TempDir::new().unwrap();
        let wal_dir = crash.path().join(WAL_DIR);
        fs::create_dir_all(&wal_dir).unwrap();
        fs::write(segment_path(&wal_dir, 1), &original[..cut]).unwrap();

        let expected = ends.iter().filter(|&&end| end <= cut as u64).count() as u64;
        let opened = Wal::open(crash.path(), LIMIT).unwrap();
        assert_eq!(
            opened.recovery.records_recovered, expected,
            "crash after {} bytes",
            cut
        );

        let clean_cut = cut as u64 == SEGMENT_HEADER_SIZE || ends.contains(&(cut as u64));
        assert_eq!(opened.recovery.was_truncated, !clean_cut, "cut {}", cut);

        // The log is usable again right after the last intact record
        let mut wal = opened.wal;
        assert_eq!(wal.last_seq(), expected);
        assert_eq!(wal.append(set("post", "crash")).unwrap().seq, expected + 1);
    }
}

#[test]
fn test_truncation_is_persisted() {
    let (_temp, data_dir) = setup_wal(3);
    let path = first_segment(&data_dir);
    let size = fs::metadata(&path).unwrap().len();
    truncate_file(&path, size - 2);

    let ends = frame_ends(&fs::read(&path).unwrap());
    let recovered = WalRecovery::recover(&data_dir.join(WAL_DIR)).unwrap();

    assert!(recovered.result.was_truncated);
    assert_eq!(fs::metadata(&path).unwrap().len(), ends[1]);

    // A second pass finds nothing left to repair
    let again = WalRecovery::recover(&data_dir.join(WAL_DIR)).unwrap();
    assert!(!again.result.was_truncated);
    assert_eq!(again.records, recovered.records);
}

#[test]
fn test_corruption_mid_log() {
    let (_temp, data_dir) = setup_wal(6);
    let path = first_segment(&data_dir);
    let mut bytes = fs::read(&path).unwrap();
    let ends = frame_ends(&bytes);

    // Flip a payload byte of the fourth record
    let target = ends[3] as usize - 3;
    bytes[target] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let recovered = WalRecovery::recover(&data_dir.join(WAL_DIR)).unwrap();

    assert_eq!(recovered.result.records_recovered, 3);
    assert_eq!(recovered.result.last_seq, 3);
    assert!(recovered.result.was_truncated);
    assert_eq!(fs::metadata(&path).unwrap().len(), ends[2]);
}

#[test]
fn test_garbage_segment_removed() {
    let (_temp, data_dir) = setup_wal(2);
    let wal_dir = data_dir.join(WAL_DIR);
    fs::write(segment_path(&wal_dir, 2), b"garbage").unwrap();

    let recovered = WalRecovery::recover(&wal_dir).unwrap();

    assert_eq!(recovered.result.records_recovered, 2);
    assert_eq!(recovered.result.segments_removed, 1);
    assert!(!segment_path(&wal_dir, 2).exists());
}

// =============================================================================
// Bulk Block Tests
// =============================================================================

#[test]
fn test_complete_bulk_block_survives() {
    let temp = TempDir::new().unwrap();
    {
        let mut wal = Wal::open(temp.path(), LIMIT).unwrap().wal;
        wal.append(set("a", "1")).unwrap();
        let bulk = wal
            .append_bulk(vec![set("b", "2"), set("c", "3"), set("d", "4")])
            .unwrap();
        assert_eq!(bulk.range, 2..=6);
        assert_eq!(bulk.records.len(), 3);
    }

    let recovered = WalRecovery::recover(&temp.path().join(WAL_DIR)).unwrap();
    assert_eq!(recovered.result.records_recovered, 6);
    assert_eq!(recovered.result.incomplete_blocks, 0);
}

#[test]
fn test_incomplete_bulk_block_dropped_at_every_offset() {
    let temp = TempDir::new().unwrap();
    {
        let mut wal = Wal::open(temp.path(), LIMIT).unwrap().wal;
        wal.append(set("a", "1")).unwrap();
        wal.append_bulk(vec![set("b", "2"), set("c", "3"), set("d", "4")])
            .unwrap();
    }
    let original = fs::read(first_segment(temp.path())).unwrap();
    let ends = frame_ends(&original);
    assert_eq!(ends.len(), 6);

    // Every cut between the first record and the end marker loses the block
    for cut in ends[0]..ends[5] {
        let crash = TempDir::new().unwrap();
        let wal_dir = crash.path().join(WAL_DIR);
        fs::create_dir_all(&wal_dir).unwrap();
        fs::write(segment_path(&wal_dir, 1), &original[..cut as usize]).unwrap();

        let opened = Wal::open(crash.path(), LIMIT).unwrap();
        assert_eq!(opened.recovery.records_recovered, 1, "cut {}", cut);
        assert_eq!(opened.recovery.last_seq, 1);
        let wal_len = fs::metadata(segment_path(&wal_dir, 1)).unwrap().len();
        assert_eq!(wal_len, ends[0]);
        if cut > ends[1] {
            assert_eq!(opened.recovery.incomplete_blocks, 1, "cut {}", cut);
        }
    }
}

#[test]
fn test_committed_replay_skips_nothing_when_clean() {
    let temp = TempDir::new().unwrap();
    let mut wal = Wal::open(temp.path(), LIMIT).unwrap().wal;
    wal.append(set("a", "1")).unwrap();
    wal.append_bulk(vec![set("b", "2"), set("c", "3")]).unwrap();

    let committed: Vec<Record> = wal
        .committed()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let keys: Vec<&[u8]> = committed.iter().filter_map(|r| r.op.key()).collect();
    assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
}

// =============================================================================
// Verification Tests
// =============================================================================

#[test]
fn test_verify_does_not_modify() {
    let (_temp, data_dir) = setup_wal(4);
    let path = first_segment(&data_dir);
    let size = fs::metadata(&path).unwrap().len();
    truncate_file(&path, size - 5);

    let result = WalRecovery::verify(&data_dir.join(WAL_DIR)).unwrap();

    assert!(result.was_truncated);
    assert_eq!(result.records_recovered, 3);
    assert_eq!(fs::metadata(&path).unwrap().len(), size - 5);
}

#[test]
fn test_verify_clean_wal() {
    let (_temp, data_dir) = setup_wal(4);
    let result = WalRecovery::verify(&data_dir.join(WAL_DIR)).unwrap();

    assert!(!result.was_truncated);
    assert_eq!(result.last_seq, 4);
}

// =============================================================================
// Block Assembler Tests
// =============================================================================

#[test]
fn test_assembler_passes_plain_records() {
    let mut assembler = BlockAssembler::new();
    assert_eq!(assembler.push(data(1)), vec![data(1)]);
    assert!(!assembler.has_open_block());
}

#[test]
fn test_assembler_releases_block_on_end_marker() {
    let mut assembler = BlockAssembler::new();

    assert!(assembler
        .push(record(1, Operation::BulkBegin { len: 2 }))
        .is_empty());
    assert!(assembler.push(data(2)).is_empty());
    assert!(assembler.push(data(3)).is_empty());
    assert!(assembler.has_open_block());

    let released = assembler.push(record(4, Operation::BulkEnd { begin_seq: 1 }));
    assert_eq!(released, vec![data(2), data(3)]);
    assert!(!assembler.has_open_block());
}

#[test]
fn test_assembler_block_split_across_pushes() {
    // Replicated batches may end in the middle of a block
    let mut assembler = BlockAssembler::new();
    let first_batch = vec![data(1), record(2, Operation::BulkBegin { len: 2 }), data(3)];
    let second_batch = vec![data(4), record(5, Operation::BulkEnd { begin_seq: 2 }), data(6)];

    let mut applied = Vec::new();
    for r in first_batch {
        applied.extend(assembler.push(r));
    }
    assert_eq!(applied, vec![data(1)]);

    for r in second_batch {
        applied.extend(assembler.push(r));
    }
    assert_eq!(applied, vec![data(1), data(3), data(4), data(6)]);
}

#[test]
fn test_assembler_drops_interrupted_block() {
    let mut assembler = BlockAssembler::new();
    assembler.push(record(1, Operation::BulkBegin { len: 3 }));
    assembler.push(data(2));

    // A new block begins before the first one ended
    assembler.push(record(3, Operation::BulkBegin { len: 1 }));
    assembler.push(data(4));
    let released = assembler.push(record(5, Operation::BulkEnd { begin_seq: 3 }));

    assert_eq!(released, vec![data(4)]);
    assert_eq!(assembler.discarded(), 1);
}

#[test]
fn test_assembler_drops_short_block() {
    let mut assembler = BlockAssembler::new();
    assembler.push(record(1, Operation::BulkBegin { len: 3 }));
    assembler.push(data(2));

    let released = assembler.push(record(3, Operation::BulkEnd { begin_seq: 1 }));

    assert!(released.is_empty());
    assert_eq!(assembler.discarded(), 1);
}

#[test]
fn test_assembler_reset_forgets_open_block() {
    let mut assembler = BlockAssembler::new();
    assembler.push(record(1, Operation::BulkBegin { len: 1 }));
    assembler.reset();

    assert!(!assembler.has_open_block());
    assert_eq!(assembler.push(data(5)), vec![data(5)]);
}

#[test]
fn test_block_filter_over_iterator() {
    let records = vec![
        Ok(data(1)),
        Ok(record(2, Operation::BulkBegin { len: 1 })),
        Ok(data(3)),
        Ok(record(4, Operation::BulkEnd { begin_seq: 2 })),
        Ok(record(5, Operation::BulkBegin { len: 2 })),
        Ok(data(6)),
    ];

    let mut filter = BlockFilter::new(records.into_iter());
    let mut seqs = Vec::new();
    for record in filter.by_ref() {
        seqs.push(record.unwrap().seq);
    }

    assert_eq!(seqs, vec![1, 3]);
    assert_eq!(filter.discarded(), 0);
}
