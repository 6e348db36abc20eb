//! Tests for transactions
//!
//! These tests verify:
//! - Building and committing transactions
//! - Write application order and overlap semantics
//! - Read-your-own-writes composition
//! - State machine enforcement
//! - Journal bookkeeping after commit (immediate and linger)
//! - Concurrent commits through one and several handles

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use walfile::journal::{default_journal_dir, LogEntry, BROKEN_MARKER, FLAG_LINGER, MAX_OFFSET};
use walfile::{scan, Config, JournalError, JournaledFile, TxState};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_file(config: Config) -> (TempDir, PathBuf, JournaledFile) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    let file = JournaledFile::open(&path, config).unwrap();
    (temp, path, file)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Apply writes directly to a byte vector, like sequential pwrite calls
fn apply_direct(content: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if content.len() < offset + data.len() {
        content.resize(offset + data.len(), 0);
    }
    content[offset..offset + data.len()].copy_from_slice(data);
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_commit_single_write() {
    let (_temp, path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    tx.add_write(0, b"hello world".to_vec()).unwrap();
    assert_eq!(tx.state(), TxState::Building);

    let written = tx.commit().unwrap();
    assert_eq!(written, 11);
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(tx.id(), Some(1));
    assert_eq!(fs::read(&path).unwrap(), b"hello world");
}

#[test]
fn test_commit_retires_journal_immediately() {
    let (_temp, _path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    tx.add_write(0, b"data".to_vec()).unwrap();
    tx.commit().unwrap();

    assert!(!file.journal_dir().exists());
    assert_eq!(file.pending(), 0);
    assert_eq!(file.registry_count().unwrap(), 0);
}

#[test]
fn test_commit_multiple_writes_with_hole() {
    let (_temp, path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    tx.add_write(0, b"head".to_vec()).unwrap();
    tx.add_write(10, b"tail".to_vec()).unwrap();
    assert_eq!(tx.len(), 2);
    assert_eq!(tx.write_len(), 8);
    tx.commit().unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"head\0\0\0\0\0\0tail");
}

#[test]
fn test_overlapping_writes_match_sequential_writes() {
    let (_temp, path, file) = setup_file(Config::default());

    let x = 5000usize;
    let c4 = pattern(4000, 4);
    let c5 = pattern(3000, 5);

    let mut tx = file.new_transaction();
    tx.add_write(x as u64, c4.clone()).unwrap();
    tx.add_write((x - 2334) as u64, c5.clone()).unwrap();
    tx.commit().unwrap();

    let mut expected = Vec::new();
    apply_direct(&mut expected, x, &c4);
    apply_direct(&mut expected, x - 2334, &c5);

    let content = fs::read(&path).unwrap();
    assert_eq!(content, expected);
    // c5 wins on the overlap, the rest of c4 survives
    assert_eq!(&content[x - 2334..x - 2334 + 3000], &c5[..]);
    assert_eq!(&content[x - 2334 + 3000..x + 4000], &c4[3000 - 2334..]);
}

#[test]
fn test_commit_ids_increase_without_reuse_while_lingering() {
    let (_temp, _path, file) = setup_file(Config::builder().linger().build());

    let mut ids = Vec::new();
    for i in 0..3u64 {
        let mut tx = file.new_transaction();
        tx.add_write(i, vec![b'x']).unwrap();
        tx.commit().unwrap();
        ids.push(tx.id().unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(file.pending(), 3);
}

#[test]
fn test_lingering_entry_carries_linger_flag() {
    let (_temp, _path, file) = setup_file(Config::builder().linger().build());

    let mut tx = file.new_transaction();
    tx.add_write(0, b"abc".to_vec()).unwrap();
    tx.commit().unwrap();

    let bytes = fs::read(file.journal_dir().join("1")).unwrap();
    let entry = LogEntry::decode(&bytes).unwrap();
    assert_ne!(entry.header.flags & FLAG_LINGER, 0);
    assert_eq!(entry.ops.len(), 1);
    assert_eq!(&entry.ops[0].data[..], b"abc");
}

// =============================================================================
// Read Composition Tests
// =============================================================================

#[test]
fn test_read_sees_earlier_writes_only() {
    let (_temp, _path, file) = setup_file(Config::default());
    file.pwrite(b"0123456789", 0).unwrap();

    let mut tx = file.new_transaction();
    let before = tx.add_read(0, 10).unwrap();
    tx.add_write(2, b"AB".to_vec()).unwrap();
    let middle = tx.add_read(0, 10).unwrap();
    tx.add_write(3, b"xyz".to_vec()).unwrap();
    let after = tx.add_read(0, 10).unwrap();

    assert_eq!(tx.read(before), None);
    tx.commit().unwrap();

    assert_eq!(tx.read(before).unwrap(), b"0123456789");
    assert_eq!(tx.read(middle).unwrap(), b"01AB456789");
    assert_eq!(tx.read(after).unwrap(), b"01Axyz6789");
}

#[test]
fn test_read_past_end_of_file_is_short() {
    let (_temp, _path, file) = setup_file(Config::default());
    file.pwrite(b"abc", 0).unwrap();

    let mut tx = file.new_transaction();
    let slot = tx.add_read(1, 100).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.read(slot).unwrap(), b"bc");
}

#[test]
fn test_read_extends_to_written_end() {
    let (_temp, _path, file) = setup_file(Config::default());
    file.pwrite(b"abc", 0).unwrap();

    let mut tx = file.new_transaction();
    tx.add_write(6, b"zz".to_vec()).unwrap();
    let slot = tx.add_read(0, 100).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.read(slot).unwrap(), b"abc\0\0\0zz");
}

#[test]
fn test_reads_only_transaction_skips_journal() {
    let (_temp, _path, file) = setup_file(Config::default());
    file.pwrite(b"abc", 0).unwrap();

    let mut tx = file.new_transaction();
    let slot = tx.add_read(0, 3).unwrap();
    assert_eq!(tx.commit().unwrap(), 0);

    assert_eq!(tx.id(), None);
    assert_eq!(tx.read(slot).unwrap(), b"abc");
    assert!(!file.journal_dir().exists());
}

// =============================================================================
// State Machine Tests
// =============================================================================

#[test]
fn test_zero_length_write_rejected() {
    let (_temp, _path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    let err = tx.add_write(0, Vec::<u8>::new()).unwrap_err();
    assert!(matches!(err, JournalError::ZeroLengthWrite));
    assert!(tx.is_empty());
    assert_eq!(tx.state(), TxState::Building);
}

#[test]
fn test_write_past_file_limit_rejected() {
    let (_temp, path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    for offset in [u64::MAX - 16, MAX_OFFSET] {
        let err = tx.add_write(offset, b"x".to_vec()).unwrap_err();
        assert!(matches!(err, JournalError::OutOfRange { len: 1, .. }));
    }
    assert!(tx.is_empty());
    assert_eq!(tx.state(), TxState::Building);

    // Nothing was logged, so the journal stays usable
    tx.add_write(0, b"ok".to_vec()).unwrap();
    tx.commit().unwrap();
    assert!(!file.journal_dir().exists());

    assert!(matches!(
        file.pwrite(b"ok", u64::MAX - 1).unwrap_err(),
        JournalError::OutOfRange { .. }
    ));
    file.pwrite(b"OK", 0).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"OK");
}

#[test]
fn test_read_past_file_limit_rejected() {
    let (_temp, _path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    assert!(matches!(
        tx.add_read(u64::MAX - 1, 4).unwrap_err(),
        JournalError::OutOfRange { .. }
    ));
    assert!(tx.add_read(MAX_OFFSET, 0).is_ok());
}

#[test]
fn test_rejected_huge_write_leaves_reads_composable() {
    let (_temp, _path, file) = setup_file(Config::default());
    file.pwrite(b"base", 0).unwrap();

    let mut tx = file.new_transaction();
    assert!(tx.add_write(u64::MAX - 1, b"abcdef".to_vec()).is_err());
    tx.add_write(0, b"BA".to_vec()).unwrap();
    let slot = tx.add_read(0, 4).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.read(slot).unwrap(), b"BAse");
}

#[test]
fn test_pwritev_running_past_file_limit_writes_nothing() {
    let (_temp, _path, file) = setup_file(Config::default());

    let err = file.pwritev(&[b"a", b"b"], MAX_OFFSET - 1).unwrap_err();
    assert!(matches!(err, JournalError::OutOfRange { offset, .. } if offset == MAX_OFFSET));
    assert_eq!(file.len().unwrap(), 0);
    assert!(!file.journal_dir().exists());
}

#[test]
fn test_empty_transaction_rejected() {
    let (_temp, _path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    assert!(matches!(tx.commit().unwrap_err(), JournalError::EmptyTransaction));
    assert_eq!(tx.state(), TxState::Building);
}

#[test]
fn test_cannot_modify_or_recommit_committed_transaction() {
    let (_temp, _path, file) = setup_file(Config::default());

    let mut tx = file.new_transaction();
    tx.add_write(0, b"x".to_vec()).unwrap();
    tx.commit().unwrap();

    assert!(matches!(
        tx.add_write(1, b"y".to_vec()).unwrap_err(),
        JournalError::InvalidState { .. }
    ));
    assert!(matches!(
        tx.add_read(0, 1).unwrap_err(),
        JournalError::InvalidState { .. }
    ));
    assert!(matches!(
        tx.commit().unwrap_err(),
        JournalError::InvalidState { .. }
    ));
    assert_eq!(tx.state(), TxState::Committed);
}

#[test]
fn test_commit_without_undo_is_retired() {
    let (_temp, _path, file) = setup_file(Config::builder().undo(false).build());

    let mut tx = file.new_transaction();
    assert!(!tx.captures_undo());
    tx.add_write(0, b"x".to_vec()).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.state(), TxState::Retired);
}

// =============================================================================
// Handle Mode Tests
// =============================================================================

#[test]
fn test_read_only_handle_rejects_commit() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    fs::write(&path, b"frozen").unwrap();

    let file = JournaledFile::open(&path, Config::builder().read_only(true).build()).unwrap();
    let mut tx = file.new_transaction();
    tx.add_write(0, b"x".to_vec()).unwrap();

    assert!(matches!(tx.commit().unwrap_err(), JournalError::ReadOnly));
    assert_eq!(tx.state(), TxState::Building);

    let mut buf = [0u8; 6];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), 6);
    assert_eq!(&buf, b"frozen");
}

#[test]
fn test_open_missing_without_create() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("missing.bin");

    let result = JournaledFile::open(&path, Config::builder().create(false).build());
    assert!(matches!(result, Err(JournalError::NotFound(_))));
}

#[test]
fn test_broken_journal_blocks_commits_until_repaired() {
    let (_temp, path, file) = setup_file(Config::default());
    let journal = file.journal_dir();
    fs::create_dir_all(&journal).unwrap();
    fs::write(journal.join(BROKEN_MARKER), b"").unwrap();

    let mut tx = file.new_transaction();
    tx.add_write(0, b"blocked".to_vec()).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, JournalError::JournalBroken(_)));
    assert!(err.needs_recovery());

    scan(&path, None, true).unwrap();
    tx.commit().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"blocked");
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_commits_on_shared_handle() {
    let (_temp, path, file) = setup_file(Config::default());
    let file = Arc::new(file);

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let file = Arc::clone(&file);
            thread::spawn(move || {
                for i in 0..10u64 {
                    let mut tx = file.new_transaction();
                    tx.add_write(t * 100 + i * 10, vec![b'a' + t as u8; 10]).unwrap();
                    tx.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let content = fs::read(&path).unwrap();
    assert_eq!(content.len(), 800);
    for t in 0..8usize {
        assert!(content[t * 100..(t + 1) * 100]
            .iter()
            .all(|&b| b == b'a' + t as u8));
    }
    assert!(!file.journal_dir().exists());
}

#[test]
fn test_concurrent_commits_from_separate_handles() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    fs::write(&path, vec![0u8; 400]).unwrap();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let path = path.clone();
            thread::spawn(move || {
                let file = JournaledFile::open(&path, Config::default()).unwrap();
                for i in 0..25u64 {
                    file.pwrite(&[t as u8 + 1; 4], t * 100 + i * 4).unwrap();
                }
                file.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let content = fs::read(&path).unwrap();
    for t in 0..4usize {
        assert!(content[t * 100..(t + 1) * 100]
            .iter()
            .all(|&b| b == t as u8 + 1));
    }
    assert!(!default_journal_dir(&path).exists());
}
