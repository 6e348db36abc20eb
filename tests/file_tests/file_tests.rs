//! Tests for the JournaledFile façade
//!
//! These tests verify:
//! - Open flags (create, truncate)
//! - Cursor-based and offset-based reads and writes, including vectored ones
//! - Truncate, metadata and seek
//! - Journal sync, close and drop retiring lingering entries
//! - Journal relocation

use std::fs;
use std::io::SeekFrom;
use std::path::PathBuf;

use walfile::journal::default_journal_dir;
use walfile::{scan, Config, JournalError, JournaledFile};
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

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_creates_file_but_not_journal() {
    let (_temp, path, file) = setup_file(Config::default());
    assert!(path.exists());
    assert!(file.is_empty().unwrap());
    assert!(!file.journal_dir().exists());
    assert_eq!(file.journal_dir(), default_journal_dir(&path));
    assert_eq!(file.path(), path.as_path());
}

#[test]
fn test_open_truncate() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    fs::write(&path, b"old content").unwrap();

    let file = JournaledFile::open(&path, Config::builder().truncate(true).build()).unwrap();
    assert_eq!(file.len().unwrap(), 0);
}

#[test]
fn test_open_with_custom_journal_dir() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    let journal = temp.path().join("journal");

    let file = JournaledFile::open(&path, Config::builder().journal_dir(&journal).linger().build())
        .unwrap();
    file.pwrite(b"abc", 0).unwrap();

    assert!(journal.join("1").exists());
    assert!(!default_journal_dir(&path).exists());
}

#[test]
fn test_open_default() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    let file = JournaledFile::open_default(&path).unwrap();
    assert!(file.config().undo);
    assert!(!file.autosync_running());
}

// =============================================================================
// Cursor I/O Tests
// =============================================================================

#[test]
fn test_write_then_read_with_cursor() {
    let (_temp, path, mut file) = setup_file(Config::default());

    assert_eq!(file.write(b"hello ").unwrap(), 6);
    assert_eq!(file.write(b"world").unwrap(), 5);
    assert_eq!(file.position(), 11);
    assert_eq!(fs::read(&path).unwrap(), b"hello world");

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(file.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(file.position(), 5);
}

#[test]
fn test_read_at_end_of_file() {
    let (_temp, _path, mut file) = setup_file(Config::default());
    file.write(b"abc").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf).unwrap(), 0);

    file.seek(SeekFrom::Start(1)).unwrap();
    assert_eq!(file.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"bc");
}

#[test]
fn test_seek_variants() {
    let (_temp, _path, mut file) = setup_file(Config::default());
    file.pwrite(b"0123456789", 0).unwrap();

    assert_eq!(file.seek(SeekFrom::End(-3)).unwrap(), 7);
    assert_eq!(file.seek(SeekFrom::Current(2)).unwrap(), 9);
    assert_eq!(file.seek(SeekFrom::Current(-9)).unwrap(), 0);
    assert_eq!(file.seek(SeekFrom::End(5)).unwrap(), 15);

    let err = file.seek(SeekFrom::Current(-100)).unwrap_err();
    assert!(matches!(err, JournalError::Io(_)));
    assert_eq!(file.position(), 15);
}

#[test]
fn test_writev_and_readv() {
    let (_temp, path, mut file) = setup_file(Config::default());

    assert_eq!(file.writev(&[b"ab", b"", b"cde", b"f"]).unwrap(), 6);
    assert_eq!(fs::read(&path).unwrap(), b"abcdef");

    file.seek(SeekFrom::Start(1)).unwrap();
    let mut first = [0u8; 2];
    let mut second = [0u8; 4];
    let n = file.readv(&mut [&mut first[..], &mut second[..]]).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&first, b"bc");
    assert_eq!(&second, b"def\0");
}

#[test]
fn test_empty_writes_are_noops() {
    let (_temp, _path, mut file) = setup_file(Config::default());
    assert_eq!(file.write(b"").unwrap(), 0);
    assert_eq!(file.pwritev(&[b"", b""], 10).unwrap(), 0);
    assert_eq!(file.len().unwrap(), 0);
    assert!(!file.journal_dir().exists());
}

// =============================================================================
// Offset I/O Tests
// =============================================================================

#[test]
fn test_pwrite_pread_do_not_move_cursor() {
    let (_temp, _path, file) = setup_file(Config::default());

    file.pwrite(b"xyz", 100).unwrap();
    assert_eq!(file.position(), 0);
    assert_eq!(file.len().unwrap(), 103);

    let mut buf = [0xFFu8; 4];
    assert_eq!(file.pread(&mut buf, 99).unwrap(), 4);
    assert_eq!(&buf, b"\0xyz");
}

#[test]
fn test_pwritev_is_one_transaction() {
    let (_temp, _path, file) = setup_file(Config::builder().linger().build());

    file.pwritev(&[b"one", b"two", b"three"], 4).unwrap();
    assert_eq!(file.pending(), 1);

    let mut bufs = [[0u8; 3], [0u8; 3]];
    let [a, b] = &mut bufs;
    assert_eq!(file.preadv(&mut [&mut a[..], &mut b[..]], 4).unwrap(), 6);
    assert_eq!(&bufs[0], b"one");
    assert_eq!(&bufs[1], b"two");
}

#[test]
fn test_read_only_pwrite_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    fs::write(&path, b"ro").unwrap();

    let file = JournaledFile::open(&path, Config::builder().read_only(true).build()).unwrap();
    assert!(matches!(
        file.pwrite(b"x", 0).unwrap_err(),
        JournalError::ReadOnly
    ));
    assert!(matches!(
        file.truncate(0).unwrap_err(),
        JournalError::ReadOnly
    ));
    assert_eq!(fs::read(&path).unwrap(), b"ro");
}

// =============================================================================
// File Operation Tests
// =============================================================================

#[test]
fn test_truncate_and_metadata() {
    let (_temp, path, file) = setup_file(Config::default());
    file.pwrite(b"0123456789", 0).unwrap();

    file.truncate(4).unwrap();
    assert_eq!(file.metadata().unwrap().len(), 4);
    assert_eq!(fs::read(&path).unwrap(), b"0123");

    file.truncate(6).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"0123\0\0");
}

// =============================================================================
// Journal Sync Tests
// =============================================================================

#[test]
fn test_sync_retires_lingering_entries() {
    let (_temp, _path, file) = setup_file(Config::builder().linger().build());

    for i in 0..5u64 {
        file.pwrite(b"x", i).unwrap();
    }
    assert_eq!(file.pending(), 5);
    assert_eq!(file.registry_count().unwrap(), 5);

    assert_eq!(file.sync().unwrap(), 5);
    assert_eq!(file.pending(), 0);
    assert!(!file.journal_dir().exists());

    // Nothing left to do
    assert_eq!(file.sync().unwrap(), 0);
}

#[test]
fn test_close_retires_lingering_entries() {
    let (_temp, path, file) = setup_file(Config::builder().linger().build());
    file.pwrite(b"abc", 0).unwrap();

    file.close().unwrap();
    assert!(!default_journal_dir(&path).exists());
    assert_eq!(fs::read(&path).unwrap(), b"abc");
}

#[test]
fn test_drop_retires_lingering_entries() {
    let (_temp, path, file) = setup_file(Config::builder().linger().build());
    file.pwrite(b"abc", 0).unwrap();
    drop(file);

    assert!(!default_journal_dir(&path).exists());
}

// =============================================================================
// Journal Relocation Tests
// =============================================================================

#[test]
fn test_move_journal_retires_then_relocates() {
    let (temp, path, file) = setup_file(Config::builder().linger().build());
    file.pwrite(b"before", 0).unwrap();
    assert!(default_journal_dir(&path).exists());

    let new_dir = temp.path().join("moved.jio");
    file.move_journal(&new_dir).unwrap();
    assert_eq!(file.pending(), 0);
    assert_eq!(file.journal_dir(), new_dir);

    file.pwrite(b"after!", 6).unwrap();
    assert!(new_dir.join("1").exists());
    assert!(!default_journal_dir(&path).exists());

    let report = scan(&path, Some(new_dir.as_path()), false).unwrap();
    assert_eq!(report.in_progress, 1);

    file.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"beforeafter!");
}

#[test]
fn test_move_journal_with_live_directory() {
    let (temp, path, file) = setup_file(Config::default());

    // A stray leftover keeps the directory alive across the move
    let journal = file.journal_dir();
    fs::create_dir_all(&journal).unwrap();
    fs::write(journal.join("notes"), b"keep me").unwrap();

    let new_dir = temp.path().join("relocated");
    file.move_journal(&new_dir).unwrap();

    assert!(!journal.exists());
    assert_eq!(fs::read(new_dir.join("notes")).unwrap(), b"keep me");
    assert_eq!(scan(&path, Some(new_dir.as_path()), false).unwrap().invalid, 1);
}
