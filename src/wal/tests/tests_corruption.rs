//! Corruption handling: replay must stop at the first bad record and
//! keep everything before it.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::wal::{Wal, WalError};

type ByteWal = Wal<Vec<u8>>;

#[test]
fn torn_tail_is_dropped_silently() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.wal");
    {
        let wal: ByteWal = Wal::open(&path).unwrap();
        wal.append(&b"first".to_vec()).unwrap();
        wal.append(&b"second".to_vec()).unwrap();
    }

    // Chop a few bytes off the end, simulating a crash mid-append.
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - 3).unwrap();

    let wal: ByteWal = Wal::open(&path).unwrap();
    assert_eq!(wal.replay().unwrap(), vec![b"first".to_vec()]);
}

#[test]
fn flipped_byte_stops_replay_at_bad_record() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.wal");
    let first_end;
    {
        let wal: ByteWal = Wal::open(&path).unwrap();
        wal.append(&b"aaaa".to_vec()).unwrap();
        first_end = std::fs::metadata(&path).unwrap().len();
        wal.append(&b"bbbb".to_vec()).unwrap();
        wal.append(&b"cccc".to_vec()).unwrap();
    }

    // Corrupt one payload byte of the second record.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(first_end + 5)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_all().unwrap();

    let wal: ByteWal = Wal::open(&path).unwrap();
    // Only the record before the corruption survives.
    assert_eq!(wal.replay().unwrap(), vec![b"aaaa".to_vec()]);
}

#[test]
fn corrupt_header_is_a_hard_error() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.wal");
    {
        let _wal: ByteWal = Wal::open(&path).unwrap();
    }

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(b"XXXX").unwrap();
    file.sync_all().unwrap();

    match ByteWal::open(&path) {
        Err(WalError::ChecksumMismatch) | Err(WalError::InvalidHeader(_)) => {}
        other => panic!("expected header failure, got {other:?}"),
    }
}
