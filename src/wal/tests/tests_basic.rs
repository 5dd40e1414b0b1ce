//! Append / replay / truncate behavior on an intact log.

use tempfile::TempDir;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestRecord {
    id: u64,
    payload: Vec<u8>,
}

impl Encode for TestRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.payload.encode_to(buf)
    }
}

impl Decode for TestRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (payload, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { id, payload }, offset))
    }
}

fn record(id: u64) -> TestRecord {
    TestRecord {
        id,
        payload: format!("payload-{id}").into_bytes(),
    }
}

#[test]
fn fresh_wal_replays_empty() {
    let tmp = TempDir::new().unwrap();
    let wal: Wal<TestRecord> = Wal::open(tmp.path().join("test.wal")).unwrap();
    assert!(wal.replay().unwrap().is_empty());
}

#[test]
fn append_then_replay() {
    let tmp = TempDir::new().unwrap();
    let wal: Wal<TestRecord> = Wal::open(tmp.path().join("test.wal")).unwrap();

    for id in 0..10 {
        wal.append(&record(id)).unwrap();
    }
    let replayed = wal.replay().unwrap();
    assert_eq!(replayed.len(), 10);
    for (id, rec) in replayed.iter().enumerate() {
        assert_eq!(*rec, record(id as u64));
    }
}

#[test]
fn replay_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.wal");
    {
        let wal: Wal<TestRecord> = Wal::open(&path).unwrap();
        wal.append(&record(1)).unwrap();
        wal.append(&record(2)).unwrap();
    }
    let wal: Wal<TestRecord> = Wal::open(&path).unwrap();
    assert_eq!(wal.replay().unwrap(), vec![record(1), record(2)]);
}

#[test]
fn append_after_replay_extends_log() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.wal");
    let wal: Wal<TestRecord> = Wal::open(&path).unwrap();
    wal.append(&record(1)).unwrap();
    let _ = wal.replay().unwrap();
    wal.append(&record(2)).unwrap();
    assert_eq!(wal.replay().unwrap(), vec![record(1), record(2)]);
}

#[test]
fn truncate_resets_to_header() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("test.wal");
    let wal: Wal<TestRecord> = Wal::open(&path).unwrap();
    for id in 0..5 {
        wal.append(&record(id)).unwrap();
    }
    wal.truncate().unwrap();
    assert!(wal.replay().unwrap().is_empty());

    // And the file remains appendable afterwards.
    wal.append(&record(99)).unwrap();
    assert_eq!(wal.replay().unwrap(), vec![record(99)]);
}
