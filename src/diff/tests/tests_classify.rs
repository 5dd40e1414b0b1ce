//! State-pair classification and event encoding.

use crate::diff::{DiffEvent, KeyState, classify};
use crate::encoding::{decode_from_slice, encode_to_vec};
use crate::sstable::value_digest;

#[test]
fn absent_to_present_is_added() {
    let d = value_digest(b"v");
    let event = classify(b"k", KeyState::Absent, KeyState::Present(d)).unwrap();
    assert_eq!(
        event,
        DiffEvent::Added {
            key: b"k".to_vec(),
            digest: d
        }
    );
}

#[test]
fn present_to_absent_is_deleted() {
    let d = value_digest(b"v");
    let event = classify(b"k", KeyState::Present(d), KeyState::Absent).unwrap();
    assert_eq!(
        event,
        DiffEvent::Deleted {
            key: b"k".to_vec(),
            digest: d
        }
    );
}

#[test]
fn differing_digests_are_modified() {
    let d1 = value_digest(b"old");
    let d2 = value_digest(b"new");
    let event = classify(b"k", KeyState::Present(d1), KeyState::Present(d2)).unwrap();
    assert_eq!(
        event,
        DiffEvent::Modified {
            key: b"k".to_vec(),
            old_digest: d1,
            new_digest: d2
        }
    );
}

#[test]
fn equal_digests_emit_nothing() {
    let d = value_digest(b"same");
    assert!(classify(b"k", KeyState::Present(d), KeyState::Present(d)).is_none());
}

#[test]
fn absent_both_sides_emits_nothing() {
    assert!(classify(b"k", KeyState::Absent, KeyState::Absent).is_none());
}

#[test]
fn events_round_trip_through_encoding() {
    let events = vec![
        DiffEvent::Added {
            key: b"a".to_vec(),
            digest: value_digest(b"1"),
        },
        DiffEvent::Deleted {
            key: b"b".to_vec(),
            digest: value_digest(b"2"),
        },
        DiffEvent::Modified {
            key: b"c".to_vec(),
            old_digest: value_digest(b"3"),
            new_digest: value_digest(b"4"),
        },
        DiffEvent::Renamed {
            key: b"new".to_vec(),
            previous_key: b"old".to_vec(),
            digest: value_digest(b"5"),
        },
    ];
    for event in events {
        let bytes = encode_to_vec(&event).unwrap();
        let (decoded, consumed) = decode_from_slice::<DiffEvent>(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(consumed, bytes.len());
    }
}
