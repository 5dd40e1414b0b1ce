//! Basic get/put/delete/scan/batch semantics.

use tempfile::TempDir;

use crate::metastore::{Batch, MetaStore};

#[test]
fn put_get_delete() {
    let tmp = TempDir::new().unwrap();
    let store = MetaStore::open(tmp.path()).unwrap();

    assert_eq!(store.get(b"job/1").unwrap(), None);
    store.put(b"job/1".to_vec(), b"record".to_vec()).unwrap();
    assert_eq!(store.get(b"job/1").unwrap(), Some(b"record".to_vec()));

    store.put(b"job/1".to_vec(), b"updated".to_vec()).unwrap();
    assert_eq!(store.get(b"job/1").unwrap(), Some(b"updated".to_vec()));

    store.delete(b"job/1".to_vec()).unwrap();
    assert_eq!(store.get(b"job/1").unwrap(), None);
}

#[test]
fn scan_prefix_is_sorted_and_scoped() {
    let tmp = TempDir::new().unwrap();
    let store = MetaStore::open(tmp.path()).unwrap();

    store.put(b"sn/\x02".to_vec(), b"b".to_vec()).unwrap();
    store.put(b"sn/\x01".to_vec(), b"a".to_vec()).unwrap();
    store.put(b"cr/\x01".to_vec(), b"x".to_vec()).unwrap();
    store.put(b"so/\x01".to_vec(), b"y".to_vec()).unwrap();

    let entries = store.scan_prefix(b"sn/").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, b"sn/\x01".to_vec());
    assert_eq!(entries[1].0, b"sn/\x02".to_vec());
}

#[test]
fn batch_applies_all_ops() {
    let tmp = TempDir::new().unwrap();
    let store = MetaStore::open(tmp.path()).unwrap();
    store.put(b"a".to_vec(), b"old".to_vec()).unwrap();

    let mut batch = Batch::new();
    batch
        .put(b"a".to_vec(), b"new".to_vec())
        .put(b"b".to_vec(), b"1".to_vec())
        .delete(b"missing".to_vec());
    store.apply_batch(batch).unwrap();

    assert_eq!(store.get(b"a").unwrap(), Some(b"new".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn empty_batch_is_noop() {
    let tmp = TempDir::new().unwrap();
    let store = MetaStore::open(tmp.path()).unwrap();
    store.apply_batch(Batch::new()).unwrap();
    assert!(store.is_empty().unwrap());
}
