//! Lineage queries, persistence, degraded marks, and GC.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;

use crate::dag::CompactionDag;
use crate::metastore::MetaStore;

fn set(ids: &[u64]) -> HashSet<u64> {
    ids.iter().copied().collect()
}

fn open_dag(tmp: &TempDir) -> (Arc<MetaStore>, CompactionDag) {
    let meta = Arc::new(MetaStore::open(tmp.path().join("meta")).unwrap());
    let dag = CompactionDag::open(Arc::clone(&meta)).unwrap();
    (meta, dag)
}

#[test]
fn ancestors_and_descendants_are_transitive() {
    let tmp = TempDir::new().unwrap();
    let (_meta, dag) = open_dag(&tmp);

    // 1 + 2 → 3; 3 + 4 → 5
    dag.add_record(&[1, 2], &[3], 100).unwrap();
    dag.add_record(&[3, 4], &[5], 200).unwrap();

    assert_eq!(dag.descendants(1).unwrap(), set(&[3, 5]));
    assert_eq!(dag.descendants(4).unwrap(), set(&[5]));
    assert_eq!(dag.ancestors(5).unwrap(), set(&[1, 2, 3, 4]));
    assert_eq!(dag.ancestors(3).unwrap(), set(&[1, 2]));
    assert!(dag.descendants(5).unwrap().is_empty());
}

#[test]
fn duplicate_records_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let (_meta, dag) = open_dag(&tmp);
    dag.add_record(&[1], &[2], 100).unwrap();
    dag.add_record(&[1], &[2], 150).unwrap();
    assert_eq!(dag.record_count().unwrap(), 1);
}

#[test]
fn graph_rebuilds_from_meta_store() {
    let tmp = TempDir::new().unwrap();
    let meta = {
        let (meta, dag) = open_dag(&tmp);
        dag.add_record(&[1, 2], &[3], 100).unwrap();
        dag.add_record(&[3], &[4], 200).unwrap();
        dag.mark_degraded(2).unwrap();
        meta
    };

    let dag = CompactionDag::open(meta).unwrap();
    assert_eq!(dag.record_count().unwrap(), 2);
    assert_eq!(dag.ancestors(4).unwrap(), set(&[1, 2, 3]));
    assert!(dag.is_degraded(2).unwrap());
    assert!(!dag.is_degraded(1).unwrap());

    // The rebuilt sequence counter must not collide with old records.
    dag.add_record(&[4], &[5], 300).unwrap();
    assert_eq!(dag.record_count().unwrap(), 3);
}

#[test]
fn delta_files_collects_endpoint_differences_and_intermediates() {
    let tmp = TempDir::new().unwrap();
    let (_meta, dag) = open_dag(&tmp);

    // Snapshot A lives on {1, 2}; then 1+2 → 3, 3 → 4; snapshot B on {4, 9}.
    dag.add_record(&[1, 2], &[3], 100).unwrap();
    dag.add_record(&[3], &[4], 200).unwrap();

    let older = set(&[1, 2]);
    let newer = set(&[4, 9]);
    let delta = dag.delta_files(&older, &newer, |_| true).unwrap();

    assert_eq!(delta.from_only, vec![1, 2]);
    assert_eq!(delta.to_only, vec![4, 9]);
    assert_eq!(delta.intermediates, vec![3]);
}

#[test]
fn delta_files_skips_unreadable_intermediates() {
    let tmp = TempDir::new().unwrap();
    let (_meta, dag) = open_dag(&tmp);
    dag.add_record(&[1], &[2], 100).unwrap();
    dag.add_record(&[2], &[3], 200).unwrap();

    let delta = dag
        .delta_files(&set(&[1]), &set(&[3]), |id| id != 2)
        .unwrap();
    assert_eq!(delta.from_only, vec![1]);
    assert_eq!(delta.to_only, vec![3]);
    assert!(delta.intermediates.is_empty());
}

#[test]
fn gc_respects_horizon_and_pins() {
    let tmp = TempDir::new().unwrap();
    let (_meta, dag) = open_dag(&tmp);

    dag.add_record(&[1], &[2], 1_000).unwrap(); // old, unpinned
    dag.add_record(&[3], &[4], 1_000).unwrap(); // old, pinned via 4
    dag.add_record(&[5], &[6], 9_000).unwrap(); // recent

    let pinned = set(&[4]);
    let orphaned = dag.gc(10_000, 5_000, &pinned).unwrap();

    // Only the first record expired; its files are orphaned.
    assert_eq!(dag.record_count().unwrap(), 2);
    let orphaned: HashSet<u64> = orphaned.into_iter().collect();
    assert_eq!(orphaned, set(&[1, 2]));

    // Remaining lineage still answers queries.
    assert_eq!(dag.ancestors(4).unwrap(), set(&[3]));
    assert!(dag.ancestors(2).unwrap().is_empty());
}

#[test]
fn gc_persists_removals() {
    let tmp = TempDir::new().unwrap();
    let meta = {
        let (meta, dag) = open_dag(&tmp);
        dag.add_record(&[1], &[2], 1_000).unwrap();
        dag.gc(100_000, 1_000, &HashSet::new()).unwrap();
        meta
    };
    let dag = CompactionDag::open(meta).unwrap();
    assert_eq!(dag.record_count().unwrap(), 0);
}
