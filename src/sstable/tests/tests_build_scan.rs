//! Build-then-scan coverage: ordering, tombstone surfacing, bounds,
//! properties, and multi-block tables.

use tempfile::TempDir;

use crate::sstable::{
    PointEntry, RangeTombstone, SstRecord, SstWriter, Sstable, value_digest,
};

fn build(
    tmp: &TempDir,
    name: &str,
    points: Vec<PointEntry>,
    ranges: Vec<RangeTombstone>,
) -> Sstable {
    let path = tmp.path().join(name);
    SstWriter::new(&path)
        .build(points.into_iter(), ranges.into_iter(), false)
        .unwrap();
    Sstable::open(&path).unwrap()
}

fn collect(table: &Sstable) -> Vec<SstRecord> {
    table.scan_all().unwrap().map(|r| r.unwrap()).collect()
}

#[test]
fn empty_input_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("empty.sst");
    let result = SstWriter::new(&path).build(
        std::iter::empty::<PointEntry>(),
        std::iter::empty::<RangeTombstone>(),
        false,
    );
    assert!(result.is_err());
    assert!(!path.exists());
}

/// Writer inputs must be pre-sorted `(key ASC, seqno DESC)`; sort here
/// so test literals can stay in reading order.
fn sorted(mut points: Vec<PointEntry>) -> Vec<PointEntry> {
    points.sort_by(|a, b| a.key.cmp(&b.key).then(b.seqno.cmp(&a.seqno)));
    points
}

#[test]
fn scan_yields_sorted_records_with_tombstones() {
    let tmp = TempDir::new().unwrap();
    let table = build(
        &tmp,
        "t.sst",
        sorted(vec![
            PointEntry::put("apple", "red", 1),
            PointEntry::delete("banana", 4),
            PointEntry::put("banana", "yellow", 2),
            PointEntry::put("cherry", "dark", 3),
        ]),
        vec![],
    );

    let records = collect(&table);
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].key(), b"apple");
    // banana: tombstone (seqno 4) sorts before the older put (seqno 2).
    assert_eq!(records[1].key(), b"banana");
    assert!(matches!(records[1], SstRecord::Delete { seqno: 4, .. }));
    assert!(matches!(records[2], SstRecord::Put { seqno: 2, .. }));
    assert_eq!(records[3].key(), b"cherry");
}

#[test]
fn put_digests_match_value_digest() {
    let tmp = TempDir::new().unwrap();
    let table = build(
        &tmp,
        "t.sst",
        vec![PointEntry::put("k", "value-bytes", 9)],
        vec![],
    );
    let records = collect(&table);
    let SstRecord::Put { digest, value, .. } = &records[0] else {
        panic!("expected a put");
    };
    assert_eq!(*digest, value_digest(b"value-bytes"));
    assert_eq!(value.as_deref(), Some(b"value-bytes".as_slice()));
}

#[test]
fn range_tombstones_interleave_in_key_order() {
    let tmp = TempDir::new().unwrap();
    let table = build(
        &tmp,
        "t.sst",
        vec![
            PointEntry::put("a", "1", 1),
            PointEntry::put("m", "2", 2),
            PointEntry::put("z", "3", 3),
        ],
        vec![RangeTombstone::new("b", "n", 4)],
    );

    let records = collect(&table);
    let keys: Vec<&[u8]> = records.iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b", b"m", b"z"]);
    assert!(matches!(records[1], SstRecord::RangeDelete { seqno: 4, .. }));
}

#[test]
fn bounded_scan_respects_half_open_interval() {
    let tmp = TempDir::new().unwrap();
    let points: Vec<PointEntry> = (0..20)
        .map(|i| PointEntry::put(format!("key_{i:02}"), format!("v{i}"), i as u64 + 1))
        .collect();
    let table = build(&tmp, "t.sst", points, vec![]);

    let records: Vec<SstRecord> = table
        .scan(b"key_05", Some(b"key_10"))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    let keys: Vec<Vec<u8>> = records.iter().map(|r| r.key().to_vec()).collect();
    assert_eq!(
        keys,
        (5..10)
            .map(|i| format!("key_{i:02}").into_bytes())
            .collect::<Vec<_>>()
    );
}

#[test]
fn probe_returns_only_the_requested_key() {
    let tmp = TempDir::new().unwrap();
    let table = build(
        &tmp,
        "t.sst",
        vec![
            PointEntry::put("aa", "1", 1),
            PointEntry::put("ab", "2", 2),
            PointEntry::put("ac", "3", 3),
        ],
        vec![],
    );
    let records: Vec<SstRecord> = table.probe(b"ab").unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), b"ab");
}

#[test]
fn multi_block_table_scans_completely() {
    let tmp = TempDir::new().unwrap();
    // Values sized so the table spans many 4 KiB blocks.
    let points: Vec<PointEntry> = (0..500)
        .map(|i| PointEntry::put(format!("key_{i:05}"), "x".repeat(100), i as u64 + 1))
        .collect();
    let table = build(&tmp, "big.sst", points, vec![]);
    assert!(table.index.len() > 1, "expected multiple data blocks");

    let records = collect(&table);
    assert_eq!(records.len(), 500);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.key(), format!("key_{i:05}").as_bytes());
    }
}

#[test]
fn properties_reflect_contents() {
    let tmp = TempDir::new().unwrap();
    let table = build(
        &tmp,
        "t.sst",
        vec![
            PointEntry::put("aaa", "1", 3),
            PointEntry::delete("bbb", 7),
        ],
        vec![RangeTombstone::new("c", "d", 9)],
    );
    let props = &table.properties;
    assert_eq!(props.record_count, 2);
    assert_eq!(props.tombstone_count, 1);
    assert_eq!(props.range_tombstone_count, 1);
    assert_eq!(props.min_seqno, 3);
    assert_eq!(props.max_seqno, 9);
    assert_eq!(props.min_key, b"aaa".to_vec());
    assert_eq!(props.max_key, b"bbb".to_vec());
    assert!(!props.pruned);
}

#[test]
fn covers_key_and_range_covers() {
    let tmp = TempDir::new().unwrap();
    let table = build(
        &tmp,
        "t.sst",
        vec![PointEntry::put("m", "1", 1)],
        vec![RangeTombstone::new("p", "t", 2)],
    );
    assert!(table.covers_key(b"m"));
    assert!(!table.covers_key(b"a"));
    assert!(table.range_covers(b"q"));
    assert!(!table.range_covers(b"t")); // end is exclusive
    assert!(!table.range_covers(b"o"));
}
