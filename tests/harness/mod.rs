//! A miniature LSM host for driving the engine end to end.
//!
//! [`MiniLsm`] implements the [`LsmHost`] trait over real SST files
//! written with the crate's own `SstWriter`. It keeps an authoritative
//! `key → value` view of the namespace alongside the file-level state,
//! so the full-scan fallback (and every test assertion) has a perfect
//! oracle to compare against.
//!
//! Compactions can run **with** the engine's listener (normal
//! operation: inputs preserved, lineage recorded) or **silently**
//! (simulating lineage that was never captured or has been pruned — the
//! fallback trigger).

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use snapdiff::host::{HostError, LsmHost, SnapshotIter};
use snapdiff::listener::CompactionListener;
use snapdiff::sstable::{PointEntry, RangeTombstone, SstRecord, SstWriter, Sstable, value_digest};

/// One frozen snapshot view: its visible sequence plus the full
/// namespace at capture time.
struct SnapView {
    sequence: u64,
    view: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Default)]
struct MemTable {
    points: Vec<PointEntry>,
    ranges: Vec<RangeTombstone>,
}

struct Inner {
    live: BTreeMap<u64, PathBuf>,
    views: HashMap<u64, SnapView>,
    mem: MemTable,
    current: BTreeMap<Vec<u8>, Vec<u8>>,
    next_file_id: u64,
    last_seq: u64,
}

/// The test host.
pub struct MiniLsm {
    dir: PathBuf,
    inner: Mutex<Inner>,
    /// Per-item delay injected into snapshot iterators, for
    /// cancellation and timeout tests.
    iter_delay: Option<Duration>,
}

impl MiniLsm {
    pub fn new(dir: impl AsRef<Path>) -> Arc<Self> {
        Self::with_iter_delay(dir, None)
    }

    pub fn with_iter_delay(dir: impl AsRef<Path>, iter_delay: Option<Duration>) -> Arc<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(Self {
            dir,
            inner: Mutex::new(Inner {
                live: BTreeMap::new(),
                views: HashMap::new(),
                mem: MemTable::default(),
                current: BTreeMap::new(),
                next_file_id: 1,
                last_seq: 0,
            }),
            iter_delay,
        })
    }

    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let (key, value) = (key.into(), value.into());
        let mut inner = self.inner.lock().unwrap();
        inner.last_seq += 1;
        let seq = inner.last_seq;
        inner
            .mem
            .points
            .push(PointEntry::put(key.clone(), value.clone(), seq));
        inner.current.insert(key, value);
    }

    pub fn delete(&self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();
        inner.last_seq += 1;
        let seq = inner.last_seq;
        inner.mem.points.push(PointEntry::delete(key.clone(), seq));
        inner.current.remove(&key);
    }

    pub fn delete_range(&self, start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) {
        let (start, end) = (start.into(), end.into());
        let mut inner = self.inner.lock().unwrap();
        inner.last_seq += 1;
        let seq = inner.last_seq;
        inner
            .mem
            .ranges
            .push(RangeTombstone::new(start.clone(), end.clone(), seq));
        let doomed: Vec<Vec<u8>> = inner
            .current
            .range(start..end)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.current.remove(&key);
        }
    }

    /// Flush the memtable to a fresh SST. Returns the new file id, or
    /// `None` when there was nothing to flush.
    pub fn flush(&self) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mem.points.is_empty() && inner.mem.ranges.is_empty() {
            return None;
        }
        let file_id = inner.next_file_id;
        inner.next_file_id += 1;

        let mem = std::mem::take(&mut inner.mem);
        let mut points = mem.points;
        points.sort_by(|a, b| a.key.cmp(&b.key).then(b.seqno.cmp(&a.seqno)));
        let mut ranges = mem.ranges;
        ranges.sort_by(|a, b| a.start.cmp(&b.start));

        let path = self.dir.join(format!("{file_id:06}.sst"));
        SstWriter::new(&path)
            .build(points.into_iter(), ranges.into_iter(), false)
            .unwrap();
        inner.live.insert(file_id, path);
        Some(file_id)
    }

    /// Major-compact every live SST into one, applying and dropping
    /// tombstones, notifying `listener` around the swap the way a real
    /// host would (begin before the inputs are deleted).
    pub fn compact_all(&self, listener: Option<&CompactionListener>) -> Option<u64> {
        // Phase 1: pick inputs without holding the lock across the
        // listener callback (the callback takes the engine event lock).
        let inputs: Vec<(u64, PathBuf)> = {
            let inner = self.inner.lock().unwrap();
            inner.live.iter().map(|(&id, p)| (id, p.clone())).collect()
        };
        if inputs.len() < 2 {
            return None;
        }
        let input_ids: Vec<u64> = inputs.iter().map(|(id, _)| *id).collect();

        if let Some(listener) = listener {
            listener.on_compaction_begin(&input_ids);
        }

        // Merge: newest version per key wins; range tombstones apply to
        // older covered puts; every tombstone is dropped (this is a
        // full-set merge, nothing can resurrect).
        let mut records: Vec<SstRecord> = Vec::new();
        for (_, path) in &inputs {
            let table = Sstable::open(path).unwrap();
            records.extend(table.scan_all().unwrap().map(|r| r.unwrap()));
        }
        records.sort();

        let mut ranges: Vec<(Vec<u8>, Vec<u8>, u64)> = Vec::new();
        for record in &records {
            if let SstRecord::RangeDelete { start, end, seqno } = record {
                ranges.push((start.clone(), end.clone(), *seqno));
            }
        }

        let mut survivors: Vec<PointEntry> = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;
        for record in records {
            match record {
                SstRecord::RangeDelete { .. } => {}
                SstRecord::Delete { key, .. } => {
                    // Newest version for this key is a tombstone: the
                    // key is gone and the tombstone is spent.
                    if last_key.as_ref() != Some(&key) {
                        last_key = Some(key);
                    }
                }
                SstRecord::Put {
                    key, seqno, value, ..
                } => {
                    if last_key.as_ref() == Some(&key) {
                        continue; // superseded version
                    }
                    last_key = Some(key.clone());
                    let covered = ranges
                        .iter()
                        .any(|(s, e, rseq)| s.as_slice() <= key.as_slice()
                            && key.as_slice() < e.as_slice()
                            && *rseq > seqno);
                    if covered {
                        continue;
                    }
                    let value = value.expect("harness tables are never pruned");
                    survivors.push(PointEntry::put(key, value, seqno));
                }
            }
        }

        let (output_id, ok) = {
            let mut inner = self.inner.lock().unwrap();
            if survivors.is_empty() {
                // Everything eliminated: inputs simply disappear.
                for (id, path) in &inputs {
                    inner.live.remove(id);
                    let _ = std::fs::remove_file(path);
                }
                (None, true)
            } else {
                let file_id = inner.next_file_id;
                inner.next_file_id += 1;
                let path = self.dir.join(format!("{file_id:06}.sst"));
                SstWriter::new(&path)
                    .build(survivors.into_iter(), std::iter::empty(), false)
                    .unwrap();
                for (id, input_path) in &inputs {
                    inner.live.remove(id);
                    let _ = std::fs::remove_file(input_path);
                }
                inner.live.insert(file_id, path);
                (Some(file_id), true)
            }
        };

        if let Some(listener) = listener {
            let outputs: Vec<u64> = output_id.into_iter().collect();
            listener.on_compaction_complete(&input_ids, &outputs, ok);
        }
        output_id
    }

    /// Declare a snapshot: flush pending writes, freeze the namespace
    /// view, and record the visible sequence. The engine's
    /// `snapshot_created` must be called right after.
    pub fn declare_snapshot(&self, snapshot_id: u64) {
        self.flush();
        let mut inner = self.inner.lock().unwrap();
        let view = SnapView {
            sequence: inner.last_seq,
            view: inner.current.clone(),
        };
        inner.views.insert(snapshot_id, view);
    }

    /// The oracle: the namespace as frozen at `snapshot_id`.
    pub fn view(&self, snapshot_id: u64) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.inner.lock().unwrap().views[&snapshot_id].view.clone()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }
}

impl LsmHost for MiniLsm {
    fn list_live_ssts(&self) -> Result<Vec<u64>, HostError> {
        Ok(self.inner.lock().unwrap().live.keys().copied().collect())
    }

    fn sst_path(&self, file_id: u64) -> Result<PathBuf, HostError> {
        self.inner
            .lock()
            .unwrap()
            .live
            .get(&file_id)
            .cloned()
            .ok_or(HostError::UnknownSst(file_id))
    }

    fn snapshot_sequence(&self, snapshot_id: u64) -> Result<u64, HostError> {
        self.inner
            .lock()
            .unwrap()
            .views
            .get(&snapshot_id)
            .map(|v| v.sequence)
            .ok_or(HostError::UnknownSnapshot(snapshot_id))
    }

    fn open_snapshot_iter(&self, snapshot_id: u64) -> Result<SnapshotIter, HostError> {
        let view = {
            let inner = self.inner.lock().unwrap();
            inner
                .views
                .get(&snapshot_id)
                .map(|v| v.view.clone())
                .ok_or(HostError::UnknownSnapshot(snapshot_id))?
        };
        let delay = self.iter_delay;
        let iter = view.into_iter().map(move |(key, value)| {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            Ok((key, value_digest(&value)))
        });
        Ok(Box::new(iter))
    }
}
