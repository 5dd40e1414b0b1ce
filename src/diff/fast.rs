//! Fast-path diff: DAG-driven delta over changed SST files.
//!
//! The delta set for a diff between live sets `F` (from) and `T` (to)
//! is `F \ T` (files compacted away since), `T \ F` (files new since),
//! and the preserved intermediates on the compaction chains connecting
//! them. Those files jointly contain every key whose state changed in
//! the interval; a k-way merge over their tombstone-aware readers
//! yields the candidate keys in order.
//!
//! Per candidate key, the state in each snapshot is resolved from the
//! records belonging to that snapshot's *view* (the delta files in its
//! live set): the record with the highest sequence number not exceeding
//! the snapshot's sequence wins, with range tombstones competing on the
//! same terms. A side whose winning record might be superseded by an
//! older version living in a file **shared** by both snapshots is
//! confirmed with a bounded single-key probe over the shared files that
//! cover the key — this is what keeps the fast path exactly equivalent
//! to the full scan.
//!
//! Completeness is checked up front: every file in `F ∪ T` must be
//! live or preserved, and not degraded. Anything less returns
//! [`DiffError::MissingLineage`] and the job manager dispatches the
//! fallback instead.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, BinaryHeap, HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, info};

use crate::backup::{BackupError, BackupStore};
use crate::dag::CompactionDag;
use crate::host::LsmHost;
use crate::snapshots::SnapshotEntry;
use crate::sstable::{Digest, ScanIterator, SstRecord, Sstable};

use super::{DiffControl, DiffError, DiffEvent, KeyState, RenameDetection, classify, rename};

// ------------------------------------------------------------------------------------------------
// Dependencies
// ------------------------------------------------------------------------------------------------

/// Read-only view of the engine state the fast path needs.
pub struct FastDiffDeps<'a> {
    pub host: &'a Arc<dyn LsmHost>,
    pub dag: &'a CompactionDag,
    pub backup: &'a BackupStore,
}

impl FastDiffDeps<'_> {
    /// Open one SST by id: through the host when live, through the
    /// backup store otherwise. A corrupt preserved file degrades its
    /// lineage so later submissions fall back.
    fn open_table(&self, file_id: u64, live: &HashSet<u64>) -> Result<Arc<Sstable>, DiffError> {
        if live.contains(&file_id) {
            let path = self.host.sst_path(file_id)?;
            let table = Sstable::open(&path).map_err(|e| {
                debug!(file_id, %e, "live SST failed to open");
                DiffError::ReadError(file_id)
            })?;
            return Ok(Arc::new(table));
        }
        match self.backup.open_sst(file_id) {
            Ok(table) => Ok(Arc::new(table)),
            Err(BackupError::NotPreserved(_)) => Err(DiffError::MissingLineage),
            Err(BackupError::Corrupt(_)) => {
                self.dag.mark_degraded(file_id)?;
                Err(DiffError::PreservedCorrupt(file_id))
            }
            Err(e) => Err(DiffError::Backup(e)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Tagged k-way merge
// ------------------------------------------------------------------------------------------------

struct MergeSource {
    iter: ScanIterator<Arc<Sstable>>,
    file_id: u64,
    in_from: bool,
    in_to: bool,
}

struct HeapEntry {
    record: SstRecord,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: smallest key / highest seqno pops first.
        self.record.cmp(&other.record).reverse()
    }
}

/// Heap-based merge over the delta files, yielding records together
/// with their source file's view membership.
struct TaggedMerge {
    sources: Vec<MergeSource>,
    heap: BinaryHeap<HeapEntry>,
}

impl TaggedMerge {
    fn new(mut sources: Vec<MergeSource>) -> Result<Self, DiffError> {
        let mut heap = BinaryHeap::new();
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(first) = source.iter.next() {
                let record = first.map_err(|_| DiffError::ReadError(source.file_id))?;
                heap.push(HeapEntry { record, src: idx });
            }
        }
        Ok(Self { sources, heap })
    }

    fn next(&mut self) -> Result<Option<(SstRecord, bool, bool)>, DiffError> {
        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        let source = &mut self.sources[entry.src];
        let (in_from, in_to) = (source.in_from, source.in_to);
        if let Some(next) = source.iter.next() {
            let record = next.map_err(|_| DiffError::ReadError(source.file_id))?;
            self.heap.push(HeapEntry {
                record,
                src: entry.src,
            });
        }
        Ok(Some((entry.record, in_from, in_to)))
    }
}

// ------------------------------------------------------------------------------------------------
// Per-key resolution
// ------------------------------------------------------------------------------------------------

/// One point record of the current key group.
struct GroupRecord {
    seqno: u64,
    /// `Some(digest)` for a put, `None` for a point tombstone.
    digest: Option<Digest>,
    in_from: bool,
    in_to: bool,
}

/// A range tombstone still overlapping keys at or beyond the cursor.
struct ActiveRange {
    end: Vec<u8>,
    seqno: u64,
    in_from: bool,
    in_to: bool,
}

/// Winner of one view's resolution: sequence number plus resulting
/// state.
#[derive(Clone, Copy)]
struct Resolved {
    seqno: u64,
    state: KeyState,
}

fn resolve_view(
    records: &[GroupRecord],
    ranges: &[ActiveRange],
    key: &[u8],
    seq_limit: u64,
    pick_from: bool,
) -> Option<Resolved> {
    let mut best: Option<Resolved> = None;

    for record in records {
        let in_view = if pick_from {
            record.in_from
        } else {
            record.in_to
        };
        if !in_view || record.seqno > seq_limit {
            continue;
        }
        let state = match record.digest {
            Some(digest) => KeyState::Present(digest),
            None => KeyState::Absent,
        };
        if best.is_none_or(|b| record.seqno > b.seqno) {
            best = Some(Resolved {
                seqno: record.seqno,
                state,
            });
        }
    }

    for range in ranges {
        let in_view = if pick_from {
            range.in_from
        } else {
            range.in_to
        };
        if !in_view || range.seqno > seq_limit || range.end.as_slice() <= key {
            continue;
        }
        if best.is_none_or(|b| range.seqno > b.seqno) {
            best = Some(Resolved {
                seqno: range.seqno,
                state: KeyState::Absent,
            });
        }
    }

    best
}

/// Combine a view's delta resolution with the shared-file winner.
fn finalize(view: Option<Resolved>, shared: Option<Resolved>) -> KeyState {
    match (view, shared) {
        (None, None) => KeyState::Absent,
        (Some(v), None) => v.state,
        (None, Some(s)) => s.state,
        (Some(v), Some(s)) => {
            if s.seqno > v.seqno {
                s.state
            } else {
                v.state
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared-file probe cache
// ------------------------------------------------------------------------------------------------

/// Lazily-opened handles on the files live in both snapshots. Probed
/// only for keys that would otherwise produce an event, to confirm the
/// delta view against versions living outside it.
struct SharedFiles<'a> {
    deps: &'a FastDiffDeps<'a>,
    live: &'a HashSet<u64>,
    ids: Vec<u64>,
    open: HashMap<u64, Arc<Sstable>>,
}

impl SharedFiles<'_> {
    fn table(&mut self, file_id: u64) -> Result<Arc<Sstable>, DiffError> {
        match self.open.get(&file_id) {
            Some(table) => Ok(Arc::clone(table)),
            None => {
                let table = self.deps.open_table(file_id, self.live)?;
                self.open.insert(file_id, Arc::clone(&table));
                Ok(table)
            }
        }
    }

    /// Best record for `key` across all shared files covering it.
    /// Every shared-file record predates both snapshots, so one probe
    /// serves both sides.
    fn probe(&mut self, key: &[u8]) -> Result<Option<Resolved>, DiffError> {
        let mut best: Option<Resolved> = None;
        for idx in 0..self.ids.len() {
            let file_id = self.ids[idx];
            let table = self.table(file_id)?;
            if !table.covers_key(key) && !table.range_covers(key) {
                continue;
            }
            for record in table.probe(key).map_err(|_| DiffError::ReadError(file_id))? {
                let record = record.map_err(|_| DiffError::ReadError(file_id))?;
                let resolved = match record {
                    SstRecord::Put { seqno, digest, .. } => Resolved {
                        seqno,
                        state: KeyState::Present(digest),
                    },
                    SstRecord::Delete { seqno, .. } => Resolved {
                        seqno,
                        state: KeyState::Absent,
                    },
                    SstRecord::RangeDelete { seqno, .. } => Resolved {
                        seqno,
                        state: KeyState::Absent,
                    },
                };
                if best.is_none_or(|b| resolved.seqno > b.seqno) {
                    best = Some(resolved);
                }
            }
        }
        Ok(best)
    }

    /// Point keys in `[start, end)` held by any shared file. Used to
    /// surface candidates for a delta-file range tombstone whose
    /// covered keys live only in shared files and would otherwise
    /// never enter the merge.
    fn keys_in_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<Vec<u8>>, DiffError> {
        let mut keys = Vec::new();
        for idx in 0..self.ids.len() {
            let file_id = self.ids[idx];
            let table = self.table(file_id)?;
            let props = &table.properties;
            if props.record_count == 0
                || props.max_key.as_slice() < start
                || props.min_key.as_slice() >= end
            {
                continue;
            }
            for record in table
                .scan(start, Some(end))
                .map_err(|_| DiffError::ReadError(file_id))?
            {
                let record = record.map_err(|_| DiffError::ReadError(file_id))?;
                match record {
                    SstRecord::Put { key, .. } | SstRecord::Delete { key, .. } => keys.push(key),
                    SstRecord::RangeDelete { .. } => {}
                }
            }
        }
        Ok(keys)
    }
}

// ------------------------------------------------------------------------------------------------
// Entry point
// ------------------------------------------------------------------------------------------------

/// Run the fast-path diff from `from` to `to`, streaming events into
/// `emit` in strictly ascending key order.
pub fn run(
    deps: &FastDiffDeps<'_>,
    from: &SnapshotEntry,
    to: &SnapshotEntry,
    rename_detection: RenameDetection,
    control: &mut DiffControl,
    emit: &mut dyn FnMut(DiffEvent) -> Result<(), DiffError>,
) -> Result<(), DiffError> {
    let from_set: HashSet<u64> = from.live_ssts.iter().copied().collect();
    let to_set: HashSet<u64> = to.live_ssts.iter().copied().collect();

    // Identical live sets: nothing can differ. O(1) after comparison.
    if from_set == to_set {
        info!(from = from.id, to = to.id, "identical live sets, empty diff");
        return Ok(());
    }

    let live: HashSet<u64> = deps.host.list_live_ssts()?.into_iter().collect();

    // Completeness: every file of both snapshots must be readable and
    // its lineage trusted.
    for &file_id in from_set.union(&to_set) {
        let available = live.contains(&file_id) || deps.backup.contains(file_id)?;
        if !available || deps.dag.is_degraded(file_id)? {
            debug!(file_id, available, "lineage incomplete, declining fast path");
            return Err(DiffError::MissingLineage);
        }
    }

    // Delta set: endpoint differences plus preserved chain
    // intermediates, walked from the older side.
    let (older_set, newer_set) = if from.sequence <= to.sequence {
        (&from_set, &to_set)
    } else {
        (&to_set, &from_set)
    };
    let readable = |file_id: u64| {
        if live.contains(&file_id) {
            return true;
        }
        match (deps.backup.contains(file_id), deps.dag.is_degraded(file_id)) {
            (Ok(preserved), Ok(degraded)) => preserved && !degraded,
            _ => false,
        }
    };
    let delta = deps.dag.delta_files(older_set, newer_set, readable)?;

    let mut delta_ids: Vec<u64> = Vec::new();
    delta_ids.extend(&delta.from_only);
    delta_ids.extend(&delta.to_only);
    delta_ids.extend(&delta.intermediates);

    info!(
        from = from.id,
        to = to.id,
        delta_files = delta_ids.len(),
        intermediates = delta.intermediates.len(),
        "fast diff started"
    );

    // Open readers over the delta set, tagged with view membership.
    let mut sources = Vec::with_capacity(delta_ids.len());
    for &file_id in &delta_ids {
        control.checkpoint()?;
        let table = deps.open_table(file_id, &live)?;
        let iter = Sstable::scan_arc(Arc::clone(&table), &[], None)
            .map_err(|_| DiffError::ReadError(file_id))?;
        sources.push(MergeSource {
            iter,
            file_id,
            in_from: from_set.contains(&file_id),
            in_to: to_set.contains(&file_id),
        });
    }
    let mut merge = TaggedMerge::new(sources)?;

    let mut shared = SharedFiles {
        deps,
        live: &live,
        ids: from_set.intersection(&to_set).copied().collect(),
        open: HashMap::new(),
    };

    let mut buffered: Vec<DiffEvent> = Vec::new();
    let buffering = rename_detection != RenameDetection::Off;

    let mut active_ranges: Vec<ActiveRange> = Vec::new();
    let mut group_key: Option<Vec<u8>> = None;
    let mut group: Vec<GroupRecord> = Vec::new();
    // Candidates injected for range tombstones whose covered keys live
    // only in shared files; drained in key order as the merge advances.
    let mut injected: BTreeSet<Vec<u8>> = BTreeSet::new();

    macro_rules! emit_event {
        ($event:expr) => {
            if let Some(event) = $event {
                if buffering {
                    buffered.push(event);
                } else {
                    emit(event)?;
                }
            }
        };
    }

    // Resolve and emit injected candidates strictly below `up_to`
    // (all of them when `None`), before the merge cursor passes them.
    macro_rules! drain_injected {
        ($up_to:expr) => {{
            let limit: Option<&[u8]> = $up_to;
            let due: Vec<Vec<u8>> = match limit {
                Some(bound) => injected
                    .range(..bound.to_vec())
                    .cloned()
                    .collect(),
                None => injected.iter().cloned().collect(),
            };
            for key in due {
                injected.remove(&key);
                control.tick_key()?;
                let event = resolve_key(
                    &key,
                    &[],
                    &active_ranges,
                    from.sequence,
                    to.sequence,
                    &mut shared,
                )?;
                emit_event!(event);
            }
        }};
    }

    macro_rules! flush_group {
        () => {
            if let Some(key) = group_key.take() {
                drain_injected!(Some(key.as_slice()));
                injected.remove(&key);
                control.tick_key()?;
                let event = resolve_key(
                    &key,
                    &group,
                    &active_ranges,
                    from.sequence,
                    to.sequence,
                    &mut shared,
                )?;
                emit_event!(event);
                group.clear();
            }
        };
    }

    while let Some((record, in_from, in_to)) = merge.next()? {
        let key_changed = group_key
            .as_deref()
            .is_some_and(|current| current != record.key());
        if key_changed {
            flush_group!();
        }

        match record {
            SstRecord::RangeDelete { start, end, seqno } => {
                // Settle injected candidates the expiring ranges still
                // cover, then prune: the stream is sorted by start key,
                // so nothing before `start` comes back.
                drain_injected!(Some(start.as_slice()));
                active_ranges.retain(|r| r.end.as_slice() > start.as_slice());
                for key in shared.keys_in_range(&start, &end)? {
                    injected.insert(key);
                }
                active_ranges.push(ActiveRange {
                    end,
                    seqno,
                    in_from,
                    in_to,
                });
            }
            SstRecord::Put {
                key,
                seqno,
                digest,
                value: _,
            } => {
                if group_key.is_none() {
                    group_key = Some(key);
                }
                group.push(GroupRecord {
                    seqno,
                    digest: Some(digest),
                    in_from,
                    in_to,
                });
            }
            SstRecord::Delete { key, seqno } => {
                if group_key.is_none() {
                    group_key = Some(key);
                }
                group.push(GroupRecord {
                    seqno,
                    digest: None,
                    in_from,
                    in_to,
                });
            }
        }
    }
    flush_group!();
    drain_injected!(None);

    if buffering {
        let collapsed = rename::collapse(buffered, rename_detection);
        for event in collapsed {
            emit(event)?;
        }
    }

    Ok(())
}

/// Resolve one candidate key: per-view winners, then a shared-file
/// probe wherever a version living in a file common to both snapshots
/// could change the outcome.
///
/// The probe can be skipped in exactly two situations:
///
/// - neither view has a record — the shared winner would apply to both
///   sides identically, so no event either way;
/// - both views resolved to the *same* record (equal digests, equal
///   sequence number — the common case of an unchanged key carried
///   from an old file into a compaction output), where any shared
///   version is either older than it or newer on both sides alike.
///
/// Everything else probes: one-sided resolutions (the other side's
/// truth may live in a shared file) and any would-be event (a newer
/// shared version may supersede a stale delta record).
fn resolve_key(
    key: &[u8],
    group: &[GroupRecord],
    active_ranges: &[ActiveRange],
    from_seq: u64,
    to_seq: u64,
    shared: &mut SharedFiles<'_>,
) -> Result<Option<DiffEvent>, DiffError> {
    let from_view = resolve_view(group, active_ranges, key, from_seq, true);
    let to_view = resolve_view(group, active_ranges, key, to_seq, false);

    let skip_probe = match (from_view, to_view) {
        (None, None) => true,
        (Some(f), Some(t)) => f.seqno == t.seqno && f.state == t.state,
        _ => false,
    };
    if skip_probe {
        return Ok(classify(
            key,
            from_view.map_or(KeyState::Absent, |r| r.state),
            to_view.map_or(KeyState::Absent, |r| r.state),
        ));
    }

    let shared_best = shared.probe(key)?;
    Ok(classify(
        key,
        finalize(from_view, shared_best),
        finalize(to_view, shared_best),
    ))
}
