//! # Compaction DAG
//!
//! The directed acyclic graph of compaction history: one node per SST
//! file, one edge from every compaction input to every compaction
//! output. Roots are files produced by memtable flush (no inputs);
//! leaves are files still live or only recently compacted away.
//!
//! The DAG answers the lineage queries the diff engine needs:
//!
//! - **ancestors / descendants** — transitive inputs / outputs of a file,
//! - **delta files** — the SST set sufficient to reconstruct the changes
//!   between two snapshots' live sets (endpoint differences plus the
//!   preserved intermediate files on the chains connecting them),
//! - **degraded marks** — files whose preservation failed; any lineage
//!   touching them routes to the full-scan fallback rather than risking
//!   a silently incorrect diff,
//! - **GC** — records older than the retention horizon are dropped once
//!   no snapshot pins their files.
//!
//! ## Representation
//!
//! In memory the graph is two adjacency tables keyed by `file_id`
//! (forward and reverse); nodes are implied by table presence. No
//! separately-allocated node objects, no back-pointers. Persistently,
//! each compaction is one meta-store entry under `cr/` holding the whole
//! record, so inputs and outputs become durable together or not at all;
//! the in-memory graph is rebuilt by scanning that namespace at startup.
//!
//! ## Concurrency
//!
//! Readers (diff jobs) take the read half of an `RwLock`; the single
//! writer (the compaction listener) takes the write half for the short
//! append path.

#[cfg(test)]
mod tests;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::metastore::{Batch, MetaStore, MetaStoreError};

/// Meta-store namespace for compaction records.
const RECORD_PREFIX: &[u8] = b"cr/";
/// Meta-store namespace for degraded-file marks.
const DEGRADED_PREFIX: &[u8] = b"dg/";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by DAG operations.
#[derive(Debug, Error)]
pub enum DagError {
    /// Meta-store failure while persisting or loading records.
    #[error("Meta store error: {0}")]
    Meta(#[from] MetaStoreError),

    /// Encoding failure on a persisted record.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Compaction record
// ------------------------------------------------------------------------------------------------

/// One completed compaction: `inputs` were merged into `outputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRecord {
    /// Monotonic record sequence (assigned at append).
    pub seq: u64,

    /// Completion time, milliseconds since UNIX epoch.
    pub timestamp_ms: u64,

    /// Files consumed by the compaction.
    pub inputs: Vec<u64>,

    /// Files produced by the compaction.
    pub outputs: Vec<u64>,
}

impl Encode for CompactionRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.timestamp_ms.encode_to(buf)?;
        encoding::encode_vec(&self.inputs, buf)?;
        encoding::encode_vec(&self.outputs, buf)
    }
}

impl Decode for CompactionRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp_ms, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (inputs, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        let (outputs, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                seq,
                timestamp_ms,
                inputs,
                outputs,
            },
            offset,
        ))
    }
}

fn record_key(seq: u64) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn degraded_key(file_id: u64) -> Vec<u8> {
    let mut key = DEGRADED_PREFIX.to_vec();
    key.extend_from_slice(&file_id.to_be_bytes());
    key
}

// ------------------------------------------------------------------------------------------------
// Delta set
// ------------------------------------------------------------------------------------------------

/// The SST files whose records jointly determine a diff.
#[derive(Debug, Default)]
pub struct DeltaFiles {
    /// Files live only in the older snapshot's set.
    pub from_only: Vec<u64>,

    /// Files live only in the newer snapshot's set.
    pub to_only: Vec<u64>,

    /// Preserved files on the compaction chains connecting the two live
    /// sets — in neither snapshot, but contributing candidate keys.
    pub intermediates: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// CompactionDag
// ------------------------------------------------------------------------------------------------

struct DagInner {
    /// input → outputs it was compacted into.
    forward: HashMap<u64, Vec<u64>>,

    /// output → inputs it was produced from.
    reverse: HashMap<u64, Vec<u64>>,

    /// All records, keyed by sequence, for idempotency checks and GC.
    records: HashMap<u64, CompactionRecord>,

    /// Files whose preservation failed; lineage through them is unusable.
    degraded: HashSet<u64>,

    next_seq: u64,
}

impl DagInner {
    fn link(&mut self, record: &CompactionRecord) {
        for &input in &record.inputs {
            let outputs = self.forward.entry(input).or_default();
            for &output in &record.outputs {
                if !outputs.contains(&output) {
                    outputs.push(output);
                }
            }
        }
        for &output in &record.outputs {
            let inputs = self.reverse.entry(output).or_default();
            for &input in &record.inputs {
                if !inputs.contains(&input) {
                    inputs.push(input);
                }
            }
        }
    }

    fn rebuild_adjacency(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        let records: Vec<CompactionRecord> = self.records.values().cloned().collect();
        for record in &records {
            self.link(record);
        }
    }
}

/// Reachability and lineage queries over compaction history.
pub struct CompactionDag {
    meta: Arc<MetaStore>,
    inner: RwLock<DagInner>,
}

impl CompactionDag {
    /// Rebuild the DAG from the meta store's `cr/` and `dg/` namespaces.
    pub fn open(meta: Arc<MetaStore>) -> Result<Self, DagError> {
        let mut inner = DagInner {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            records: HashMap::new(),
            degraded: HashSet::new(),
            next_seq: 0,
        };

        for (_, value) in meta.scan_prefix(RECORD_PREFIX)? {
            let (record, _) = CompactionRecord::decode_from(&value)?;
            inner.next_seq = inner.next_seq.max(record.seq + 1);
            inner.link(&record);
            inner.records.insert(record.seq, record);
        }
        for (key, _) in meta.scan_prefix(DEGRADED_PREFIX)? {
            let raw = &key[DEGRADED_PREFIX.len()..];
            if raw.len() == 8 {
                let mut id = [0u8; 8];
                id.copy_from_slice(raw);
                inner.degraded.insert(u64::from_be_bytes(id));
            }
        }

        info!(
            records = inner.records.len(),
            degraded = inner.degraded.len(),
            "compaction DAG rebuilt"
        );
        Ok(Self {
            meta,
            inner: RwLock::new(inner),
        })
    }

    /// Append one compaction record: persisted first (durable before
    /// visible), then linked into the adjacency tables.
    ///
    /// Idempotent: a record with identical inputs and outputs is a
    /// no-op.
    pub fn add_record(
        &self,
        inputs: &[u64],
        outputs: &[u64],
        timestamp_ms: u64,
    ) -> Result<(), DagError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;

        let duplicate = inner
            .records
            .values()
            .any(|r| r.inputs == inputs && r.outputs == outputs);
        if duplicate {
            debug!(?inputs, ?outputs, "duplicate compaction record ignored");
            return Ok(());
        }

        let record = CompactionRecord {
            seq: inner.next_seq,
            timestamp_ms,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        };
        self.meta
            .put(record_key(record.seq), encoding::encode_to_vec(&record)?)?;

        inner.next_seq += 1;
        inner.link(&record);
        inner.records.insert(record.seq, record);
        Ok(())
    }

    /// All files transitively input to `file_id`.
    pub fn ancestors(&self, file_id: u64) -> Result<HashSet<u64>, DagError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;
        Ok(Self::walk(&inner.reverse, file_id))
    }

    /// All files transitively produced from `file_id`.
    pub fn descendants(&self, file_id: u64) -> Result<HashSet<u64>, DagError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;
        Ok(Self::walk(&inner.forward, file_id))
    }

    fn walk(adjacency: &HashMap<u64, Vec<u64>>, start: u64) -> HashSet<u64> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if let Some(nexts) = adjacency.get(&node) {
                for &next in nexts {
                    if seen.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        seen
    }

    /// Compute the delta set for a diff between two live SST sets.
    ///
    /// `older_set` must belong to the snapshot with the lower sequence
    /// number. Endpoint differences are always included; the preserved
    /// intermediate files on the chains from `older \ newer` toward
    /// `newer` contribute candidate keys and are collected by a forward
    /// walk. Intermediates that are no longer readable are skipped —
    /// their key-level changes are covered by the endpoint files.
    pub fn delta_files(
        &self,
        older_set: &HashSet<u64>,
        newer_set: &HashSet<u64>,
        is_readable: impl Fn(u64) -> bool,
    ) -> Result<DeltaFiles, DagError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;

        let mut delta = DeltaFiles {
            from_only: older_set.difference(newer_set).copied().collect(),
            to_only: newer_set.difference(older_set).copied().collect(),
            intermediates: Vec::new(),
        };
        delta.from_only.sort_unstable();
        delta.to_only.sort_unstable();

        let mut seen: HashSet<u64> = HashSet::new();
        let mut queue: VecDeque<u64> = delta.from_only.iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            let Some(outputs) = inner.forward.get(&node) else {
                continue;
            };
            for &output in outputs {
                if newer_set.contains(&output) || older_set.contains(&output) {
                    continue;
                }
                if !seen.insert(output) {
                    continue;
                }
                if is_readable(output) {
                    delta.intermediates.push(output);
                }
                queue.push_back(output);
            }
        }
        delta.intermediates.sort_unstable();
        Ok(delta)
    }

    /// Mark a file's lineage unusable (failed or corrupt preservation).
    pub fn mark_degraded(&self, file_id: u64) -> Result<(), DagError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;
        if inner.degraded.insert(file_id) {
            self.meta.put(degraded_key(file_id), Vec::new())?;
            warn!(file_id, "SST lineage marked degraded");
        }
        Ok(())
    }

    /// True when the file has been marked degraded.
    pub fn is_degraded(&self, file_id: u64) -> Result<bool, DagError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;
        Ok(inner.degraded.contains(&file_id))
    }

    /// Number of records currently held.
    pub fn record_count(&self) -> Result<usize, DagError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;
        Ok(inner.records.len())
    }

    /// Drop records older than `horizon_ms` (relative to `now_ms`)
    /// whose files are not pinned by any snapshot.
    ///
    /// Returns the file ids that no longer appear in any remaining
    /// record, so the caller can discard their unreferenced backups.
    pub fn gc(
        &self,
        now_ms: u64,
        horizon_ms: u64,
        pinned: &HashSet<u64>,
    ) -> Result<Vec<u64>, DagError> {
        let cutoff = now_ms.saturating_sub(horizon_ms);
        let mut inner = self
            .inner
            .write()
            .map_err(|_| DagError::Internal("RwLock poisoned".into()))?;

        let expired: Vec<u64> = inner
            .records
            .values()
            .filter(|r| r.timestamp_ms < cutoff)
            .filter(|r| {
                r.inputs.iter().all(|f| !pinned.contains(f))
                    && r.outputs.iter().all(|f| !pinned.contains(f))
            })
            .map(|r| r.seq)
            .collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut touched: HashSet<u64> = HashSet::new();
        let mut batch = Batch::new();
        for seq in &expired {
            if let Some(record) = inner.records.remove(seq) {
                touched.extend(record.inputs.iter().copied());
                touched.extend(record.outputs.iter().copied());
                batch.delete(record_key(*seq));
            }
        }
        self.meta.apply_batch(batch)?;
        inner.rebuild_adjacency();

        let orphaned: Vec<u64> = touched
            .into_iter()
            .filter(|f| !inner.forward.contains_key(f) && !inner.reverse.contains_key(f))
            .filter(|f| !pinned.contains(f))
            .collect();

        info!(
            removed_records = expired.len(),
            orphaned_files = orphaned.len(),
            "compaction DAG GC"
        );
        Ok(orphaned)
    }
}
