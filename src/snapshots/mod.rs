//! # Snapshot SST Map
//!
//! For every snapshot the engine has observed, the exact set of SST
//! files that were live at its creation, plus the snapshot's maximum
//! visible sequence number. Captured once, atomically relative to
//! concurrent compactions (the engine holds the listener's event lock
//! while listing the live set), and never mutated afterwards.
//!
//! Entries persist in the meta store under the `sn/` prefix and are
//! reloaded wholesale at startup. The union over all recorded snapshots
//! of `live_ssts ∪ ancestors(live_ssts)` is exactly the file set the
//! backup store must keep.

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::metastore::{MetaStore, MetaStoreError};

/// Meta-store namespace for snapshot entries.
const SNAPSHOT_PREFIX: &[u8] = b"sn/";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by snapshot-map operations.
#[derive(Debug, Error)]
pub enum SnapshotMapError {
    /// No entry for the requested snapshot.
    #[error("snapshot {0} not found")]
    NotFound(u64),

    /// A second `record` call for the same snapshot.
    #[error("snapshot {0} already recorded")]
    AlreadyRecorded(u64),

    /// Meta-store failure.
    #[error("Meta store error: {0}")]
    Meta(#[from] MetaStoreError),

    /// Encoding failure on a persisted entry.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entry
// ------------------------------------------------------------------------------------------------

/// Immutable record of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Snapshot id (unique, ordered).
    pub id: u64,

    /// Maximum sequence number visible from this snapshot.
    pub sequence: u64,

    /// Creation time, milliseconds since UNIX epoch.
    pub created_ms: u64,

    /// Previous snapshot in the chain, when known.
    pub prev: Option<u64>,

    /// SST files live at creation, sorted.
    pub live_ssts: Vec<u64>,
}

impl Encode for SnapshotEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.sequence.encode_to(buf)?;
        self.created_ms.encode_to(buf)?;
        self.prev.encode_to(buf)?;
        encoding::encode_vec(&self.live_ssts, buf)
    }
}

impl Decode for SnapshotEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (sequence, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (created_ms, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (prev, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (live_ssts, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                sequence,
                created_ms,
                prev,
                live_ssts,
            },
            offset,
        ))
    }
}

fn entry_key(snapshot_id: u64) -> Vec<u8> {
    let mut key = SNAPSHOT_PREFIX.to_vec();
    key.extend_from_slice(&snapshot_id.to_be_bytes());
    key
}

// ------------------------------------------------------------------------------------------------
// SnapshotMap
// ------------------------------------------------------------------------------------------------

/// Registry of all snapshots the engine serves diffs for.
pub struct SnapshotMap {
    meta: Arc<MetaStore>,
    inner: RwLock<HashMap<u64, Arc<SnapshotEntry>>>,
}

impl SnapshotMap {
    /// Reload every persisted entry from the `sn/` namespace.
    pub fn open(meta: Arc<MetaStore>) -> Result<Self, SnapshotMapError> {
        let mut entries = HashMap::new();
        for (_, value) in meta.scan_prefix(SNAPSHOT_PREFIX)? {
            let (entry, _) = SnapshotEntry::decode_from(&value)?;
            entries.insert(entry.id, Arc::new(entry));
        }
        info!(snapshots = entries.len(), "snapshot map loaded");
        Ok(Self {
            meta,
            inner: RwLock::new(entries),
        })
    }

    /// Record one snapshot. One-shot: a second call for the same id
    /// fails with [`SnapshotMapError::AlreadyRecorded`].
    pub fn record(&self, mut entry: SnapshotEntry) -> Result<(), SnapshotMapError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| SnapshotMapError::Internal("RwLock poisoned".into()))?;
        if inner.contains_key(&entry.id) {
            return Err(SnapshotMapError::AlreadyRecorded(entry.id));
        }
        entry.live_ssts.sort_unstable();
        self.meta
            .put(entry_key(entry.id), encoding::encode_to_vec(&entry)?)?;
        debug!(
            snapshot_id = entry.id,
            sequence = entry.sequence,
            live_ssts = entry.live_ssts.len(),
            "snapshot recorded"
        );
        inner.insert(entry.id, Arc::new(entry));
        Ok(())
    }

    /// Fetch one snapshot's entry.
    pub fn get(&self, snapshot_id: u64) -> Result<Arc<SnapshotEntry>, SnapshotMapError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| SnapshotMapError::Internal("RwLock poisoned".into()))?;
        inner
            .get(&snapshot_id)
            .cloned()
            .ok_or(SnapshotMapError::NotFound(snapshot_id))
    }

    /// Remove one snapshot's entry, returning it so the caller can
    /// release the files it pinned.
    pub fn delete(&self, snapshot_id: u64) -> Result<Arc<SnapshotEntry>, SnapshotMapError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| SnapshotMapError::Internal("RwLock poisoned".into()))?;
        let entry = inner
            .remove(&snapshot_id)
            .ok_or(SnapshotMapError::NotFound(snapshot_id))?;
        self.meta.delete(entry_key(snapshot_id))?;
        debug!(snapshot_id, "snapshot deleted");
        Ok(entry)
    }

    /// True when any recorded snapshot lists `file_id` in its live set.
    pub fn references(&self, file_id: u64) -> Result<bool, SnapshotMapError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| SnapshotMapError::Internal("RwLock poisoned".into()))?;
        Ok(inner
            .values()
            .any(|entry| entry.live_ssts.binary_search(&file_id).is_ok()))
    }

    /// Number of snapshots whose live set lists `file_id`.
    pub fn reference_count(&self, file_id: u64) -> Result<u32, SnapshotMapError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| SnapshotMapError::Internal("RwLock poisoned".into()))?;
        Ok(inner
            .values()
            .filter(|entry| entry.live_ssts.binary_search(&file_id).is_ok())
            .count() as u32)
    }

    /// All recorded snapshots, unordered.
    pub fn list(&self) -> Result<Vec<Arc<SnapshotEntry>>, SnapshotMapError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| SnapshotMapError::Internal("RwLock poisoned".into()))?;
        Ok(inner.values().cloned().collect())
    }
}
