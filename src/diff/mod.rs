//! # Diff Algorithm Core
//!
//! Given two snapshots, produce the key-ordered stream of differences
//! between their namespaces. Two algorithms implement the same
//! contract:
//!
//! - [`fast`] — the DAG-driven delta: read only the SST files that
//!   changed between the two live sets (plus preserved chain
//!   intermediates), k-way merge them, and resolve each candidate key's
//!   state in both snapshots by sequence number. Requires every
//!   relevant file to be live or preserved.
//! - [`full`] — the always-available fallback: an ordered co-walk over
//!   both snapshots' full namespaces via the host's snapshot iterators.
//!   The correctness oracle for the fast path, and the route taken
//!   whenever lineage has been pruned or degraded.
//!
//! Classification is identical in both (see [`classify`]): a key's
//! state in each snapshot is either `Absent` or `Present(digest)`, and
//! the `(from, to)` state pair maps to an added / deleted / modified
//! event — or no event when the digests match. Reverse-order requests
//! (`from` newer than `to`) are accepted and classified literally.
//!
//! The optional rename pass ([`rename`]) pairs a deleted key with an
//! added key carrying the same digest and collapses them into one
//! renamed event. It runs only on the fast path.
//!
//! Cancellation, deadlines, and the per-job key budget are enforced
//! cooperatively through [`DiffControl`], checked at every SST-file
//! boundary and every `check_interval` merged keys.

pub mod fast;
pub mod full;
pub mod rename;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use crate::backup::BackupError;
use crate::dag::DagError;
use crate::encoding::{Decode, Encode, EncodingError};
use crate::host::HostError;
use crate::snapshots::SnapshotMapError;
use crate::sstable::Digest;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while computing a diff.
#[derive(Debug, Error)]
pub enum DiffError {
    /// One of the snapshots is not recorded.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(u64),

    /// The delta cannot be assembled from live + preserved files.
    /// Internal: the job manager answers this by dispatching the
    /// fallback; it is never surfaced to a client.
    #[error("lineage incomplete between the requested snapshots")]
    MissingLineage,

    /// An SST file failed mid-read.
    #[error("read error on SST {0}")]
    ReadError(u64),

    /// A preserved SST failed to open or verify.
    #[error("preserved SST {0} is corrupt")]
    PreservedCorrupt(u64),

    /// The per-job key budget was exhausted.
    #[error("key budget exceeded")]
    BudgetExceeded,

    /// The job deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,

    /// Host-side failure.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// DAG failure.
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    /// Backup-store failure.
    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    /// Snapshot-map failure.
    #[error("snapshot map error: {0}")]
    Snapshots(#[from] SnapshotMapError),

    /// Encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

/// One entry of the diff stream. Events are strictly ascending by
/// `key` (the *new* key for renames).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEvent {
    /// The key exists only in the *to* snapshot.
    Added { key: Vec<u8>, digest: Digest },

    /// The key exists only in the *from* snapshot.
    Deleted { key: Vec<u8>, digest: Digest },

    /// The key exists in both snapshots with different values.
    Modified {
        key: Vec<u8>,
        old_digest: Digest,
        new_digest: Digest,
    },

    /// A deleted key and an added key carried the same value; collapsed
    /// by the rename pass.
    Renamed {
        key: Vec<u8>,
        previous_key: Vec<u8>,
        digest: Digest,
    },
}

impl DiffEvent {
    /// Ordering key of the event (the new key for renames).
    pub fn key(&self) -> &[u8] {
        match self {
            DiffEvent::Added { key, .. } => key,
            DiffEvent::Deleted { key, .. } => key,
            DiffEvent::Modified { key, .. } => key,
            DiffEvent::Renamed { key, .. } => key,
        }
    }
}

impl Encode for DiffEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            DiffEvent::Added { key, digest } => {
                0u32.encode_to(buf)?;
                key.encode_to(buf)?;
                digest.encode_to(buf)?;
            }
            DiffEvent::Deleted { key, digest } => {
                1u32.encode_to(buf)?;
                key.encode_to(buf)?;
                digest.encode_to(buf)?;
            }
            DiffEvent::Modified {
                key,
                old_digest,
                new_digest,
            } => {
                2u32.encode_to(buf)?;
                key.encode_to(buf)?;
                old_digest.encode_to(buf)?;
                new_digest.encode_to(buf)?;
            }
            DiffEvent::Renamed {
                key,
                previous_key,
                digest,
            } => {
                3u32.encode_to(buf)?;
                key.encode_to(buf)?;
                previous_key.encode_to(buf)?;
                digest.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for DiffEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (digest, n) = Digest::decode_from(&buf[offset..])?;
                offset += n;
                Ok((DiffEvent::Added { key, digest }, offset))
            }
            1 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (digest, n) = Digest::decode_from(&buf[offset..])?;
                offset += n;
                Ok((DiffEvent::Deleted { key, digest }, offset))
            }
            2 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (old_digest, n) = Digest::decode_from(&buf[offset..])?;
                offset += n;
                let (new_digest, n) = Digest::decode_from(&buf[offset..])?;
                offset += n;
                Ok((
                    DiffEvent::Modified {
                        key,
                        old_digest,
                        new_digest,
                    },
                    offset,
                ))
            }
            3 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (previous_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (digest, n) = Digest::decode_from(&buf[offset..])?;
                offset += n;
                Ok((
                    DiffEvent::Renamed {
                        key,
                        previous_key,
                        digest,
                    },
                    offset,
                ))
            }
            tag => Err(EncodingError::InvalidTag {
                tag,
                type_name: "DiffEvent",
            }),
        }
    }
}

/// Which algorithm produced a job's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAlgorithm {
    /// DAG-driven delta over changed SST files.
    Fast,
    /// Full namespace co-walk.
    Fallback,
}

/// Rename-detection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenameDetection {
    /// No pairing; deletes and adds stay separate events.
    #[default]
    Off,
    /// Pair only keys sharing the prefix up to the first `/`.
    SameBucket,
    /// Pair across the whole namespace.
    Global,
}

// ------------------------------------------------------------------------------------------------
// Key state & classification
// ------------------------------------------------------------------------------------------------

/// A key's resolved state within one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Present(Digest),
}

/// Map a `(from, to)` state pair to at most one diff event.
pub fn classify(key: &[u8], from: KeyState, to: KeyState) -> Option<DiffEvent> {
    match (from, to) {
        (KeyState::Absent, KeyState::Present(digest)) => Some(DiffEvent::Added {
            key: key.to_vec(),
            digest,
        }),
        (KeyState::Present(digest), KeyState::Absent) => Some(DiffEvent::Deleted {
            key: key.to_vec(),
            digest,
        }),
        (KeyState::Present(old_digest), KeyState::Present(new_digest)) => {
            if old_digest == new_digest {
                None
            } else {
                Some(DiffEvent::Modified {
                    key: key.to_vec(),
                    old_digest,
                    new_digest,
                })
            }
        }
        (KeyState::Absent, KeyState::Absent) => None,
    }
}

// ------------------------------------------------------------------------------------------------
// Cooperative control
// ------------------------------------------------------------------------------------------------

/// Shared cancellation / deadline / budget state for one running job.
pub struct DiffControl {
    /// Cooperative cancellation flag, set by the job manager.
    pub cancel: Arc<AtomicBool>,

    /// Absolute deadline; elapsing maps to [`DiffError::Timeout`].
    pub deadline: Option<Instant>,

    /// Maximum keys this job may process.
    pub key_budget: Option<u64>,

    /// How many merged keys between checks.
    pub check_interval: u64,

    keys_processed: u64,
}

impl DiffControl {
    pub fn new(
        cancel: Arc<AtomicBool>,
        deadline: Option<Instant>,
        key_budget: Option<u64>,
        check_interval: u64,
    ) -> Self {
        Self {
            cancel,
            deadline,
            key_budget,
            check_interval: check_interval.max(1),
            keys_processed: 0,
        }
    }

    /// Unconditional flag check — used at file boundaries.
    pub fn checkpoint(&self) -> Result<(), DiffError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(DiffError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(DiffError::Timeout);
        }
        Ok(())
    }

    /// Account one processed key; checks the budget every key and the
    /// cancellation / deadline flags every `check_interval` keys.
    pub fn tick_key(&mut self) -> Result<(), DiffError> {
        self.keys_processed += 1;
        if let Some(budget) = self.key_budget
            && self.keys_processed > budget
        {
            return Err(DiffError::BudgetExceeded);
        }
        if self.keys_processed % self.check_interval == 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Keys processed so far.
    pub fn keys_processed(&self) -> u64 {
        self.keys_processed
    }
}
