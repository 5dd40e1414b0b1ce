//! External interface toward the host LSM store.
//!
//! The diff engine does not own the live store: it observes it through
//! the narrow [`LsmHost`] trait. A host must be able to enumerate its
//! live SST files atomically, resolve a file id to a path, report the
//! maximum sequence number visible from a snapshot, and (for the
//! full-scan fallback only) expose a key-ordered iterator over a
//! snapshot's namespace.
//!
//! Listener installation is inverted relative to a callback registry:
//! the embedding host obtains the engine's
//! [`CompactionListener`](crate::listener::CompactionListener) handle
//! and invokes its begin/complete/abort callbacks from its compaction
//! threads.

use std::path::PathBuf;

use thiserror::Error;

use crate::sstable::Digest;

/// Errors surfaced by a host implementation.
#[derive(Debug, Error)]
pub enum HostError {
    /// The requested snapshot is unknown to the host.
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(u64),

    /// The requested SST file is not live.
    #[error("unknown SST file {0}")]
    UnknownSst(u64),

    /// Underlying I/O error inside the host.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other host-side failure.
    #[error("host error: {0}")]
    Other(String),
}

/// One entry of a snapshot's full namespace: the key and the blake3
/// digest of its value.
pub type SnapshotEntryItem = Result<(Vec<u8>, Digest), HostError>;

/// Key-ordered iterator over the live keys of one snapshot. Used only
/// by the full-scan fallback.
pub type SnapshotIter = Box<dyn Iterator<Item = SnapshotEntryItem> + Send>;

/// The narrow interface the engine consumes from the host LSM store.
///
/// Implementations must be thread-safe: the engine calls these methods
/// from listener callbacks and from diff worker threads concurrently.
pub trait LsmHost: Send + Sync {
    /// Atomic snapshot of the currently live SST file ids. Must be
    /// consistent with any concurrent compaction completion — the
    /// engine serializes its own snapshot capture against listener
    /// callbacks, and expects the host to not tear the listing.
    fn list_live_ssts(&self) -> Result<Vec<u64>, HostError>;

    /// Filesystem path of a live SST file.
    fn sst_path(&self, file_id: u64) -> Result<PathBuf, HostError>;

    /// The maximum sequence number visible from `snapshot_id`.
    fn snapshot_sequence(&self, snapshot_id: u64) -> Result<u64, HostError>;

    /// Key-ordered iterator over the full namespace of `snapshot_id`.
    fn open_snapshot_iter(&self, snapshot_id: u64) -> Result<SnapshotIter, HostError>;
}
