//! # snapdiff
//!
//! A **compaction-aware snapshot diff engine** for LSM-tree key-value
//! stores. Given two point-in-time snapshots of a namespace, snapdiff
//! computes the keys that were added, deleted, modified, or renamed
//! between them — without disabling the host store's background
//! compaction, and with graceful degradation when compaction history
//! has been pruned.
//!
//! ## Architecture
//!
//! ```text
//!       client ─► DiffEngine ─► JobManager ─► (dedupe / enqueue)
//!                                                 │
//!                                                 ▼
//!                                        Diff Algorithm Core
//!                                       /                    \
//!                                 DAG usable?                no
//!                                    yes │                    └► Full-Scan Fallback
//!                                        ▼
//!                              delta SST set ◄── CompactionDag + SnapshotMap
//!                                        │
//!                                        ▼
//!                          tombstone-aware ScanIterator (× files)
//!                                        │
//!                                        ▼
//!                      merge / classify → event stream → result pages
//!
//!   host LSM store ── on_compaction_begin/complete ──► CompactionListener
//!                                                        │
//!                                                        ├─► BackupStore (hard-link inputs)
//!                                                        └─► CompactionDag (add record)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | One-per-process facade: open, snapshot lifecycle, submit/status/results/cancel/purge, close |
//! | [`jobs`] | Diff job lifecycle, dedup, bounded worker pool, result paging, restart recovery |
//! | [`diff`] | Fast-path (DAG delta) and full-scan diff algorithms, rename detection |
//! | [`dag`] | Compaction DAG: lineage queries, degraded marks, retention GC |
//! | [`listener`] | Compaction begin/complete/abort callbacks, snapshot capture critical section |
//! | [`backup`] | Preserved-SST archive with full and value-pruned variants, ref counts |
//! | [`snapshots`] | Per-snapshot live SST sets, captured atomically |
//! | [`sstable`] | SST file format, atomic writer, tombstone-aware reader |
//! | [`metastore`] | WAL + checkpoint persistent KV store for all engine state |
//! | [`wal`] | Generic CRC-protected write-ahead log |
//! | [`encoding`] | Deterministic hand-written binary encoding |
//! | [`host`] | The narrow trait the engine consumes from the host store |
//! | [`config`] | Engine configuration and validation |
//!
//! ## Key properties
//!
//! - **Compaction never stops.** The listener hard-links compaction
//!   inputs that snapshots still need *before* the host deletes them;
//!   the DAG records the input → output lineage durably.
//! - **Fast path reads only what changed.** A diff touches the SST
//!   files in either snapshot's live set but not both, plus preserved
//!   chain intermediates — not the whole namespace.
//! - **Fallback is first-class.** When lineage is missing or degraded,
//!   the same diff is produced by an ordered co-walk of both snapshot
//!   namespaces; the job's metadata records which algorithm ran.
//! - **Tombstones are surfaced, not resolved away.** The reader yields
//!   point and range deletes; without them a deleted key would look
//!   absent in both snapshots for the wrong reason.
//! - **Everything survives restart.** Jobs, results, lineage, snapshot
//!   sets, and backup reference counts persist through a WAL-backed
//!   meta store; interrupted jobs are re-queued.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use snapdiff::{DiffConfig, DiffEngine, DiffOptions};
//!
//! let engine = DiffEngine::open("/var/lib/snapdiff", host, DiffConfig::default())?;
//!
//! // Wire the listener into the host's compaction hooks.
//! let listener = engine.listener();
//!
//! // Observe snapshots as the host creates them.
//! engine.snapshot_created(1, None)?;
//! engine.snapshot_created(2, Some(1))?;
//!
//! // Ask for a diff and page through the result.
//! let job = engine.submit_diff(1, 2, DiffOptions::default(), "ops")?;
//! let status = engine.get_status(job)?;
//! let (events, next) = engine.list_results(job, 0, 500)?;
//!
//! engine.close()?;
//! ```

pub mod backup;
pub mod config;
pub mod dag;
pub mod diff;
pub mod encoding;
pub mod engine;
pub mod host;
pub mod jobs;
pub mod listener;
pub mod metastore;
pub mod snapshots;
pub mod sstable;
pub mod wal;

pub use backup::PruneMode;
pub use config::DiffConfig;
pub use diff::{DiffAlgorithm, DiffEvent, RenameDetection};
pub use engine::{DiffEngine, EngineError};
pub use host::{HostError, LsmHost, SnapshotIter};
pub use jobs::{DiffOptions, JobRecord, JobState};

/// Milliseconds since the UNIX epoch. Clock regressions clamp to zero
/// rather than panicking.
pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
