//! # Compaction Event Listener
//!
//! Converts the host's compaction notifications into preserved SSTs and
//! DAG edges. The host invokes [`CompactionListener::on_compaction_begin`]
//! before a compaction may delete its inputs, and
//! [`CompactionListener::on_compaction_complete`] (or `_aborted`) when it
//! finishes.
//!
//! ## Retention decision
//!
//! At begin time an input file is preserved when any snapshot lists it
//! in its live set, **or** when it descends from a file some snapshot
//! references — the latter keeps chain intermediates readable for
//! future diffs ("err toward retention"). Preservation happens before
//! the host deletes the file; a failed preserve marks the file degraded
//! so affected diffs fall back to the full scan instead of silently
//! producing a wrong answer.
//!
//! ## Serialization with snapshot capture
//!
//! Snapshot creation and compaction events are serialized by one event
//! lock: a snapshot must not observe a live set where a compaction has
//! deleted its inputs but not yet installed its outputs. Snapshot
//! capture therefore lives here too, in
//! [`CompactionListener::capture_snapshot`].
//!
//! ## Blocking discipline
//!
//! Callbacks run on the host's compaction threads and do bounded work
//! only: take the event lock, hard-link (Full mode) or rewrite (Pruned
//! mode), append one meta-store batch, return. Errors are logged and
//! degrade the affected lineage; they never propagate back to the host.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupError, BackupStore, PruneMode};
use crate::dag::{CompactionDag, DagError};
use crate::host::{HostError, LsmHost};
use crate::snapshots::{SnapshotEntry, SnapshotMap, SnapshotMapError};
use crate::unix_ms;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by snapshot capture (listener callbacks themselves
/// never return errors to the host).
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Host-side failure while listing live SSTs or sequences.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Snapshot-map failure (e.g. duplicate snapshot id).
    #[error("snapshot map error: {0}")]
    Snapshots(#[from] SnapshotMapError),

    /// Backup-store failure while pinning preserved ancestors.
    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    /// DAG failure.
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// CompactionListener
// ------------------------------------------------------------------------------------------------

/// The engine's compaction observer. The embedding host calls the
/// `on_compaction_*` methods from its compaction threads; the engine
/// calls [`CompactionListener::capture_snapshot`] when a snapshot is
/// created.
pub struct CompactionListener {
    host: Arc<dyn LsmHost>,
    backup: Arc<BackupStore>,
    dag: Arc<CompactionDag>,
    snapshots: Arc<SnapshotMap>,
    prune_mode: PruneMode,

    /// Serializes compaction events against snapshot capture.
    event_lock: Mutex<()>,
}

impl CompactionListener {
    pub(crate) fn new(
        host: Arc<dyn LsmHost>,
        backup: Arc<BackupStore>,
        dag: Arc<CompactionDag>,
        snapshots: Arc<SnapshotMap>,
        prune_mode: PruneMode,
    ) -> Self {
        Self {
            host,
            backup,
            dag,
            snapshots,
            prune_mode,
            event_lock: Mutex::new(()),
        }
    }

    fn lock_events(&self) -> MutexGuard<'_, ()> {
        match self.event_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A compaction is about to consume `inputs`. Must run before the
    /// host deletes any of them.
    pub fn on_compaction_begin(&self, inputs: &[u64]) {
        let _guard = self.lock_events();
        for &file_id in inputs {
            if !self.wants_preservation(file_id) {
                continue;
            }
            if let Err(e) = self.preserve_input(file_id) {
                error!(file_id, %e, "preservation failed, degrading lineage");
                if let Err(mark_err) = self.dag.mark_degraded(file_id) {
                    error!(file_id, %mark_err, "failed to persist degraded mark");
                }
            }
        }
    }

    /// A compaction finished. With `ok`, the record becomes a durable
    /// DAG edge; otherwise speculative begin-time preserves are rolled
    /// back.
    pub fn on_compaction_complete(&self, inputs: &[u64], outputs: &[u64], ok: bool) {
        let _guard = self.lock_events();
        if ok {
            if let Err(e) = self.dag.add_record(inputs, outputs, unix_ms()) {
                // Without a durable record the chain through these files
                // cannot be trusted.
                error!(%e, ?inputs, ?outputs, "failed to persist compaction record");
                for &file_id in inputs {
                    if let Err(mark_err) = self.dag.mark_degraded(file_id) {
                        error!(file_id, %mark_err, "failed to persist degraded mark");
                    }
                }
                return;
            }
            debug!(
                inputs = inputs.len(),
                outputs = outputs.len(),
                "compaction recorded"
            );
        } else {
            for &file_id in inputs {
                if let Err(e) = self.backup.discard_if_unreferenced(file_id) {
                    warn!(file_id, %e, "failed to discard speculative preserve");
                }
            }
        }
    }

    /// The host abandoned a compaction before completion.
    pub fn on_compaction_aborted(&self, inputs: &[u64]) {
        self.on_compaction_complete(inputs, &[], false);
    }

    /// True when some snapshot needs `file_id` kept: the file is in a
    /// snapshot's live set, or it descends from a file that is.
    fn wants_preservation(&self, file_id: u64) -> bool {
        match self.snapshots.references(file_id) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(file_id, %e, "reference check failed, erring toward retention");
                return true;
            }
        }
        match self.dag.ancestors(file_id) {
            Ok(ancestors) => ancestors
                .iter()
                .any(|&a| self.snapshots.references(a).unwrap_or(true)),
            Err(e) => {
                warn!(file_id, %e, "ancestor walk failed, erring toward retention");
                true
            }
        }
    }

    fn preserve_input(&self, file_id: u64) -> Result<(), ListenerError> {
        let src = self.host.sst_path(file_id)?;
        let initial_refs = self.snapshots.reference_count(file_id)?;
        self.backup
            .preserve(file_id, &src, self.prune_mode, initial_refs)?;
        Ok(())
    }

    /// Observe a snapshot creation: capture the live SST set and the
    /// snapshot's sequence atomically relative to compactions, record
    /// the entry, and pin any already-preserved files the snapshot
    /// depends on (its live files and their preserved ancestors).
    pub fn capture_snapshot(
        &self,
        snapshot_id: u64,
        prev: Option<u64>,
    ) -> Result<Arc<SnapshotEntry>, ListenerError> {
        let _guard = self.lock_events();

        let live_ssts = self.host.list_live_ssts()?;
        let sequence = self.host.snapshot_sequence(snapshot_id)?;

        let entry = SnapshotEntry {
            id: snapshot_id,
            sequence,
            created_ms: unix_ms(),
            prev,
            live_ssts,
        };
        self.snapshots.record(entry.clone())?;

        // Pin preserved files this snapshot depends on. Live files are
        // normally not preserved yet; their reference arrives with the
        // preserve itself (initial_refs counts recorded snapshots).
        let mut pinned = 0usize;
        for &file_id in &entry.live_ssts {
            if self.backup.contains(file_id)? {
                self.backup.add_ref(file_id)?;
                pinned += 1;
            }
            for ancestor in self.dag.ancestors(file_id)? {
                if self.backup.contains(ancestor)? {
                    self.backup.add_ref(ancestor)?;
                    pinned += 1;
                }
            }
        }

        info!(
            snapshot_id,
            sequence,
            live_ssts = entry.live_ssts.len(),
            pinned,
            "snapshot captured"
        );
        Ok(self.snapshots.get(snapshot_id)?)
    }

    /// Release everything a deleted snapshot pinned: its live files and
    /// their preserved ancestors.
    pub fn release_snapshot(&self, entry: &SnapshotEntry) -> Result<(), ListenerError> {
        let _guard = self.lock_events();
        for &file_id in &entry.live_ssts {
            if self.backup.contains(file_id)? {
                self.backup.release(file_id)?;
            }
            for ancestor in self.dag.ancestors(file_id)? {
                if self.backup.contains(ancestor)? {
                    self.backup.release(ancestor)?;
                }
            }
        }
        Ok(())
    }
}
