//! # Snapshot Diff Engine
//!
//! The one-per-process facade tying the subsystems together: meta
//! store, backup store, compaction DAG, snapshot map, compaction
//! listener, and the diff job manager with its worker pool.
//!
//! ## Wiring
//!
//! ```text
//!        host compaction threads          clients
//!                 │                          │
//!                 ▼                          ▼
//!       CompactionListener          submit / status / results
//!        │        │     │                    │
//!        ▼        ▼     ▼                    ▼
//!   BackupStore  DAG  SnapshotMap ◄──── JobManager ──► worker pool
//!        │        │     │                    │
//!        └────────┴─────┴──── MetaStore ─────┘
//! ```
//!
//! ## Lifecycle
//!
//! [`DiffEngine::open`] validates the configuration, opens the meta
//! store (WAL replay + checkpoint load), rebuilds the DAG and snapshot
//! map, reconciles the backup directory, recovers interrupted jobs, and
//! spawns the worker pool plus a janitor thread (result-TTL purge and
//! retention-horizon DAG GC). [`DiffEngine::close`] quiesces in-flight
//! jobs (cancel-and-wait bounded by `shutdown_deadline_ms`), joins the
//! threads, and checkpoints the meta store.
//!
//! The embedding host drives the engine from two directions: its
//! compaction threads call the [`CompactionListener`] callbacks, and
//! its snapshot machinery calls [`DiffEngine::snapshot_created`] /
//! [`DiffEngine::snapshot_deleted`]. Everything else is client surface.

use std::{
    collections::HashSet,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backup::{BackupError, BackupStore};
use crate::config::{ConfigError, DiffConfig};
use crate::dag::{CompactionDag, DagError};
use crate::diff::DiffEvent;
use crate::host::{HostError, LsmHost};
use crate::jobs::{DiffOptions, JobError, JobManager, JobRecord, JobRuntime};
use crate::listener::{CompactionListener, ListenerError};
use crate::metastore::{MetaStore, MetaStoreError};
use crate::snapshots::{SnapshotMap, SnapshotMapError};
use crate::unix_ms;

/// Sub-directory of the engine root holding the meta store.
pub const META_DIR: &str = "meta";
/// Sub-directory of the engine root holding preserved SSTs.
pub const BACKUP_DIR: &str = "backup";

/// How often the janitor wakes up.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Client-facing errors of the engine surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected at open.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Meta-store failure.
    #[error("Meta store error: {0}")]
    Meta(#[from] MetaStoreError),

    /// Job-manager failure (`TooBusy`, `JobNotFound`, …).
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Snapshot-map failure (`SnapshotNotFound`, duplicate record, …).
    #[error("Snapshot error: {0}")]
    Snapshots(#[from] SnapshotMapError),

    /// Listener / snapshot-capture failure.
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// DAG failure.
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    /// Backup-store failure.
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Host-side failure.
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// A diff was submitted with `from` newer than `to` while
    /// `reject_reverse_order` is set.
    #[error("snapshot {from} is newer than {to} and reverse-order diffs are rejected")]
    InvalidSnapshotOrder { from: u64, to: u64 },

    /// The engine is shutting down and no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// DiffEngine
// ------------------------------------------------------------------------------------------------

/// The snapshot diff engine: one logical instance per process, owned
/// by the embedding host. Deliberately not `Clone` — the subsystems are
/// shared internally, but ownership of open/close stays in one place.
pub struct DiffEngine {
    config: DiffConfig,
    meta: Arc<MetaStore>,
    backup: Arc<BackupStore>,
    dag: Arc<CompactionDag>,
    snapshots: Arc<SnapshotMap>,
    listener: Arc<CompactionListener>,
    jobs: Arc<JobManager>,
    host: Arc<dyn LsmHost>,

    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    janitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DiffEngine {
    /// Open (or recover) an engine rooted at `dir`, observing `host`.
    pub fn open(
        dir: impl AsRef<Path>,
        host: Arc<dyn LsmHost>,
        config: DiffConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let dir = dir.as_ref();

        // 1. Persistent state: meta store first, everything else reads
        //    through it.
        let meta = Arc::new(MetaStore::open(dir.join(META_DIR))?);

        // 2. Backup store, reconciling the directory against persisted
        //    reference counts.
        let backup = Arc::new(BackupStore::open(dir.join(BACKUP_DIR), Arc::clone(&meta))?);

        // 3. DAG and snapshot map, rebuilt from their namespaces.
        let dag = Arc::new(CompactionDag::open(Arc::clone(&meta))?);
        let snapshots = Arc::new(SnapshotMap::open(Arc::clone(&meta))?);

        // 4. Listener, sharing the event lock with snapshot capture.
        let listener = Arc::new(CompactionListener::new(
            Arc::clone(&host),
            Arc::clone(&backup),
            Arc::clone(&dag),
            Arc::clone(&snapshots),
            config.prune_mode_default,
        ));

        // 5. Jobs: recover interrupted work, then start the pool.
        let jobs = Arc::new(JobManager::open(Arc::clone(&meta), config.clone())?);

        let engine = Self {
            config,
            meta,
            backup,
            dag,
            snapshots,
            listener,
            jobs,
            host,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            janitor: Mutex::new(None),
        };
        engine.spawn_workers()?;
        engine.spawn_janitor()?;

        info!(dir = %dir.display(), "diff engine opened");
        Ok(engine)
    }

    fn runtime(&self) -> JobRuntime {
        JobRuntime {
            host: Arc::clone(&self.host),
            dag: Arc::clone(&self.dag),
            backup: Arc::clone(&self.backup),
            snapshots: Arc::clone(&self.snapshots),
        }
    }

    fn spawn_workers(&self) -> Result<(), EngineError> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| EngineError::Internal("mutex poisoned".into()))?;
        for worker_no in 0..self.config.max_concurrent_jobs {
            let jobs = Arc::clone(&self.jobs);
            let runtime = self.runtime();
            let handle = thread::Builder::new()
                .name(format!("snapdiff-worker-{worker_no}"))
                .spawn(move || jobs.worker_loop(runtime))
                .map_err(Self::spawn_error)?;
            workers.push(handle);
        }
        Ok(())
    }

    fn spawn_janitor(&self) -> Result<(), EngineError> {
        let jobs = Arc::clone(&self.jobs);
        let dag = Arc::clone(&self.dag);
        let snapshots = Arc::clone(&self.snapshots);
        let backup = Arc::clone(&self.backup);
        let shutdown = Arc::clone(&self.shutdown);
        let horizon_ms = self.config.retention_horizon_ms;

        let handle = thread::Builder::new()
            .name("snapdiff-janitor".into())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::park_timeout(JANITOR_INTERVAL);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let now = unix_ms();
                    match jobs.purge_expired(now) {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "janitor purged expired results"),
                        Err(e) => warn!(%e, "janitor result purge failed"),
                    }
                    if let Err(e) = Self::gc_once(&dag, &snapshots, &backup, now, horizon_ms) {
                        warn!(%e, "janitor DAG GC failed");
                    }
                }
            })
            .map_err(Self::spawn_error)?;

        let mut janitor = self
            .janitor
            .lock()
            .map_err(|_| EngineError::Internal("mutex poisoned".into()))?;
        *janitor = Some(handle);
        Ok(())
    }

    fn spawn_error(e: std::io::Error) -> EngineError {
        EngineError::Internal(format!("thread spawn failed: {e}"))
    }

    fn gc_once(
        dag: &CompactionDag,
        snapshots: &SnapshotMap,
        backup: &BackupStore,
        now_ms: u64,
        horizon_ms: u64,
    ) -> Result<usize, EngineError> {
        // pinned(S) = live(S) ∪ ancestors(live(S)), unioned over all
        // recorded snapshots.
        let mut pinned: HashSet<u64> = HashSet::new();
        for entry in snapshots.list()? {
            for &file_id in &entry.live_ssts {
                pinned.insert(file_id);
                pinned.extend(dag.ancestors(file_id)?);
            }
        }
        let orphaned = dag.gc(now_ms, horizon_ms, &pinned)?;
        let count = orphaned.len();
        for file_id in orphaned {
            backup.discard_if_unreferenced(file_id)?;
        }
        Ok(count)
    }

    // --------------------------------------------------------------------------------------------
    // Host-facing surface
    // --------------------------------------------------------------------------------------------

    /// The compaction listener the host must invoke from its
    /// compaction threads.
    pub fn listener(&self) -> Arc<CompactionListener> {
        Arc::clone(&self.listener)
    }

    /// Observe a snapshot creation: captures the live SST set and
    /// sequence atomically relative to concurrent compactions.
    pub fn snapshot_created(
        &self,
        snapshot_id: u64,
        prev: Option<u64>,
    ) -> Result<(), EngineError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        self.listener.capture_snapshot(snapshot_id, prev)?;
        Ok(())
    }

    /// Observe a snapshot deletion: removes the entry and releases
    /// every file it pinned.
    pub fn snapshot_deleted(&self, snapshot_id: u64) -> Result<(), EngineError> {
        let entry = self.snapshots.delete(snapshot_id)?;
        self.listener.release_snapshot(&entry)?;
        Ok(())
    }

    /// Run one retention-horizon GC pass immediately (the janitor also
    /// runs this periodically).
    pub fn dag_gc(&self) -> Result<usize, EngineError> {
        Self::gc_once(
            &self.dag,
            &self.snapshots,
            &self.backup,
            unix_ms(),
            self.config.retention_horizon_ms,
        )
    }

    // --------------------------------------------------------------------------------------------
    // Client surface
    // --------------------------------------------------------------------------------------------

    /// Submit a diff job from `from` to `to`. Returns the job id —
    /// which may belong to an existing equivalent non-terminal job
    /// (dedup).
    pub fn submit_diff(
        &self,
        from: u64,
        to: u64,
        options: DiffOptions,
        requester: impl Into<String>,
    ) -> Result<u64, EngineError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let from_entry = self.snapshots.get(from)?;
        let to_entry = self.snapshots.get(to)?;
        if self.config.reject_reverse_order && from_entry.sequence > to_entry.sequence {
            return Err(EngineError::InvalidSnapshotOrder { from, to });
        }
        Ok(self.jobs.submit(from, to, options, requester)?)
    }

    /// Current state, progress, and (on terminal states) result
    /// metadata or structured failure for a job.
    pub fn get_status(&self, job_id: u64) -> Result<JobRecord, EngineError> {
        Ok(self.jobs.status(job_id)?)
    }

    /// Paginated read of a finished job's event stream.
    pub fn list_results(
        &self,
        job_id: u64,
        cursor: u64,
        page_size: usize,
    ) -> Result<(Vec<DiffEvent>, Option<u64>), EngineError> {
        Ok(self.jobs.result(job_id, cursor, page_size)?)
    }

    /// Request cooperative cancellation of a job.
    pub fn cancel_diff(&self, job_id: u64) -> Result<(), EngineError> {
        Ok(self.jobs.cancel(job_id)?)
    }

    /// Remove a job's results and record.
    pub fn purge_diff(&self, job_id: u64) -> Result<(), EngineError> {
        Ok(self.jobs.purge(job_id)?)
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Gracefully shut down: stop accepting work, cancel in-flight
    /// jobs, wait for workers bounded by `shutdown_deadline_ms`, and
    /// checkpoint the meta store.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(()); // second close is a no-op
        }
        info!("diff engine shutting down");

        // 1. Ask every non-terminal job to stop, then let the workers
        //    drain.
        self.jobs.cancel_all()?;
        self.jobs.send_shutdown(self.config.max_concurrent_jobs);

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_deadline_ms);
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| EngineError::Internal("mutex poisoned".into()))?;
        while Instant::now() < deadline && workers.iter().any(|h| !h.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        for handle in workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("worker did not quiesce before the shutdown deadline, detaching");
            }
        }
        drop(workers);

        // 2. Stop the janitor.
        let janitor = {
            let mut slot = self
                .janitor
                .lock()
                .map_err(|_| EngineError::Internal("mutex poisoned".into()))?;
            slot.take()
        };
        if let Some(handle) = janitor {
            handle.thread().unpark();
            let _ = handle.join();
        }

        // 3. Make everything durable in one place.
        self.meta.checkpoint()?;
        info!("diff engine closed");
        Ok(())
    }
}
