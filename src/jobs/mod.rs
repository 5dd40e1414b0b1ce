//! # Diff Job Manager
//!
//! Lifecycle, persistence, and scheduling for diff requests. A
//! submitted diff becomes a [`JobRecord`] persisted in the meta store
//! (`job/` namespace), queued onto a bounded submit queue, and executed
//! by one of a fixed pool of worker threads. Results are written as
//! pages of encoded [`DiffEvent`]s under the `res/` namespace and
//! served back with cursor-based pagination.
//!
//! ## Lifecycle
//!
//! ```text
//! QUEUED ──► RUNNING ──► DONE
//!   │          │
//!   │          ├──► FAILED
//!   │          └──► CANCELLED
//!   └──► CANCELLED (cancelled before pickup)
//! ```
//!
//! - **Dedup** — at most one non-terminal job exists per
//!   `(from, to, options)`; a duplicate submit returns the existing id.
//! - **Backpressure** — beyond `max_queued_jobs` pending jobs, submit
//!   fails fast with [`JobError::TooBusy`] and changes nothing.
//! - **Cancellation** — cooperative: the worker observes the flag at
//!   SST-file boundaries and every `cancel_check_interval` merged keys.
//!   Partial result pages are purged on the transition.
//! - **Deadline** — an elapsed deadline is a *failure* (`Timeout`), not
//!   a cancellation, so operators can monitor the two separately.
//! - **Recovery** — on restart, RUNNING jobs are re-queued as QUEUED
//!   (their partial pages purged), QUEUED jobs re-enqueued, terminal
//!   jobs left untouched. DONE results survive restarts.
//! - **Fallback dispatch** — a fast path declining with
//!   `MissingLineage` is rerun through the full scan; the job metadata
//!   records which algorithm produced the result. `MissingLineage`
//!   itself never reaches a client.

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupError, BackupStore};
use crate::config::DiffConfig;
use crate::dag::CompactionDag;
use crate::diff::{
    self, DiffAlgorithm, DiffControl, DiffError, DiffEvent, RenameDetection, fast::FastDiffDeps,
};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::host::LsmHost;
use crate::metastore::{Batch, MetaStore, MetaStoreError};
use crate::snapshots::SnapshotMap;
use crate::unix_ms;

/// Meta-store namespace for job records.
const JOB_PREFIX: &[u8] = b"job/";
/// Meta-store namespace for result pages.
const RESULT_PREFIX: &[u8] = b"res/";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by job-manager operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// No record for the requested job id.
    #[error("job {0} not found")]
    NotFound(u64),

    /// The submit queue is at capacity.
    #[error("submit queue full")]
    TooBusy,

    /// Cancel was requested on a job already in a terminal state.
    #[error("job {0} is already terminal")]
    AlreadyTerminal(u64),

    /// Purge was requested while the job is running.
    #[error("job {0} is running")]
    JobRunning(u64),

    /// Meta-store failure.
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
// Job model
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a diff job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    /// DONE, FAILED, and CANCELLED are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

/// Why a job ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    SnapshotNotFound(u64),
    ReadError(u64),
    PreservedCorrupt(u64),
    BudgetExceeded,
    Timeout,
    OutOfSpace,
    Internal(String),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::SnapshotNotFound(id) => write!(f, "snapshot {id} not found"),
            JobFailure::ReadError(id) => write!(f, "read error on SST {id}"),
            JobFailure::PreservedCorrupt(id) => write!(f, "preserved SST {id} is corrupt"),
            JobFailure::BudgetExceeded => write!(f, "key budget exceeded"),
            JobFailure::Timeout => write!(f, "deadline exceeded"),
            JobFailure::OutOfSpace => write!(f, "out of space"),
            JobFailure::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl From<DiffError> for JobFailure {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::SnapshotNotFound(id) => JobFailure::SnapshotNotFound(id),
            DiffError::ReadError(id) => JobFailure::ReadError(id),
            DiffError::PreservedCorrupt(id) => JobFailure::PreservedCorrupt(id),
            DiffError::BudgetExceeded => JobFailure::BudgetExceeded,
            DiffError::Timeout => JobFailure::Timeout,
            DiffError::Backup(BackupError::OutOfSpace(_)) => JobFailure::OutOfSpace,
            other => JobFailure::Internal(other.to_string()),
        }
    }
}

/// Per-request options. `None` fields fall back to the engine
/// configuration; the triple participates in the dedup key as given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Override the configured rename-detection policy.
    pub rename_detection: Option<RenameDetection>,

    /// Override the configured default deadline.
    pub deadline_ms: Option<u64>,

    /// Override the configured key budget.
    pub key_budget: Option<u64>,
}

/// Persisted record of one diff job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: u64,
    pub from: u64,
    pub to: u64,
    pub options: DiffOptions,
    pub state: JobState,
    pub algorithm: Option<DiffAlgorithm>,
    pub keys_processed: u64,
    pub pages_written: u32,
    pub total_events: u64,
    pub failure: Option<JobFailure>,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub requester: String,
}

// ------------------------------------------------------------------------------------------------
// Encodings
// ------------------------------------------------------------------------------------------------

impl Encode for JobState {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            JobState::Queued => 0,
            JobState::Running => 1,
            JobState::Done => 2,
            JobState::Failed => 3,
            JobState::Cancelled => 4,
        };
        tag.encode_to(buf)
    }
}

impl Decode for JobState {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        let state = match tag {
            0 => JobState::Queued,
            1 => JobState::Running,
            2 => JobState::Done,
            3 => JobState::Failed,
            4 => JobState::Cancelled,
            tag => {
                return Err(EncodingError::InvalidTag {
                    tag: tag as u32,
                    type_name: "JobState",
                });
            }
        };
        Ok((state, n))
    }
}

impl Encode for DiffAlgorithm {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            DiffAlgorithm::Fast => 0,
            DiffAlgorithm::Fallback => 1,
        };
        tag.encode_to(buf)
    }
}

impl Decode for DiffAlgorithm {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((DiffAlgorithm::Fast, n)),
            1 => Ok((DiffAlgorithm::Fallback, n)),
            tag => Err(EncodingError::InvalidTag {
                tag: tag as u32,
                type_name: "DiffAlgorithm",
            }),
        }
    }
}

impl Encode for RenameDetection {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            RenameDetection::Off => 0,
            RenameDetection::SameBucket => 1,
            RenameDetection::Global => 2,
        };
        tag.encode_to(buf)
    }
}

impl Decode for RenameDetection {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((RenameDetection::Off, n)),
            1 => Ok((RenameDetection::SameBucket, n)),
            2 => Ok((RenameDetection::Global, n)),
            tag => Err(EncodingError::InvalidTag {
                tag: tag as u32,
                type_name: "RenameDetection",
            }),
        }
    }
}

impl Encode for JobFailure {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            JobFailure::SnapshotNotFound(id) => {
                0u32.encode_to(buf)?;
                id.encode_to(buf)?;
            }
            JobFailure::ReadError(id) => {
                1u32.encode_to(buf)?;
                id.encode_to(buf)?;
            }
            JobFailure::PreservedCorrupt(id) => {
                2u32.encode_to(buf)?;
                id.encode_to(buf)?;
            }
            JobFailure::BudgetExceeded => 3u32.encode_to(buf)?,
            JobFailure::Timeout => 4u32.encode_to(buf)?,
            JobFailure::OutOfSpace => 5u32.encode_to(buf)?,
            JobFailure::Internal(msg) => {
                6u32.encode_to(buf)?;
                msg.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for JobFailure {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        let failure = match tag {
            0 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                JobFailure::SnapshotNotFound(id)
            }
            1 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                JobFailure::ReadError(id)
            }
            2 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                JobFailure::PreservedCorrupt(id)
            }
            3 => JobFailure::BudgetExceeded,
            4 => JobFailure::Timeout,
            5 => JobFailure::OutOfSpace,
            6 => {
                let (msg, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                JobFailure::Internal(msg)
            }
            tag => {
                return Err(EncodingError::InvalidTag {
                    tag,
                    type_name: "JobFailure",
                });
            }
        };
        Ok((failure, offset))
    }
}

impl Encode for DiffOptions {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.rename_detection.encode_to(buf)?;
        self.deadline_ms.encode_to(buf)?;
        self.key_budget.encode_to(buf)
    }
}

impl Decode for DiffOptions {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (rename_detection, n) = Option::<RenameDetection>::decode_from(&buf[offset..])?;
        offset += n;
        let (deadline_ms, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (key_budget, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                rename_detection,
                deadline_ms,
                key_budget,
            },
            offset,
        ))
    }
}

impl Encode for JobRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.job_id.encode_to(buf)?;
        self.from.encode_to(buf)?;
        self.to.encode_to(buf)?;
        self.options.encode_to(buf)?;
        self.state.encode_to(buf)?;
        self.algorithm.encode_to(buf)?;
        self.keys_processed.encode_to(buf)?;
        self.pages_written.encode_to(buf)?;
        self.total_events.encode_to(buf)?;
        self.failure.encode_to(buf)?;
        self.created_ms.encode_to(buf)?;
        self.updated_ms.encode_to(buf)?;
        self.requester.encode_to(buf)
    }
}

impl Decode for JobRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (job_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (from, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (to, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (options, n) = DiffOptions::decode_from(&buf[offset..])?;
        offset += n;
        let (state, n) = JobState::decode_from(&buf[offset..])?;
        offset += n;
        let (algorithm, n) = Option::<DiffAlgorithm>::decode_from(&buf[offset..])?;
        offset += n;
        let (keys_processed, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (pages_written, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (total_events, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (failure, n) = Option::<JobFailure>::decode_from(&buf[offset..])?;
        offset += n;
        let (created_ms, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (updated_ms, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (requester, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                job_id,
                from,
                to,
                options,
                state,
                algorithm,
                keys_processed,
                pages_written,
                total_events,
                failure,
                created_ms,
                updated_ms,
                requester,
            },
            offset,
        ))
    }
}

fn job_key(job_id: u64) -> Vec<u8> {
    let mut key = JOB_PREFIX.to_vec();
    key.extend_from_slice(&job_id.to_be_bytes());
    key
}

fn result_key(job_id: u64, page_no: u32) -> Vec<u8> {
    let mut key = RESULT_PREFIX.to_vec();
    key.extend_from_slice(&job_id.to_be_bytes());
    key.extend_from_slice(&page_no.to_be_bytes());
    key
}

/// A page of encoded events: `[u32 count][event]…`.
fn encode_page(events: &[DiffEvent]) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    encoding::encode_vec(events, &mut buf)?;
    Ok(buf)
}

fn decode_page(bytes: &[u8]) -> Result<Vec<DiffEvent>, EncodingError> {
    let (events, _) = encoding::decode_vec::<DiffEvent>(bytes)?;
    Ok(events)
}

// ------------------------------------------------------------------------------------------------
// Runtime dependencies for workers
// ------------------------------------------------------------------------------------------------

/// Shared engine state a worker needs to execute a diff.
#[derive(Clone)]
pub(crate) struct JobRuntime {
    pub host: Arc<dyn LsmHost>,
    pub dag: Arc<CompactionDag>,
    pub backup: Arc<BackupStore>,
    pub snapshots: Arc<SnapshotMap>,
}

enum WorkerMsg {
    Run(u64),
    Shutdown,
}

// ------------------------------------------------------------------------------------------------
// Result page sink
// ------------------------------------------------------------------------------------------------

/// Streams events into fixed-size pages under `res/`.
struct PageSink<'a> {
    meta: &'a MetaStore,
    job_id: u64,
    page_size: usize,
    buf: Vec<DiffEvent>,
    pages_written: u32,
    total_events: u64,
}

impl<'a> PageSink<'a> {
    fn new(meta: &'a MetaStore, job_id: u64, page_size: usize) -> Self {
        Self {
            meta,
            job_id,
            page_size,
            buf: Vec::new(),
            pages_written: 0,
            total_events: 0,
        }
    }

    fn push(&mut self, event: DiffEvent) -> Result<(), DiffError> {
        self.buf.push(event);
        self.total_events += 1;
        if self.buf.len() >= self.page_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DiffError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let bytes = encode_page(&self.buf)?;
        self.meta
            .put(result_key(self.job_id, self.pages_written), bytes)
            .map_err(|e| DiffError::Internal(format!("result page write failed: {e}")))?;
        self.pages_written += 1;
        self.buf.clear();
        Ok(())
    }

    /// Discard everything written so far (algorithm switch or abort).
    fn reset(&mut self) -> Result<(), DiffError> {
        let mut batch = Batch::new();
        for page_no in 0..self.pages_written {
            batch.delete(result_key(self.job_id, page_no));
        }
        self.meta
            .apply_batch(batch)
            .map_err(|e| DiffError::Internal(format!("result page purge failed: {e}")))?;
        self.pages_written = 0;
        self.total_events = 0;
        self.buf.clear();
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// JobManager
// ------------------------------------------------------------------------------------------------

struct JobsInner {
    records: HashMap<u64, JobRecord>,
    cancels: HashMap<u64, Arc<AtomicBool>>,
}

/// Lifecycle and persistence for diff requests.
pub struct JobManager {
    meta: Arc<MetaStore>,
    config: DiffConfig,
    tx: Sender<WorkerMsg>,
    rx: Receiver<WorkerMsg>,
    inner: Mutex<JobsInner>,
    next_job_id: AtomicU64,
    queued: AtomicUsize,
}

impl JobManager {
    /// Load persisted jobs and prepare the queue. RUNNING jobs are
    /// re-queued as QUEUED with their partial pages purged; QUEUED jobs
    /// re-enqueued; terminal jobs left as-is.
    pub fn open(meta: Arc<MetaStore>, config: DiffConfig) -> Result<Self, JobError> {
        let (tx, rx) = unbounded();
        let mut records = HashMap::new();
        let mut max_id = 0u64;
        let mut requeue = Vec::new();

        for (_, value) in meta.scan_prefix(JOB_PREFIX)? {
            let (mut record, _) = JobRecord::decode_from(&value)?;
            max_id = max_id.max(record.job_id);
            match record.state {
                JobState::Running => {
                    // Partial pages from the interrupted run are stale.
                    let mut batch = Batch::new();
                    for page_no in 0..record.pages_written {
                        batch.delete(result_key(record.job_id, page_no));
                    }
                    meta.apply_batch(batch)?;
                    record.state = JobState::Queued;
                    record.pages_written = 0;
                    record.total_events = 0;
                    record.keys_processed = 0;
                    record.updated_ms = unix_ms();
                    meta.put(job_key(record.job_id), encoding::encode_to_vec(&record)?)?;
                    requeue.push(record.job_id);
                }
                JobState::Queued => requeue.push(record.job_id),
                _ => {}
            }
            records.insert(record.job_id, record);
        }
        requeue.sort_unstable();

        let manager = Self {
            meta,
            config,
            tx,
            rx,
            inner: Mutex::new(JobsInner {
                cancels: records
                    .keys()
                    .map(|&id| (id, Arc::new(AtomicBool::new(false))))
                    .collect(),
                records,
            }),
            next_job_id: AtomicU64::new(max_id + 1),
            queued: AtomicUsize::new(0),
        };

        let recovered = requeue.len();
        for job_id in requeue {
            manager.queued.fetch_add(1, Ordering::SeqCst);
            manager
                .tx
                .send(WorkerMsg::Run(job_id))
                .map_err(|_| JobError::Internal("queue closed during recovery".into()))?;
        }
        if recovered > 0 {
            info!(recovered, "re-queued interrupted diff jobs");
        }
        Ok(manager)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, JobsInner>, JobError> {
        self.inner
            .lock()
            .map_err(|_| JobError::Internal("mutex poisoned".into()))
    }

    fn persist(&self, record: &JobRecord) -> Result<(), JobError> {
        self.meta
            .put(job_key(record.job_id), encoding::encode_to_vec(record)?)?;
        Ok(())
    }

    /// Submit a diff request. Deduplicates against non-terminal jobs
    /// with the same `(from, to, options)`; fails fast with
    /// [`JobError::TooBusy`] when the queue is at capacity.
    pub fn submit(
        &self,
        from: u64,
        to: u64,
        options: DiffOptions,
        requester: impl Into<String>,
    ) -> Result<u64, JobError> {
        let mut inner = self.lock()?;

        if let Some(existing) = inner.records.values().find(|r| {
            !r.state.is_terminal() && r.from == from && r.to == to && r.options == options
        }) {
            debug!(job_id = existing.job_id, from, to, "deduplicated submit");
            return Ok(existing.job_id);
        }

        if self.queued.load(Ordering::SeqCst) >= self.config.max_queued_jobs {
            return Err(JobError::TooBusy);
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let now = unix_ms();
        let record = JobRecord {
            job_id,
            from,
            to,
            options,
            state: JobState::Queued,
            algorithm: None,
            keys_processed: 0,
            pages_written: 0,
            total_events: 0,
            failure: None,
            created_ms: now,
            updated_ms: now,
            requester: requester.into(),
        };
        self.persist(&record)?;
        inner.records.insert(job_id, record);
        inner
            .cancels
            .insert(job_id, Arc::new(AtomicBool::new(false)));
        drop(inner);

        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(WorkerMsg::Run(job_id))
            .map_err(|_| JobError::Internal("queue closed".into()))?;
        info!(job_id, from, to, "diff job submitted");
        Ok(job_id)
    }

    /// Current record for a job (a lock-free snapshot from the caller's
    /// perspective: the clone is taken under a short internal lock).
    pub fn status(&self, job_id: u64) -> Result<JobRecord, JobError> {
        let inner = self.lock()?;
        inner
            .records
            .get(&job_id)
            .cloned()
            .ok_or(JobError::NotFound(job_id))
    }

    /// Request cooperative cancellation. Queued jobs transition
    /// immediately; running jobs transition when the worker observes
    /// the flag. Idempotent while the job is non-terminal.
    pub fn cancel(&self, job_id: u64) -> Result<(), JobError> {
        let mut inner = self.lock()?;
        let state = inner
            .records
            .get(&job_id)
            .ok_or(JobError::NotFound(job_id))?
            .state;
        if state.is_terminal() {
            return Err(JobError::AlreadyTerminal(job_id));
        }
        if let Some(flag) = inner.cancels.get(&job_id) {
            flag.store(true, Ordering::SeqCst);
        }
        if state == JobState::Queued {
            if let Some(record) = inner.records.get_mut(&job_id) {
                record.state = JobState::Cancelled;
                record.updated_ms = unix_ms();
                let settled = record.clone();
                self.persist(&settled)?;
            }
            info!(job_id, "queued job cancelled");
        } else {
            info!(job_id, "cancellation requested");
        }
        Ok(())
    }

    /// Paginated read of a DONE job's result stream. Non-done jobs
    /// yield an empty page.
    pub fn result(
        &self,
        job_id: u64,
        cursor: u64,
        page_size: usize,
    ) -> Result<(Vec<DiffEvent>, Option<u64>), JobError> {
        let record = self.status(job_id)?;
        if record.state != JobState::Done || page_size == 0 {
            return Ok((Vec::new(), None));
        }

        let stored_page_size = self.config.result_page_size as u64;
        let mut events = Vec::new();
        let mut position = cursor;

        while events.len() < page_size && position < record.total_events {
            let page_no = (position / stored_page_size) as u32;
            let offset_in_page = (position % stored_page_size) as usize;
            let Some(bytes) = self.meta.get(&result_key(job_id, page_no))? else {
                break;
            };
            let page = decode_page(&bytes)?;
            for event in page.into_iter().skip(offset_in_page) {
                events.push(event);
                position += 1;
                if events.len() >= page_size {
                    break;
                }
            }
        }

        let next_cursor = (position < record.total_events).then_some(position);
        Ok((events, next_cursor))
    }

    /// Remove a job's result pages and its record. Refused while the
    /// job is running.
    pub fn purge(&self, job_id: u64) -> Result<(), JobError> {
        let mut inner = self.lock()?;
        let record = inner
            .records
            .get(&job_id)
            .ok_or(JobError::NotFound(job_id))?;
        if record.state == JobState::Running {
            return Err(JobError::JobRunning(job_id));
        }
        let pages = record.pages_written;
        let mut batch = Batch::new();
        for page_no in 0..pages {
            batch.delete(result_key(job_id, page_no));
        }
        batch.delete(job_key(job_id));
        self.meta.apply_batch(batch)?;
        inner.records.remove(&job_id);
        inner.cancels.remove(&job_id);
        info!(job_id, "job purged");
        Ok(())
    }

    /// Purge terminal jobs whose results have outlived the TTL.
    pub fn purge_expired(&self, now_ms: u64) -> Result<usize, JobError> {
        let expired: Vec<u64> = {
            let inner = self.lock()?;
            inner
                .records
                .values()
                .filter(|r| r.state.is_terminal())
                .filter(|r| r.updated_ms.saturating_add(self.config.result_ttl_ms) < now_ms)
                .map(|r| r.job_id)
                .collect()
        };
        let count = expired.len();
        for job_id in expired {
            if let Err(e) = self.purge(job_id) {
                warn!(job_id, %e, "TTL purge failed");
            }
        }
        Ok(count)
    }

    /// Jobs currently waiting in the queue.
    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// All known job ids, unordered.
    pub fn list(&self) -> Result<Vec<u64>, JobError> {
        let inner = self.lock()?;
        Ok(inner.records.keys().copied().collect())
    }

    /// Ask `count` workers to exit after draining their current job.
    pub(crate) fn send_shutdown(&self, count: usize) {
        for _ in 0..count {
            let _ = self.tx.send(WorkerMsg::Shutdown);
        }
    }

    /// Set every non-terminal job's cancellation flag (engine
    /// shutdown).
    pub(crate) fn cancel_all(&self) -> Result<(), JobError> {
        let inner = self.lock()?;
        for (job_id, record) in &inner.records {
            if !record.state.is_terminal()
                && let Some(flag) = inner.cancels.get(job_id)
            {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Worker side
    // --------------------------------------------------------------------------------------------

    /// Worker thread body: pull jobs until shutdown.
    pub(crate) fn worker_loop(&self, runtime: JobRuntime) {
        loop {
            match self.rx.recv() {
                Ok(WorkerMsg::Run(job_id)) => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = self.run_job(job_id, &runtime) {
                        error!(job_id, %e, "job execution failed internally");
                    }
                }
                Ok(WorkerMsg::Shutdown) | Err(_) => break,
            }
        }
    }

    /// Execute one job end to end, including the fallback dispatch and
    /// every state transition.
    fn run_job(&self, job_id: u64, runtime: &JobRuntime) -> Result<(), JobError> {
        let (mut record, cancel) = {
            let inner = self.lock()?;
            let Some(record) = inner.records.get(&job_id) else {
                return Ok(()); // purged while queued
            };
            if record.state != JobState::Queued {
                return Ok(()); // cancelled (or otherwise settled) before pickup
            }
            let cancel = inner
                .cancels
                .get(&job_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
            (record.clone(), cancel)
        };

        if cancel.load(Ordering::SeqCst) {
            return self.finish(record, JobState::Cancelled, None, None, 0);
        }

        record.state = JobState::Running;
        record.updated_ms = unix_ms();
        self.persist(&record)?;
        {
            let mut inner = self.lock()?;
            inner.records.insert(job_id, record.clone());
        }

        let deadline = record
            .options
            .deadline_ms
            .or(self.config.per_job_deadline_ms)
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let budget = record.options.key_budget.or(self.config.per_job_key_budget);
        let rename = record
            .options
            .rename_detection
            .unwrap_or(self.config.rename_detection);
        let mut control = DiffControl::new(
            Arc::clone(&cancel),
            deadline,
            budget,
            self.config.cancel_check_interval,
        );

        let mut sink = PageSink::new(&self.meta, job_id, self.config.result_page_size);
        let outcome = self.execute(&record, runtime, rename, &mut control, &mut sink);

        match outcome {
            Ok(algorithm) => {
                if let Err(e) = sink.flush() {
                    let _ = sink.reset();
                    return self.finish(
                        record,
                        JobState::Failed,
                        Some(JobFailure::from(e)),
                        Some(algorithm),
                        control.keys_processed(),
                    );
                }
                let mut record = record;
                record.pages_written = sink.pages_written;
                record.total_events = sink.total_events;
                self.finish(
                    record,
                    JobState::Done,
                    None,
                    Some(algorithm),
                    control.keys_processed(),
                )
            }
            Err(DiffError::Cancelled) => {
                sink.reset()
                    .map_err(|e| JobError::Internal(e.to_string()))?;
                self.finish(record, JobState::Cancelled, None, None, control.keys_processed())
            }
            Err(e) => {
                sink.reset()
                    .map_err(|e| JobError::Internal(e.to_string()))?;
                self.finish(
                    record,
                    JobState::Failed,
                    Some(JobFailure::from(e)),
                    None,
                    control.keys_processed(),
                )
            }
        }
    }

    /// Run the fast path, dispatching the fallback when lineage is
    /// missing. Returns which algorithm produced the result.
    fn execute(
        &self,
        record: &JobRecord,
        runtime: &JobRuntime,
        rename: RenameDetection,
        control: &mut DiffControl,
        sink: &mut PageSink<'_>,
    ) -> Result<DiffAlgorithm, DiffError> {
        let from = runtime
            .snapshots
            .get(record.from)
            .map_err(|_| DiffError::SnapshotNotFound(record.from))?;
        let to = runtime
            .snapshots
            .get(record.to)
            .map_err(|_| DiffError::SnapshotNotFound(record.to))?;

        let deps = FastDiffDeps {
            host: &runtime.host,
            dag: &runtime.dag,
            backup: &runtime.backup,
        };

        let fast_result = diff::fast::run(&deps, &from, &to, rename, control, &mut |event| {
            sink.push(event)
        });
        match fast_result {
            Ok(()) => Ok(DiffAlgorithm::Fast),
            Err(DiffError::MissingLineage) => {
                info!(
                    job_id = record.job_id,
                    from = record.from,
                    to = record.to,
                    "lineage incomplete, dispatching full-scan fallback"
                );
                sink.reset()?;
                diff::full::run(&runtime.host, &from, &to, control, &mut |event| {
                    sink.push(event)
                })?;
                Ok(DiffAlgorithm::Fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist a terminal transition.
    fn finish(
        &self,
        mut record: JobRecord,
        state: JobState,
        failure: Option<JobFailure>,
        algorithm: Option<DiffAlgorithm>,
        keys_processed: u64,
    ) -> Result<(), JobError> {
        record.state = state;
        record.failure = failure;
        record.algorithm = algorithm.or(record.algorithm);
        record.keys_processed = keys_processed;
        record.updated_ms = unix_ms();
        if state != JobState::Done {
            record.pages_written = 0;
            record.total_events = 0;
        }
        self.persist(&record)?;
        info!(
            job_id = record.job_id,
            state = ?record.state,
            algorithm = ?record.algorithm,
            events = record.total_events,
            failure = %record
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "none".into()),
            "job finished"
        );
        let mut inner = self.lock()?;
        inner.records.insert(record.job_id, record);
        Ok(())
    }
}
