//! # SST Backup Store
//!
//! Durable retention of SST files past their live lifetime. When the
//! compaction listener decides an input file is still needed by a
//! snapshot, the file is **preserved** here before the host deletes it:
//! hard-linked when the backup directory shares a filesystem with the
//! live store, copied otherwise, or rewritten in **pruned** form (keys,
//! sequence numbers, record types, and value digests — value bytes
//! dropped) to bound on-disk growth over long retention windows.
//!
//! Preserved files are reference-counted: one reference per snapshot
//! that pins the file (directly in its live set, or as an ancestor in
//! its compaction lineage). The physical file is deleted only when the
//! count reaches zero via [`BackupStore::release`].
//!
//! Reference counts are persisted in the meta store under the `bk/`
//! prefix so restarts recover the exact retention state. File creation
//! is atomic (write-then-rename, or a single `link(2)`); incomplete
//! `.tmp` leftovers are removed at startup.
//!
//! ## Concurrency
//!
//! A single store-level mutex serializes preserve/release/ref-count
//! updates. Reads ([`BackupStore::open_sst`]) only take the lock long
//! enough to resolve the path; the returned [`Sstable`] is lock-free.


use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::metastore::{MetaStore, MetaStoreError};
use crate::sstable::{SstError, SstWriter, Sstable};

/// Meta-store namespace for preserved-file entries.
const BACKUP_PREFIX: &[u8] = b"bk/";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by backup-store operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The file was never preserved, or was already released.
    #[error("SST {0} is not preserved")]
    NotPreserved(u64),

    /// The source file disappeared before it could be preserved.
    #[error("source for SST {0} is gone")]
    UnderlyingRead(u64),

    /// The filesystem ran out of space during a preserve.
    #[error("out of space while preserving SST {0}")]
    OutOfSpace(u64),

    /// A preserved file failed to open or verify.
    #[error("preserved SST {0} is corrupt")]
    Corrupt(u64),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Meta-store failure while persisting reference counts.
    #[error("Meta store error: {0}")]
    Meta(#[from] MetaStoreError),

    /// SSTable failure during a pruned rewrite.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    /// Encoding failure on a persisted entry.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Prune mode
// ------------------------------------------------------------------------------------------------

/// How a file is preserved: full content, or value-pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PruneMode {
    /// Byte-identical retention (hard-link or copy).
    Full,
    /// Keys + seqnos + record types + value digests; values dropped.
    Pruned,
}

impl Encode for PruneMode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            PruneMode::Full => 0,
            PruneMode::Pruned => 1,
        };
        tag.encode_to(buf)
    }
}

impl Decode for PruneMode {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((PruneMode::Full, n)),
            1 => Ok((PruneMode::Pruned, n)),
            tag => Err(EncodingError::InvalidTag {
                tag: tag as u32,
                type_name: "PruneMode",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Persisted entry
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PreservedEntry {
    mode: PruneMode,
    refs: u32,
}

impl Encode for PreservedEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.mode.encode_to(buf)?;
        self.refs.encode_to(buf)
    }
}

impl Decode for PreservedEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (mode, n) = PruneMode::decode_from(&buf[offset..])?;
        offset += n;
        let (refs, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { mode, refs }, offset))
    }
}

fn entry_key(file_id: u64) -> Vec<u8> {
    let mut key = BACKUP_PREFIX.to_vec();
    key.extend_from_slice(&file_id.to_be_bytes());
    key
}

fn map_io(file_id: u64, e: io::Error) -> BackupError {
    if e.kind() == io::ErrorKind::StorageFull {
        BackupError::OutOfSpace(file_id)
    } else {
        BackupError::Io(e)
    }
}

// ------------------------------------------------------------------------------------------------
// BackupStore
// ------------------------------------------------------------------------------------------------

/// Durable archive of SST files the engine has elected to keep.
pub struct BackupStore {
    dir: PathBuf,
    meta: Arc<MetaStore>,
    entries: Mutex<HashMap<u64, PreservedEntry>>,
}

impl BackupStore {
    /// Open the backup directory, removing incomplete temporaries and
    /// reconciling the on-disk files against the persisted entries.
    ///
    /// An entry whose file is missing is dropped with a warning (the
    /// lineage check will route affected diffs to the fallback path); a
    /// file with no entry is an orphan from a crash mid-preserve and is
    /// removed.
    pub fn open(dir: impl AsRef<Path>, meta: Arc<MetaStore>) -> Result<Self, BackupError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for (key, value) in meta.scan_prefix(BACKUP_PREFIX)? {
            let raw_id = &key[BACKUP_PREFIX.len()..];
            if raw_id.len() != 8 {
                warn!(?key, "malformed backup entry key, skipping");
                continue;
            }
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(raw_id);
            let file_id = u64::from_be_bytes(id_bytes);
            let (entry, _) = PreservedEntry::decode_from(&value)?;
            entries.insert(file_id, entry);
        }

        // Sweep the directory: drop temporaries and orphans.
        let mut present = HashMap::new();
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) == Some("tmp") {
                warn!(path = %path.display(), "removing incomplete backup temporary");
                fs::remove_file(&path)?;
                continue;
            }
            if let Some(file_id) = parse_backup_filename(&path) {
                if entries.contains_key(&file_id) {
                    present.insert(file_id, path);
                } else {
                    warn!(file_id, path = %path.display(), "removing orphaned backup file");
                    fs::remove_file(&path)?;
                }
            }
        }

        // Entries whose file vanished cannot be served.
        let missing: Vec<u64> = entries
            .keys()
            .copied()
            .filter(|id| !present.contains_key(id))
            .collect();
        for file_id in missing {
            warn!(file_id, "preserved SST missing on disk, dropping entry");
            entries.remove(&file_id);
            meta.delete(entry_key(file_id))?;
        }

        info!(
            preserved = entries.len(),
            dir = %dir.display(),
            "backup store opened"
        );
        Ok(Self {
            dir,
            meta,
            entries: Mutex::new(entries),
        })
    }

    /// Path a preserved file lives at for the given mode.
    fn backup_path(&self, file_id: u64, mode: PruneMode) -> PathBuf {
        match mode {
            PruneMode::Full => self.dir.join(format!("{file_id:016x}.sst")),
            PruneMode::Pruned => self.dir.join(format!("{file_id:016x}.pruned.sst")),
        }
    }

    /// Preserve `file_id` from `src`, with `initial_refs` references
    /// (the number of snapshots currently pinning the file).
    ///
    /// Idempotent: preserving an already-preserved file is a no-op, even
    /// with a different mode — the first preserve wins.
    pub fn preserve(
        &self,
        file_id: u64,
        src: &Path,
        mode: PruneMode,
        initial_refs: u32,
    ) -> Result<(), BackupError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;

        if entries.contains_key(&file_id) {
            return Ok(());
        }
        if !src.exists() {
            return Err(BackupError::UnderlyingRead(file_id));
        }

        let dst = self.backup_path(file_id, mode);
        match mode {
            PruneMode::Full => {
                // Hard-link is constant-cost on the same filesystem;
                // fall back to a copy-then-rename across filesystems.
                if let Err(link_err) = fs::hard_link(src, &dst) {
                    if link_err.kind() == io::ErrorKind::AlreadyExists {
                        fs::remove_file(&dst).map_err(|e| map_io(file_id, e))?;
                        fs::hard_link(src, &dst).map_err(|e| map_io(file_id, e))?;
                    } else {
                        debug!(file_id, %link_err, "hard link failed, copying instead");
                        let tmp = dst.with_extension("tmp");
                        fs::copy(src, &tmp).map_err(|e| map_io(file_id, e))?;
                        fs::rename(&tmp, &dst).map_err(|e| map_io(file_id, e))?;
                    }
                }
            }
            PruneMode::Pruned => {
                let table = Sstable::open(src).map_err(|e| match e {
                    SstError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                        BackupError::UnderlyingRead(file_id)
                    }
                    other => BackupError::Sst(other),
                })?;
                let records = table
                    .scan_all()?
                    .collect::<Result<Vec<_>, _>>()?;
                SstWriter::new(&dst)
                    .build_records(records.into_iter(), true)
                    .map_err(|e| match e {
                        SstError::Io(io_err) if io_err.kind() == io::ErrorKind::StorageFull => {
                            BackupError::OutOfSpace(file_id)
                        }
                        other => BackupError::Sst(other),
                    })?;
            }
        }

        let entry = PreservedEntry {
            mode,
            refs: initial_refs,
        };
        self.meta
            .put(entry_key(file_id), encoding::encode_to_vec(&entry)?)?;
        entries.insert(file_id, entry);
        debug!(file_id, ?mode, refs = initial_refs, "SST preserved");
        Ok(())
    }

    /// Add one reference (a snapshot now pins this file).
    pub fn add_ref(&self, file_id: u64) -> Result<(), BackupError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
        let entry = entries
            .get_mut(&file_id)
            .ok_or(BackupError::NotPreserved(file_id))?;
        entry.refs += 1;
        self.meta
            .put(entry_key(file_id), encoding::encode_to_vec(&*entry)?)?;
        Ok(())
    }

    /// Drop one reference; the file is physically deleted when the
    /// count reaches zero. Releasing an unknown file is a no-op.
    pub fn release(&self, file_id: u64) -> Result<(), BackupError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
        let Some(entry) = entries.get_mut(&file_id) else {
            return Ok(());
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            let mode = entry.mode;
            entries.remove(&file_id);
            self.meta.delete(entry_key(file_id))?;
            let path = self.backup_path(file_id, mode);
            if let Err(e) = fs::remove_file(&path) {
                warn!(file_id, %e, "failed to delete released backup file");
            }
            debug!(file_id, "preserved SST released and deleted");
        } else {
            self.meta
                .put(entry_key(file_id), encoding::encode_to_vec(&*entry)?)?;
        }
        Ok(())
    }

    /// Delete a speculative begin-time preserve that ended up unneeded
    /// (the compaction failed or was aborted). Only zero-reference
    /// files are discarded.
    pub fn discard_if_unreferenced(&self, file_id: u64) -> Result<(), BackupError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
        let Some(entry) = entries.get(&file_id) else {
            return Ok(());
        };
        if entry.refs > 0 {
            return Ok(());
        }
        let mode = entry.mode;
        entries.remove(&file_id);
        self.meta.delete(entry_key(file_id))?;
        let path = self.backup_path(file_id, mode);
        if let Err(e) = fs::remove_file(&path) {
            warn!(file_id, %e, "failed to delete discarded backup file");
        }
        debug!(file_id, "speculative preserve discarded");
        Ok(())
    }

    /// True when the file is currently preserved.
    pub fn contains(&self, file_id: u64) -> Result<bool, BackupError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
        Ok(entries.contains_key(&file_id))
    }

    /// Current reference count, or `None` when not preserved.
    pub fn ref_count(&self, file_id: u64) -> Result<Option<u32>, BackupError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
        Ok(entries.get(&file_id).map(|e| e.refs))
    }

    /// Open a preserved file for reading.
    pub fn open_sst(&self, file_id: u64) -> Result<Sstable, BackupError> {
        let mode = {
            let entries = self
                .entries
                .lock()
                .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
            entries
                .get(&file_id)
                .map(|e| e.mode)
                .ok_or(BackupError::NotPreserved(file_id))?
        };
        Sstable::open(self.backup_path(file_id, mode)).map_err(|e| {
            warn!(file_id, %e, "preserved SST failed to open");
            BackupError::Corrupt(file_id)
        })
    }

    /// Every currently preserved file id, unordered.
    pub fn list(&self) -> Result<Vec<u64>, BackupError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BackupError::Internal("mutex poisoned".into()))?;
        Ok(entries.keys().copied().collect())
    }
}

/// Parse `<file_id:016x>.sst` / `<file_id:016x>.pruned.sst`.
fn parse_backup_filename(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name
        .strip_suffix(".pruned.sst")
        .or_else(|| name.strip_suffix(".sst"))?;
    u64::from_str_radix(hex, 16).ok()
}
