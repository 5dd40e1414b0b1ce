//! # Meta Store
//!
//! The meta store is the persistence authority for everything the diff
//! engine owns: compaction records, the snapshot SST map, diff jobs,
//! result pages, and backup reference counts. It is a small
//! prefix-namespaced key-value store with a **WAL + periodic snapshot**
//! durability model:
//!
//! 1. **Mutation log** (`meta.wal`) — every [`Batch`] of operations is
//!    appended (and fsynced) before being applied to the in-memory map.
//!    A batch is one WAL record, so multi-key updates are atomic: after
//!    a crash either the whole batch replays or none of it does.
//! 2. **Checkpoint** (`CHECKPOINT`) — a compact encoded dump of the full
//!    map, CRC-protected, written atomically (`.tmp` → rename). After a
//!    successful checkpoint the WAL is truncated.
//! 3. **Startup** — load the checkpoint if present (a corrupt checkpoint
//!    is a hard error), then replay the WAL. Replay stops at the first
//!    torn or checksum-failing record; committed state survives.
//!
//! Key namespaces are plain byte prefixes (`cr/`, `sn/`, `job/`, `res/`,
//! `bk/`, `dg/`); [`MetaStore::scan_prefix`] returns a sorted snapshot of
//! one namespace.
//!
//! ## Thread safety
//!
//! The map is wrapped in an `RwLock`; the WAL is internally synchronized.
//! Writers append to the WAL first, then take the write lock to apply.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

const CHECKPOINT_FILENAME: &str = "CHECKPOINT";
const CHECKPOINT_TMP_SUFFIX: &str = "tmp";
const CHECKPOINT_MAGIC: [u8; 4] = *b"SDCK";
const WAL_FILENAME: &str = "meta.wal";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by meta-store operations.
#[derive(Debug, Error)]
pub enum MetaStoreError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The checkpoint file is corrupted or its checksum mismatched.
    #[error("Checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Batch operations
// ------------------------------------------------------------------------------------------------

/// A single mutation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key` with `value`.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key` (no-op if absent).
    Delete { key: Vec<u8> },
}

/// An atomic group of mutations: persisted as one WAL record.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Encode for BatchOp {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            BatchOp::Put { key, value } => {
                0u32.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
            }
            BatchOp::Delete { key } => {
                1u32.encode_to(buf)?;
                key.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for BatchOp {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((BatchOp::Put { key, value }, offset))
            }
            1 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((BatchOp::Delete { key }, offset))
            }
            tag => Err(EncodingError::InvalidTag {
                tag,
                type_name: "BatchOp",
            }),
        }
    }
}

impl Encode for Batch {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.ops, buf)
    }
}

impl Decode for Batch {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (ops, n) = encoding::decode_vec::<BatchOp>(buf)?;
        Ok((Self { ops }, n))
    }
}

// ------------------------------------------------------------------------------------------------
// MetaStore
// ------------------------------------------------------------------------------------------------

/// Prefix-namespaced persistent key-value store.
///
/// See the module documentation for the durability model.
pub struct MetaStore {
    dir: PathBuf,
    wal: Wal<Batch>,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MetaStore {
    /// Open (or create) a meta store rooted at `dir`.
    ///
    /// Loads the checkpoint if one exists, then replays the WAL on top
    /// of it. A corrupt checkpoint is fatal
    /// ([`MetaStoreError::CheckpointCorrupt`]); a torn WAL tail is not.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MetaStoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // Remove a checkpoint temp left behind by a crash mid-rename.
        let tmp = dir
            .join(CHECKPOINT_FILENAME)
            .with_extension(CHECKPOINT_TMP_SUFFIX);
        if tmp.exists() {
            warn!(path = %tmp.display(), "removing stale checkpoint temp");
            fs::remove_file(&tmp)?;
        }

        let mut map = BTreeMap::new();
        let checkpoint_path = dir.join(CHECKPOINT_FILENAME);
        if checkpoint_path.exists() {
            map = Self::load_checkpoint(&checkpoint_path)?;
            debug!(entries = map.len(), "loaded meta-store checkpoint");
        }

        let wal = Wal::open(dir.join(WAL_FILENAME))?;
        let batches = wal.replay()?;
        let replayed = batches.len();
        for batch in batches {
            Self::apply_to_map(&mut map, &batch);
        }
        info!(
            entries = map.len(),
            replayed_batches = replayed,
            dir = %dir.display(),
            "meta store opened"
        );

        Ok(Self {
            dir,
            wal,
            map: RwLock::new(map),
        })
    }

    fn apply_to_map(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: &Batch) {
        for op in &batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    map.remove(key);
                }
            }
        }
    }

    /// Read one key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaStoreError> {
        let map = self
            .map
            .read()
            .map_err(|_| MetaStoreError::Internal("RwLock poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    /// Write one key (a single-op batch).
    pub fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), MetaStoreError> {
        let mut batch = Batch::new();
        batch.put(key, value);
        self.apply_batch(batch)
    }

    /// Delete one key (a single-op batch).
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<(), MetaStoreError> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.apply_batch(batch)
    }

    /// Apply a batch atomically: one WAL record, then the in-memory map.
    pub fn apply_batch(&self, batch: Batch) -> Result<(), MetaStoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.wal.append(&batch)?;
        let mut map = self
            .map
            .write()
            .map_err(|_| MetaStoreError::Internal("RwLock poisoned".into()))?;
        Self::apply_to_map(&mut map, &batch);
        Ok(())
    }

    /// Sorted snapshot of every `(key, value)` pair under `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaStoreError> {
        let map = self
            .map
            .read()
            .map_err(|_| MetaStoreError::Internal("RwLock poisoned".into()))?;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Number of keys currently stored (all namespaces).
    pub fn len(&self) -> Result<usize, MetaStoreError> {
        let map = self
            .map
            .read()
            .map_err(|_| MetaStoreError::Internal("RwLock poisoned".into()))?;
        Ok(map.len())
    }

    /// True when the store holds no keys.
    pub fn is_empty(&self) -> Result<bool, MetaStoreError> {
        Ok(self.len()? == 0)
    }

    /// Write a checkpoint and truncate the WAL.
    ///
    /// Layout: `[magic][u64 entry_count][key][value]…[crc32_le]`, written
    /// to a temp file and renamed into place.
    pub fn checkpoint(&self) -> Result<(), MetaStoreError> {
        let map = self
            .map
            .read()
            .map_err(|_| MetaStoreError::Internal("RwLock poisoned".into()))?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&CHECKPOINT_MAGIC);
        (map.len() as u64).encode_to(&mut payload)?;
        for (key, value) in map.iter() {
            key.encode_to(&mut payload)?;
            value.encode_to(&mut payload)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let final_path = self.dir.join(CHECKPOINT_FILENAME);
        let tmp_path = final_path.with_extension(CHECKPOINT_TMP_SUFFIX);
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.write_all(&crc.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        // Fsync the directory so the rename itself is durable.
        if let Ok(dir) = File::open(&self.dir) {
            dir.sync_all()?;
        }

        self.wal.truncate()?;
        debug!(entries = map.len(), "meta-store checkpoint written");
        Ok(())
    }

    fn load_checkpoint(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, MetaStoreError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        if bytes.len() < CHECKPOINT_MAGIC.len() + 4 {
            return Err(MetaStoreError::CheckpointCorrupt("file too short".into()));
        }

        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut hasher = Crc32::new();
        hasher.update(payload);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if hasher.finalize() != expected {
            return Err(MetaStoreError::CheckpointCorrupt(
                "checksum mismatch".into(),
            ));
        }
        if payload[..CHECKPOINT_MAGIC.len()] != CHECKPOINT_MAGIC {
            return Err(MetaStoreError::CheckpointCorrupt("bad magic".into()));
        }

        let mut offset = CHECKPOINT_MAGIC.len();
        let (count, n) = u64::decode_from(&payload[offset..])
            .map_err(|e| MetaStoreError::CheckpointCorrupt(e.to_string()))?;
        offset += n;

        let mut map = BTreeMap::new();
        for _ in 0..count {
            let (key, n) = Vec::<u8>::decode_from(&payload[offset..])
                .map_err(|e| MetaStoreError::CheckpointCorrupt(e.to_string()))?;
            offset += n;
            let (value, n) = Vec::<u8>::decode_from(&payload[offset..])
                .map_err(|e| MetaStoreError::CheckpointCorrupt(e.to_string()))?;
            offset += n;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
