//! Generic, CRC-protected write-ahead log.
//!
//! The meta store persists its mutations through this append-only log
//! before applying them in memory. Records are generic over any type
//! implementing the [`crate::encoding`] `Encode`/`Decode` traits, so the
//! same file format serves whatever the caller needs to make durable.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header** — a [`WalHeader`] followed by a 4-byte CRC32.
//! - **Record** — 4-byte little-endian length prefix, encoded record
//!   bytes, then a CRC32 computed over `len || record_bytes`.
//!
//! # Guarantees
//!
//! - **Durability:** every [`Wal::append`] ends with `sync_all()`.
//! - **Integrity:** header and record checksums are verified on replay.
//! - **Corruption detection:** replay stops at the first failed checksum
//!   or truncated tail; everything before it is intact and usable.
//!
//! The file handle is wrapped in a `Mutex`, so a single `Wal` value can
//! be shared by multiple threads.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const WAL_MAGIC: [u8; 4] = *b"SDWL";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_SIZE: usize = 8;
const U32_SIZE: usize = size_of::<u32>();

/// Maximum accepted size for a single record (64 MiB). A length prefix
/// beyond this is treated as corruption.
const WAL_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// WAL header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of the WAL file.
#[derive(Debug)]
struct WalHeader {
    /// Magic constant identifying WAL files (`b"SDWL"`).
    magic: [u8; 4],

    /// On-disk format version.
    version: u32,
}

impl WalHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WAL_HEADER_SIZE);
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf
    }
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// A durable append-only log of `T` records.
///
/// Opening an existing file validates the header; opening a fresh path
/// writes one. Records are replayed with [`Wal::replay`], which returns
/// every record up to the first corruption.
#[derive(Debug)]
pub struct Wal<T> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<T>,
}

impl<T: Encode + Decode> Wal<T> {
    /// Open (or create) a WAL at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let header = WalHeader {
                magic: WAL_MAGIC,
                version: WAL_VERSION,
            };
            let header_bytes = header.encode();
            let mut hasher = Crc32::new();
            hasher.update(&header_bytes);
            let crc = hasher.finalize();

            file.write_all(&header_bytes)?;
            file.write_all(&crc.to_le_bytes())?;
            file.sync_all()?;
            debug!(path = %path.display(), "created new WAL");
        } else {
            Self::validate_header(&mut file)?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            _record: PhantomData,
        })
    }

    fn validate_header(file: &mut File) -> Result<(), WalError> {
        file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = [0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut header_bytes)
            .map_err(|_| WalError::InvalidHeader("truncated header".into()))?;
        let mut crc_bytes = [0u8; U32_SIZE];
        file.read_exact(&mut crc_bytes)
            .map_err(|_| WalError::InvalidHeader("missing header checksum".into()))?;

        let mut hasher = Crc32::new();
        hasher.update(&header_bytes);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return Err(WalError::ChecksumMismatch);
        }
        if header_bytes[..4] != WAL_MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        let version = u32::from_le_bytes([
            header_bytes[4],
            header_bytes[5],
            header_bytes[6],
            header_bytes[7],
        ]);
        if version != WAL_VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        Ok(())
    }

    /// Append one record and fsync.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let bytes = encoding::encode_to_vec(record)?;
        if bytes.len() > WAL_MAX_RECORD_SIZE as usize {
            return Err(WalError::RecordTooLarge(bytes.len()));
        }
        let len = bytes.len() as u32;

        let mut hasher = Crc32::new();
        hasher.update(&len.to_le_bytes());
        hasher.update(&bytes);
        let crc = hasher.finalize();

        let mut file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&bytes)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replay every intact record from the start of the log.
    ///
    /// Stops silently at the first truncated or checksum-failing record;
    /// a torn tail from a crash is expected, not an error.
    pub fn replay(&self) -> Result<Vec<T>, WalError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start((WAL_HEADER_SIZE + U32_SIZE) as u64))?;

        let mut records = Vec::new();
        let mut offset = (WAL_HEADER_SIZE + U32_SIZE) as u64;

        loop {
            if offset + U32_SIZE as u64 > file_len {
                break;
            }
            let mut len_bytes = [0u8; U32_SIZE];
            file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes);
            if len > WAL_MAX_RECORD_SIZE {
                warn!(offset, len, "oversized WAL record length, stopping replay");
                break;
            }
            if offset + (U32_SIZE + len as usize + U32_SIZE) as u64 > file_len {
                warn!(offset, "truncated WAL tail, stopping replay");
                break;
            }

            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload)?;
            let mut crc_bytes = [0u8; U32_SIZE];
            file.read_exact(&mut crc_bytes)?;

            let mut hasher = Crc32::new();
            hasher.update(&len_bytes);
            hasher.update(&payload);
            if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
                warn!(offset, "WAL record checksum mismatch, stopping replay");
                break;
            }

            match encoding::decode_from_slice::<T>(&payload) {
                Ok((record, _)) => records.push(record),
                Err(e) => {
                    warn!(offset, %e, "undecodable WAL record, stopping replay");
                    break;
                }
            }

            offset += (U32_SIZE + len as usize + U32_SIZE) as u64;
        }

        // Reposition at the end for subsequent appends (append mode seeks
        // anyway, but keep the handle predictable).
        file.seek(SeekFrom::End(0))?;
        Ok(records)
    }

    /// Truncate the log back to just its header.
    ///
    /// Called after a checkpoint has made the logged state durable
    /// elsewhere.
    pub fn truncate(&self) -> Result<(), WalError> {
        let file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        file.set_len((WAL_HEADER_SIZE + U32_SIZE) as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// Filesystem path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
