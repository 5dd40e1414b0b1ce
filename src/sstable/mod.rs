//! Sorted String Table (SSTable) module.
//!
//! This module implements the **immutable**, **disk-backed**, sorted
//! table format the diff engine reads and writes: the format of its
//! preserved (backed-up) SSTs, of their value-pruned variants, and of
//! the tables the test harness builds to stand in for a host store.
//!
//! ## Design overview
//!
//! An SSTable stores point records (puts and point tombstones) in sorted
//! data blocks, plus a separate block of range tombstones. Every put
//! cell carries a fixed-width **blake3 digest** of its value, computed
//! at build time. A table built in *pruned* mode keeps key, sequence
//! number, record type, and digest but drops the value bytes — enough
//! for diff classification (added / deleted / modified / renamed) at a
//! fraction of the disk cost, but not for value retrieval.
//!
//! Tombstones are first-class: the [`ScanIterator`] surfaces point
//! deletes and range deletes alongside puts, in key order. The diff
//! algorithm depends on seeing them — a reader that hid tombstones
//! would make a deleted key look absent in both snapshots for the wrong
//! reason.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [RANGE_DELETES_LEN_LE][RANGE_DELETES_BYTES][RANGE_DELETES_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header** — magic, version, CRC32.
//! - **Data blocks** — concatenated encoded [`SstCell`]s, sorted by
//!   `(key ASC, seqno DESC)`, ~4 KiB each, per-block CRC32.
//! - **Range deletes block** — encoded [`SstRangeCell`]s sorted by start
//!   key.
//! - **Properties block** — counts, seqno range, key range, pruned flag.
//! - **Index block** — separator key → data-block handle, enabling
//!   binary search for a scan's start position.
//! - **Footer** — handles of the range/properties/index blocks, total
//!   file size, CRC32.
//!
//! # Concurrency model
//!
//! SSTables are immutable; reads go through a shared `mmap` and are
//! lock-free. Multiple scans over one [`Sstable`] may run concurrently.
//!
//! # Guarantees
//!
//! - **Atomic creation:** files are written to a `.tmp` path and renamed.
//! - **Integrity:** every block and the footer carry CRC32 checksums;
//!   corruption surfaces as [`SstError::ChecksumMismatch`].
//! - **Digest stability:** the digest algorithm (blake3, 32 bytes) is
//!   committed in the format version, so pruned tables written by one
//!   engine version remain comparable in another.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;
pub use iterator::{BlockIterator, ScanIterator};

use std::{fs::File, io, path::Path};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const SST_MAGIC: [u8; 4] = *b"SDF1";
pub(crate) const SST_VERSION: u32 = 1;
pub(crate) const SST_HEADER_SIZE: usize = 12;
pub(crate) const SST_BLOCK_MAX_SIZE: usize = 4096;
pub(crate) const SST_BLOCK_LEN_SIZE: usize = 4;
pub(crate) const SST_BLOCK_CRC_SIZE: usize = 4;
/// Three block handles (offset + size, 16 B each), total size, CRC32.
pub(crate) const SST_FOOTER_SIZE: usize = 3 * 16 + 8 + 4;

/// Width of a value content digest in bytes (blake3).
pub const DIGEST_LEN: usize = 32;

/// A value content digest: blake3 over the raw value bytes.
pub type Digest = [u8; DIGEST_LEN];

/// Digest of `value` as stored in put cells.
pub fn value_digest(value: &[u8]) -> Digest {
    *blake3::hash(value).as_bytes()
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// The file is not an SSTable or uses an unsupported version.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Record model
// ------------------------------------------------------------------------------------------------

/// One record yielded by the tombstone-aware reader.
///
/// Ordered by `(key ASC, seqno DESC)` — for a given key the most recent
/// version sorts first. Range deletes order by their start key.
#[derive(Debug, Clone)]
pub enum SstRecord {
    /// A live key version. `value` is `None` when read from a pruned
    /// table; the digest is always present.
    Put {
        key: Vec<u8>,
        seqno: u64,
        digest: Digest,
        value: Option<Vec<u8>>,
    },

    /// A point tombstone for `key`.
    Delete { key: Vec<u8>, seqno: u64 },

    /// A range tombstone covering `[start, end)`.
    RangeDelete {
        start: Vec<u8>,
        end: Vec<u8>,
        seqno: u64,
    },
}

impl SstRecord {
    /// Sequence number of this record.
    pub fn seqno(&self) -> u64 {
        match self {
            SstRecord::Put { seqno, .. } => *seqno,
            SstRecord::Delete { seqno, .. } => *seqno,
            SstRecord::RangeDelete { seqno, .. } => *seqno,
        }
    }

    /// Ordering key of this record; the **start** key for range deletes.
    pub fn key(&self) -> &[u8] {
        match self {
            SstRecord::Put { key, .. } => key,
            SstRecord::Delete { key, .. } => key,
            SstRecord::RangeDelete { start, .. } => start,
        }
    }
}

impl PartialEq for SstRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.seqno() == other.seqno()
    }
}

impl Eq for SstRecord {}

impl PartialOrd for SstRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SstRecord {
    /// Compares by `(key ASC, seqno DESC)` so the newest version of a
    /// key is seen first during merge iteration.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.key().cmp(other.key()) {
            std::cmp::Ordering::Equal => other.seqno().cmp(&self.seqno()),
            ord => ord,
        }
    }
}

/// A point mutation fed to [`SstWriter`]: a put (`value = Some`) or a
/// point tombstone (`value = None`).
#[derive(Debug, Clone)]
pub struct PointEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seqno: u64,
}

impl PointEntry {
    /// A put entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, seqno: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            seqno,
        }
    }

    /// A point tombstone.
    pub fn delete(key: impl Into<Vec<u8>>, seqno: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            seqno,
        }
    }
}

/// A range tombstone fed to [`SstWriter`], deleting `[start, end)`.
#[derive(Debug, Clone)]
pub struct RangeTombstone {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub seqno: u64,
}

impl RangeTombstone {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>, seqno: u64) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            seqno,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk structures
// ------------------------------------------------------------------------------------------------

/// A `(offset, size)` pair locating a checksummed block in the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (off, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { offset: off, size }, offset))
    }
}

/// One point cell inside a data block.
///
/// `kind` is `0` for a put, `1` for a point tombstone. Put cells carry
/// the value digest and (unless the table is pruned) the value bytes.
#[derive(Debug, Clone)]
pub(crate) struct SstCell {
    pub(crate) kind: u8,
    pub(crate) seqno: u64,
    pub(crate) key: Vec<u8>,
    pub(crate) digest: Digest,
    pub(crate) value: Option<Vec<u8>>,
}

pub(crate) const CELL_KIND_PUT: u8 = 0;
pub(crate) const CELL_KIND_DELETE: u8 = 1;

impl Encode for SstCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.kind.encode_to(buf)?;
        self.seqno.encode_to(buf)?;
        self.key.encode_to(buf)?;
        if self.kind == CELL_KIND_PUT {
            self.digest.encode_to(buf)?;
            self.value.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for SstCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (kind, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (seqno, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;

        let (digest, value) = if kind == CELL_KIND_PUT {
            let (digest, n) = <Digest>::decode_from(&buf[offset..])?;
            offset += n;
            let (value, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
            offset += n;
            (digest, value)
        } else {
            ([0u8; DIGEST_LEN], None)
        };

        Ok((
            Self {
                kind,
                seqno,
                key,
                digest,
                value,
            },
            offset,
        ))
    }
}

/// One range tombstone inside the range-deletes block.
#[derive(Debug, Clone)]
pub(crate) struct SstRangeCell {
    pub(crate) start: Vec<u8>,
    pub(crate) end: Vec<u8>,
    pub(crate) seqno: u64,
}

impl Encode for SstRangeCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.start.encode_to(buf)?;
        self.end.encode_to(buf)?;
        self.seqno.encode_to(buf)
    }
}

impl Decode for SstRangeCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (start, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (end, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (seqno, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { start, end, seqno }, offset))
    }
}

/// Table-level metadata stored in the properties block.
#[derive(Debug, Clone, Default)]
pub struct SstProperties {
    /// Creation time, milliseconds since UNIX epoch.
    pub created_ms: u64,

    /// Total point records (puts + point tombstones).
    pub record_count: u64,

    /// Number of point tombstones.
    pub tombstone_count: u64,

    /// Number of range tombstones.
    pub range_tombstone_count: u64,

    /// Minimum sequence number in the table.
    pub min_seqno: u64,

    /// Maximum sequence number in the table.
    pub max_seqno: u64,

    /// Smallest point key (empty when the table has no point records).
    pub min_key: Vec<u8>,

    /// Largest point key.
    pub max_key: Vec<u8>,

    /// True when value bytes were dropped at build time.
    pub pruned: bool,
}

impl Encode for SstProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.created_ms.encode_to(buf)?;
        self.record_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.range_tombstone_count.encode_to(buf)?;
        self.min_seqno.encode_to(buf)?;
        self.max_seqno.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.pruned.encode_to(buf)
    }
}

impl Decode for SstProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (created_ms, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (record_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tombstone_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (range_tombstone_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_seqno, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_seqno, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (pruned, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                created_ms,
                record_count,
                tombstone_count,
                range_tombstone_count,
                min_seqno,
                max_seqno,
                min_key,
                max_key,
                pruned,
            },
            offset,
        ))
    }
}

/// One entry of the index block: the first key of a data block plus the
/// block's handle.
#[derive(Debug, Clone)]
pub(crate) struct SstIndexEntry {
    pub(crate) separator_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

impl Encode for SstIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.separator_key.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for SstIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (separator_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (handle, n) = BlockHandle::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                separator_key,
                handle,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Sstable — read handle
// ------------------------------------------------------------------------------------------------

/// An open, memory-mapped SSTable.
#[derive(Debug)]
pub struct Sstable {
    pub(crate) mmap: Mmap,
    pub(crate) index: Vec<SstIndexEntry>,
    pub(crate) range_deletes: Vec<SstRangeCell>,

    /// Table-level metadata.
    pub properties: SstProperties,

    file_size: u64,
}

impl Sstable {
    /// Open an SSTable, validating header, footer, and the metadata
    /// blocks' checksums. Data blocks are verified lazily as they are
    /// read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let file = File::open(path.as_ref())?;
        let file_size = file.metadata()?.len();
        if (file_size as usize) < SST_HEADER_SIZE + SST_FOOTER_SIZE {
            return Err(SstError::InvalidFormat("file too short".into()));
        }
        // Safety: the file is immutable once written (write-then-rename
        // creation, never modified in place).
        let mmap = unsafe { Mmap::map(&file)? };

        // Header: [magic (4)][version (4)][crc (4)].
        let header = &mmap[..SST_HEADER_SIZE];
        let mut hasher = Crc32::new();
        hasher.update(&header[..8]);
        let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if hasher.finalize() != crc {
            return Err(SstError::ChecksumMismatch);
        }
        if header[..4] != SST_MAGIC {
            return Err(SstError::InvalidFormat("bad magic".into()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != SST_VERSION {
            return Err(SstError::InvalidFormat(format!(
                "unsupported version {version}"
            )));
        }

        // Footer.
        let footer_start = file_size as usize - SST_FOOTER_SIZE;
        let footer = &mmap[footer_start..];
        let mut hasher = Crc32::new();
        hasher.update(&footer[..SST_FOOTER_SIZE - 4]);
        let footer_crc = u32::from_le_bytes([
            footer[SST_FOOTER_SIZE - 4],
            footer[SST_FOOTER_SIZE - 3],
            footer[SST_FOOTER_SIZE - 2],
            footer[SST_FOOTER_SIZE - 1],
        ]);
        if hasher.finalize() != footer_crc {
            return Err(SstError::ChecksumMismatch);
        }

        let mut offset = 0;
        let (range_handle, n) = BlockHandle::decode_from(&footer[offset..])?;
        offset += n;
        let (props_handle, n) = BlockHandle::decode_from(&footer[offset..])?;
        offset += n;
        let (index_handle, n) = BlockHandle::decode_from(&footer[offset..])?;
        offset += n;
        let (total_size, _) = u64::decode_from(&footer[offset..])?;
        if total_size != file_size {
            return Err(SstError::InvalidFormat(format!(
                "size mismatch: footer says {total_size}, file is {file_size}"
            )));
        }

        let range_bytes = Self::read_block_bytes(&mmap, &range_handle)?;
        let (range_deletes, _) = encoding::decode_vec::<SstRangeCell>(&range_bytes)?;

        let props_bytes = Self::read_block_bytes(&mmap, &props_handle)?;
        let (properties, _) = SstProperties::decode_from(&props_bytes)?;

        let index_bytes = Self::read_block_bytes(&mmap, &index_handle)?;
        let (index, _) = encoding::decode_vec::<SstIndexEntry>(&index_bytes)?;

        Ok(Self {
            mmap,
            index,
            range_deletes,
            properties,
            file_size,
        })
    }

    /// Read and checksum-verify the payload of one block.
    pub(crate) fn read_block_bytes(mmap: &Mmap, handle: &BlockHandle) -> Result<Vec<u8>, SstError> {
        let start = handle.offset as usize;
        let end = start + handle.size as usize;
        if end > mmap.len() {
            return Err(SstError::InvalidFormat("block handle out of bounds".into()));
        }
        let raw = &mmap[start..end];
        if raw.len() < SST_BLOCK_LEN_SIZE + SST_BLOCK_CRC_SIZE {
            return Err(SstError::InvalidFormat("block too short".into()));
        }

        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if SST_BLOCK_LEN_SIZE + len + SST_BLOCK_CRC_SIZE != raw.len() {
            return Err(SstError::InvalidFormat("block length mismatch".into()));
        }
        let payload = &raw[SST_BLOCK_LEN_SIZE..SST_BLOCK_LEN_SIZE + len];
        let crc_off = SST_BLOCK_LEN_SIZE + len;
        let expected = u32::from_le_bytes([
            raw[crc_off],
            raw[crc_off + 1],
            raw[crc_off + 2],
            raw[crc_off + 3],
        ]);
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != expected {
            return Err(SstError::ChecksumMismatch);
        }
        Ok(payload.to_vec())
    }

    /// Index of the data block that may contain `key` (the last block
    /// whose separator key is ≤ `key`).
    pub(crate) fn find_block_for_key(&self, key: &[u8]) -> usize {
        match self
            .index
            .binary_search_by(|entry| entry.separator_key.as_slice().cmp(key))
        {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        }
    }

    /// Tombstone-aware scan of `[start, end)`; `end = None` scans to the
    /// end of the table. Single-pass, lazy, key-ordered.
    pub fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<ScanIterator<&Sstable>, SstError> {
        ScanIterator::new(self, start.to_vec(), end.map(<[u8]>::to_vec))
    }

    /// Scan every record in the table.
    pub fn scan_all(&self) -> Result<ScanIterator<&Sstable>, SstError> {
        self.scan(&[], None)
    }

    /// Like [`Sstable::scan`], but the iterator owns the table handle
    /// and can outlive the caller's frame.
    pub fn scan_arc(
        table: std::sync::Arc<Sstable>,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<ScanIterator<std::sync::Arc<Sstable>>, SstError> {
        ScanIterator::new(table, start.to_vec(), end.map(<[u8]>::to_vec))
    }

    /// Bounded probe for a single key: all records whose key equals
    /// `key` (plus any range tombstones overlapping it).
    pub fn probe(&self, key: &[u8]) -> Result<ScanIterator<&Sstable>, SstError> {
        let mut end = key.to_vec();
        end.push(0x00);
        ScanIterator::new(self, key.to_vec(), Some(end))
    }

    /// True when `key` falls inside this table's point-key range.
    pub fn covers_key(&self, key: &[u8]) -> bool {
        self.properties.record_count > 0
            && self.properties.min_key.as_slice() <= key
            && key <= self.properties.max_key.as_slice()
    }

    /// True when any range tombstone in this table covers `key`.
    pub fn range_covers(&self, key: &[u8]) -> bool {
        self.range_deletes
            .iter()
            .any(|r| r.start.as_slice() <= key && key < r.end.as_slice())
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}
