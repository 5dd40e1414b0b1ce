//! SSTable writer — builds a complete table file from sorted streams.
//!
//! [`SstWriter`] accepts a sorted stream of point mutations plus a
//! sorted stream of range tombstones and writes the full on-disk layout
//! (header, data blocks, range-deletes block, properties, index,
//! footer). Value digests are computed here, at build time, so every
//! put cell carries its blake3 digest regardless of prune mode.
//!
//! # Input requirements
//!
//! - Point entries must be sorted by `(key ASC, seqno DESC)`. Duplicate
//!   keys are allowed — tables may hold several versions of a key.
//! - Range tombstones must be sorted by start key.
//!
//! # Atomicity
//!
//! Everything is written to `path.tmp`, flushed, fsynced, and renamed to
//! `path`. A crash cannot leave a half-written table at the final path.

use std::{
    fs::{OpenOptions, rename},
    io::{BufWriter, Seek, Write},
    mem,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use crc32fast::Hasher as Crc32;

use crate::encoding::{self, Encode};

use super::{
    BlockHandle, CELL_KIND_DELETE, CELL_KIND_PUT, DIGEST_LEN, PointEntry, RangeTombstone,
    SST_BLOCK_MAX_SIZE, SST_FOOTER_SIZE, SST_MAGIC, SST_VERSION, SstCell, SstError,
    SstIndexEntry, SstProperties, SstRangeCell, SstRecord, value_digest,
};

// ------------------------------------------------------------------------------------------------
// BuildStats
// ------------------------------------------------------------------------------------------------

/// Metadata accumulated while streaming cells; becomes the properties
/// block.
struct BuildStats {
    record_count: u64,
    tombstone_count: u64,
    min_seqno: u64,
    max_seqno: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
}

impl BuildStats {
    fn new() -> Self {
        Self {
            record_count: 0,
            tombstone_count: 0,
            min_seqno: u64::MAX,
            max_seqno: 0,
            min_key: None,
            max_key: None,
        }
    }

    fn track_seqno(&mut self, seqno: u64) {
        self.min_seqno = self.min_seqno.min(seqno);
        self.max_seqno = self.max_seqno.max(seqno);
    }

    fn into_properties(self, range_count: u64, pruned: bool) -> SstProperties {
        SstProperties {
            created_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            record_count: self.record_count,
            tombstone_count: self.tombstone_count,
            range_tombstone_count: range_count,
            min_seqno: if self.min_seqno == u64::MAX {
                0
            } else {
                self.min_seqno
            },
            max_seqno: self.max_seqno,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
            pruned,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes a checksummed block: `[len_le (4 B)][data][crc32_le (4 B)]`.
///
/// Returns the handle covering the whole framed block.
fn write_checksummed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, SstError> {
    let offset = writer.stream_position()?;
    let len = data.len() as u32;

    let mut hasher = Crc32::new();
    hasher.update(data);
    let checksum = hasher.finalize();

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (4 + data.len() + 4) as u64,
    })
}

/// Writes the 12-byte header: `[magic (4)][version (4)][crc32 (4)]`.
fn write_header(writer: &mut impl Write) -> Result<(), SstError> {
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&SST_MAGIC);
    bytes.extend_from_slice(&SST_VERSION.to_le_bytes());
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();
    writer.write_all(&bytes)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Flushes the buffered data block and records its index entry.
fn flush_data_block(
    writer: &mut (impl Write + Seek),
    current_block: &mut Vec<u8>,
    block_first_key: &mut Option<Vec<u8>>,
    index_entries: &mut Vec<SstIndexEntry>,
) -> Result<(), SstError> {
    let data = mem::take(current_block);
    let handle = write_checksummed_block(writer, &data)?;
    let separator_key = block_first_key
        .take()
        .ok_or_else(|| SstError::Internal("data block without first key".into()))?;
    index_entries.push(SstIndexEntry {
        separator_key,
        handle,
    });
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// SstWriter
// ------------------------------------------------------------------------------------------------

/// Builds a complete SSTable file on disk.
///
/// ```rust,ignore
/// SstWriter::new(&path).build(points.into_iter(), ranges.into_iter(), false)?;
/// ```
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Create a writer targeting `path`.
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Consume sorted streams of point entries and range tombstones and
    /// write a complete table. With `pruned = true`, value bytes are
    /// dropped and only digests are kept.
    pub fn build(
        self,
        points: impl Iterator<Item = PointEntry>,
        ranges: impl Iterator<Item = RangeTombstone>,
        pruned: bool,
    ) -> Result<(), SstError> {
        let cells = points.map(|entry| {
            let digest = entry
                .value
                .as_deref()
                .map(value_digest)
                .unwrap_or([0u8; DIGEST_LEN]);
            let kind = if entry.value.is_some() {
                CELL_KIND_PUT
            } else {
                CELL_KIND_DELETE
            };
            SstCell {
                kind,
                seqno: entry.seqno,
                key: entry.key,
                digest,
                value: if pruned { None } else { entry.value },
            }
        });
        let range_cells = ranges.map(|r| SstRangeCell {
            start: r.start,
            end: r.end,
            seqno: r.seqno,
        });
        self.build_cells(cells, range_cells, pruned)
    }

    /// Rewrite a record stream (as produced by a
    /// [`ScanIterator`](super::ScanIterator)) into a new table,
    /// preserving the original digests. Used to create value-pruned
    /// backup variants.
    pub fn build_records(
        self,
        records: impl Iterator<Item = SstRecord>,
        pruned: bool,
    ) -> Result<(), SstError> {
        let mut cells = Vec::new();
        let mut range_cells = Vec::new();
        for record in records {
            match record {
                SstRecord::Put {
                    key,
                    seqno,
                    digest,
                    value,
                } => cells.push(SstCell {
                    kind: CELL_KIND_PUT,
                    seqno,
                    key,
                    digest,
                    value: if pruned { None } else { value },
                }),
                SstRecord::Delete { key, seqno } => cells.push(SstCell {
                    kind: CELL_KIND_DELETE,
                    seqno,
                    key,
                    digest: [0u8; DIGEST_LEN],
                    value: None,
                }),
                SstRecord::RangeDelete { start, end, seqno } => range_cells.push(SstRangeCell {
                    start,
                    end,
                    seqno,
                }),
            }
        }
        cells.sort_by(|a, b| a.key.cmp(&b.key).then(b.seqno.cmp(&a.seqno)));
        range_cells.sort_by(|a, b| a.start.cmp(&b.start));
        self.build_cells(cells.into_iter(), range_cells.into_iter(), pruned)
    }

    fn build_cells(
        self,
        cells: impl Iterator<Item = SstCell>,
        ranges: impl Iterator<Item = SstRangeCell>,
        pruned: bool,
    ) -> Result<(), SstError> {
        let mut cells = cells.peekable();
        let range_cells: Vec<SstRangeCell> = ranges.collect();

        if cells.peek().is_none() && range_cells.is_empty() {
            return Err(SstError::Internal(
                "empty input cannot build an SSTable".into(),
            ));
        }

        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // 1. Header.
        write_header(&mut writer)?;

        // 2. Data blocks.
        let mut stats = BuildStats::new();
        let mut index_entries = Vec::new();
        let mut current_block = Vec::<u8>::new();
        let mut block_first_key: Option<Vec<u8>> = None;

        for cell in cells {
            stats.record_count += 1;
            if cell.kind == CELL_KIND_DELETE {
                stats.tombstone_count += 1;
            }
            stats.track_seqno(cell.seqno);
            if stats.min_key.is_none() {
                stats.min_key = Some(cell.key.clone());
            }
            stats.max_key = Some(cell.key.clone());

            if block_first_key.is_none() {
                block_first_key = Some(cell.key.clone());
            }

            cell.encode_to(&mut current_block)?;

            if current_block.len() >= SST_BLOCK_MAX_SIZE {
                flush_data_block(
                    &mut writer,
                    &mut current_block,
                    &mut block_first_key,
                    &mut index_entries,
                )?;
            }
        }
        if !current_block.is_empty() {
            flush_data_block(
                &mut writer,
                &mut current_block,
                &mut block_first_key,
                &mut index_entries,
            )?;
        }

        // 3. Range-deletes block.
        for r in &range_cells {
            stats.track_seqno(r.seqno);
        }
        let mut range_bytes = Vec::new();
        encoding::encode_vec(&range_cells, &mut range_bytes)?;
        let range_handle = write_checksummed_block(&mut writer, &range_bytes)?;

        // 4. Properties block.
        let properties = stats.into_properties(range_cells.len() as u64, pruned);
        let props_bytes = encoding::encode_to_vec(&properties)?;
        let props_handle = write_checksummed_block(&mut writer, &props_bytes)?;

        // 5. Index block.
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&index_entries, &mut index_bytes)?;
        let index_handle = write_checksummed_block(&mut writer, &index_bytes)?;

        // 6. Footer (fixed size; reads file length after flush).
        writer.flush()?;
        drop(writer);

        let body_len = file.metadata()?.len();
        let mut footer = Vec::with_capacity(SST_FOOTER_SIZE);
        range_handle.encode_to(&mut footer)?;
        props_handle.encode_to(&mut footer)?;
        index_handle.encode_to(&mut footer)?;
        (body_len + SST_FOOTER_SIZE as u64).encode_to(&mut footer)?;
        let mut hasher = Crc32::new();
        hasher.update(&footer);
        let crc = hasher.finalize();

        let mut writer = BufWriter::new(&mut file);
        writer.write_all(&footer)?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        drop(file);

        rename(&tmp_path, final_path)?;
        Ok(())
    }
}
