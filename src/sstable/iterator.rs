//! SSTable iterators — block-level decode and tombstone-aware scan.
//!
//! Two iterator types live here:
//!
//! - [`BlockIterator`] — decodes a single data block and yields
//!   [`SstCell`] values, with linear in-block seeking.
//! - [`ScanIterator`] — walks data blocks plus the range-tombstone
//!   block, yielding a merged stream of [`SstRecord`] values in
//!   `(key ASC, seqno DESC)` order. This is the tombstone-aware reader
//!   the diff algorithm builds on: point deletes and range deletes are
//!   surfaced, never resolved away.
//!
//! The scan iterator performs no visibility resolution — deciding which
//! record wins at a given snapshot sequence is the diff layer's job.
//!
//! Blocks are decoded lazily, one at a time. Corruption inside a block
//! surfaces as an error from [`ScanIterator::next`]; iteration stops
//! there.

use std::ops::Deref;

use crate::encoding;

use super::{CELL_KIND_DELETE, SstCell, SstError, SstRecord, Sstable};

// ------------------------------------------------------------------------------------------------
// BlockIterator
// ------------------------------------------------------------------------------------------------

/// Iterator over the cells of a single decoded data block.
pub struct BlockIterator {
    /// Raw block payload (concatenated encoded cells).
    data: Vec<u8>,

    /// Cursor into `data`, always at the next cell boundary.
    cursor: usize,
}

impl BlockIterator {
    /// Create an iterator over already-verified block bytes.
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }

    /// Position the cursor on the first cell whose key is ≥
    /// `search_key`. Linear — blocks are small by construction.
    pub(crate) fn seek_to(&mut self, search_key: &[u8]) -> Result<(), SstError> {
        self.cursor = 0;
        while self.cursor < self.data.len() {
            let (cell, consumed) =
                encoding::decode_from_slice::<SstCell>(&self.data[self.cursor..])?;
            if cell.key.as_slice() >= search_key {
                return Ok(());
            }
            self.cursor += consumed;
        }
        Ok(())
    }

    /// Decode and return the next cell, advancing the cursor.
    pub(crate) fn next_cell(&mut self) -> Result<Option<SstCell>, SstError> {
        if self.cursor >= self.data.len() {
            return Ok(None);
        }
        let (cell, consumed) = encoding::decode_from_slice::<SstCell>(&self.data[self.cursor..])?;
        self.cursor += consumed;
        Ok(Some(cell))
    }
}

// ------------------------------------------------------------------------------------------------
// ScanIterator
// ------------------------------------------------------------------------------------------------

/// Tombstone-aware scan over `[start, end)` of one SSTable.
///
/// `end = None` scans to the end of the table. Yields
/// `Result<SstRecord, SstError>` so block corruption mid-scan is
/// reported rather than swallowed.
///
/// Generic over the table handle: borrow (`&Sstable`) for local scans,
/// or any owning pointer (e.g. `Arc<Sstable>`) when the iterator must
/// outlive the caller's frame.
pub struct ScanIterator<S: Deref<Target = Sstable>> {
    table: S,

    /// Index of the data block currently being decoded.
    current_block: usize,

    /// Iterator over the current block, if any point data remains.
    block_iter: Option<BlockIterator>,

    /// Inclusive scan lower bound.
    start: Vec<u8>,

    /// Exclusive scan upper bound; `None` = unbounded.
    end: Option<Vec<u8>>,

    /// Cursor into the table's range-tombstone list.
    range_idx: usize,

    /// Staged next range tombstone.
    next_range: Option<SstRecord>,

    /// Staged next point record.
    next_point: Option<SstRecord>,

    /// Set after a decode error; the iterator is exhausted.
    failed: bool,
}

impl<S: Deref<Target = Sstable>> ScanIterator<S> {
    pub(crate) fn new(table: S, start: Vec<u8>, end: Option<Vec<u8>>) -> Result<Self, SstError> {
        if let Some(end_key) = &end
            && start.as_slice() >= end_key.as_slice()
        {
            return Err(SstError::Internal("scan start >= end".into()));
        }

        let current_block = table.find_block_for_key(&start);
        let block_iter = if current_block < table.index.len() {
            let handle = table.index[current_block].handle;
            let bytes = Sstable::read_block_bytes(&table.mmap, &handle)?;
            let mut it = BlockIterator::new(bytes);
            it.seek_to(&start)?;
            Some(it)
        } else {
            None
        };

        Ok(Self {
            table,
            current_block,
            block_iter,
            start,
            end,
            range_idx: 0,
            next_range: None,
            next_point: None,
            failed: false,
        })
    }

    /// Load the next data block into a fresh [`BlockIterator`].
    fn load_next_block(&mut self) -> Result<bool, SstError> {
        self.current_block += 1;
        if self.current_block >= self.table.index.len() {
            self.block_iter = None;
            return Ok(false);
        }
        let handle = self.table.index[self.current_block].handle;
        let bytes = Sstable::read_block_bytes(&self.table.mmap, &handle)?;
        self.block_iter = Some(BlockIterator::new(bytes));
        Ok(true)
    }

    /// Next point record within the scan bounds, crossing block
    /// boundaries as needed.
    fn next_point_record(&mut self) -> Result<Option<SstRecord>, SstError> {
        loop {
            let Some(it) = self.block_iter.as_mut() else {
                return Ok(None);
            };

            if let Some(cell) = it.next_cell()? {
                if let Some(end) = &self.end
                    && cell.key.as_slice() >= end.as_slice()
                {
                    return Ok(None);
                }

                let record = if cell.kind == CELL_KIND_DELETE {
                    SstRecord::Delete {
                        key: cell.key,
                        seqno: cell.seqno,
                    }
                } else {
                    SstRecord::Put {
                        key: cell.key,
                        seqno: cell.seqno,
                        digest: cell.digest,
                        value: cell.value,
                    }
                };
                return Ok(Some(record));
            }

            if !self.load_next_block()? {
                return Ok(None);
            }
        }
    }

    /// Next range tombstone overlapping the scan bounds.
    fn next_range_record(&mut self) -> Option<SstRecord> {
        while self.range_idx < self.table.range_deletes.len() {
            let r = &self.table.range_deletes[self.range_idx];

            // Entirely left of the window.
            if r.end.as_slice() <= self.start.as_slice() {
                self.range_idx += 1;
                continue;
            }
            // Starts beyond the window.
            if let Some(end) = &self.end
                && r.start.as_slice() >= end.as_slice()
            {
                return None;
            }

            self.range_idx += 1;
            return Some(SstRecord::RangeDelete {
                start: r.start.clone(),
                end: r.end.clone(),
                seqno: r.seqno,
            });
        }
        None
    }
}

impl<S: Deref<Target = Sstable>> Iterator for ScanIterator<S> {
    type Item = Result<SstRecord, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if self.next_range.is_none() {
            self.next_range = self.next_range_record();
        }
        if self.next_point.is_none() {
            match self.next_point_record() {
                Ok(point) => self.next_point = point,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        match (&self.next_range, &self.next_point) {
            (None, None) => None,
            (Some(_), None) => self.next_range.take().map(Ok),
            (None, Some(_)) => self.next_point.take().map(Ok),
            (Some(r), Some(p)) => {
                if r.cmp(p).is_le() {
                    self.next_range.take().map(Ok)
                } else {
                    self.next_point.take().map(Ok)
                }
            }
        }
    }
}
