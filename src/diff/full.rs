//! Full-scan fallback: ordered co-walk over both snapshot namespaces.
//!
//! When compaction lineage has been pruned, degraded, or never
//! recorded, the fast path declines and this path produces the same
//! diff stream from first principles: two key-ordered iterators over
//! the snapshots' full namespaces (supplied by the host), advanced in
//! lock-step, classifying each step exactly as the fast path does.
//!
//! Rename detection is not performed here — pairing deletes with adds
//! would require buffering the whole stream for what is already the
//! expensive path.
//!
//! Cost is `O(|keys_from| + |keys_to|)`; the job's metadata records
//! `algorithm: Fallback` so operators can spot a pattern of fallbacks
//! (usually a sign the retention horizon is too short).

use std::sync::Arc;

use tracing::info;

use crate::host::{LsmHost, SnapshotIter};
use crate::snapshots::SnapshotEntry;
use crate::sstable::Digest;

use super::{DiffControl, DiffError, DiffEvent, KeyState, classify};

/// Pull the next `(key, digest)` pair, mapping host errors.
fn advance(iter: &mut SnapshotIter) -> Result<Option<(Vec<u8>, Digest)>, DiffError> {
    match iter.next() {
        None => Ok(None),
        Some(Ok(pair)) => Ok(Some(pair)),
        Some(Err(e)) => Err(DiffError::Host(e)),
    }
}

/// Run the full-scan diff from `from` to `to`, streaming events into
/// `emit` in strictly ascending key order.
pub fn run(
    host: &Arc<dyn LsmHost>,
    from: &SnapshotEntry,
    to: &SnapshotEntry,
    control: &mut DiffControl,
    emit: &mut dyn FnMut(DiffEvent) -> Result<(), DiffError>,
) -> Result<(), DiffError> {
    info!(from = from.id, to = to.id, "full-scan diff started");

    let mut from_iter = host.open_snapshot_iter(from.id)?;
    let mut to_iter = host.open_snapshot_iter(to.id)?;

    let mut from_cur = advance(&mut from_iter)?;
    let mut to_cur = advance(&mut to_iter)?;

    loop {
        // Classify the current pair, then advance outside the borrow.
        let (advance_from, advance_to) = match (&from_cur, &to_cur) {
            (None, None) => break,

            (Some((key, digest)), None) => {
                control.tick_key()?;
                if let Some(event) = classify(key, KeyState::Present(*digest), KeyState::Absent) {
                    emit(event)?;
                }
                (true, false)
            }

            (None, Some((key, digest))) => {
                control.tick_key()?;
                if let Some(event) = classify(key, KeyState::Absent, KeyState::Present(*digest)) {
                    emit(event)?;
                }
                (false, true)
            }

            (Some((from_key, from_digest)), Some((to_key, to_digest))) => {
                control.tick_key()?;
                match from_key.cmp(to_key) {
                    std::cmp::Ordering::Less => {
                        if let Some(event) =
                            classify(from_key, KeyState::Present(*from_digest), KeyState::Absent)
                        {
                            emit(event)?;
                        }
                        (true, false)
                    }
                    std::cmp::Ordering::Greater => {
                        if let Some(event) =
                            classify(to_key, KeyState::Absent, KeyState::Present(*to_digest))
                        {
                            emit(event)?;
                        }
                        (false, true)
                    }
                    std::cmp::Ordering::Equal => {
                        if let Some(event) = classify(
                            from_key,
                            KeyState::Present(*from_digest),
                            KeyState::Present(*to_digest),
                        ) {
                            emit(event)?;
                        }
                        (true, true)
                    }
                }
            }
        };

        if advance_from {
            from_cur = advance(&mut from_iter)?;
        }
        if advance_to {
            to_cur = advance(&mut to_iter)?;
        }
    }

    Ok(())
}
