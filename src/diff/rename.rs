//! Rename detection: collapse matching delete/add pairs.
//!
//! A key that was "renamed" between two snapshots shows up in the raw
//! diff as a deleted key and an added key carrying the same value
//! digest. This pass pairs them and rewrites the pair as one renamed
//! event, positioned at the *new* key so the stream stays strictly
//! ascending.
//!
//! Pairing is conservative: a digest that appears with more than one
//! deleted candidate or more than one added candidate is left alone —
//! guessing among several equally-plausible pairings would fabricate
//! history. Under the `SameBucket` policy, candidates must additionally
//! share the key prefix up to the first `/` (keys without a separator
//! all live in the root bucket).

use std::collections::HashMap;

use crate::sstable::Digest;

use super::{DiffEvent, RenameDetection};

/// The bucket of a key: everything up to (and excluding) the first `/`.
/// Keys without a separator share the empty root bucket.
fn bucket(key: &[u8]) -> &[u8] {
    match key.iter().position(|&b| b == b'/') {
        Some(idx) => &key[..idx],
        None => &[],
    }
}

/// Collapse rename pairs in an ascending event stream. With
/// [`RenameDetection::Off`] the input is returned unchanged.
pub fn collapse(events: Vec<DiffEvent>, policy: RenameDetection) -> Vec<DiffEvent> {
    if policy == RenameDetection::Off {
        return events;
    }

    // Index deleted and added candidates by digest.
    let mut deleted: HashMap<Digest, Vec<usize>> = HashMap::new();
    let mut added: HashMap<Digest, Vec<usize>> = HashMap::new();
    for (idx, event) in events.iter().enumerate() {
        match event {
            DiffEvent::Deleted { digest, .. } => deleted.entry(*digest).or_default().push(idx),
            DiffEvent::Added { digest, .. } => added.entry(*digest).or_default().push(idx),
            _ => {}
        }
    }

    // One deleted + one added per digest, or no pairing at all.
    let mut replace: HashMap<usize, usize> = HashMap::new(); // added idx → deleted idx
    for (digest, deleted_idxs) in &deleted {
        let Some(added_idxs) = added.get(digest) else {
            continue;
        };
        if deleted_idxs.len() != 1 || added_idxs.len() != 1 {
            continue;
        }
        let (del_idx, add_idx) = (deleted_idxs[0], added_idxs[0]);
        if policy == RenameDetection::SameBucket
            && bucket(events[del_idx].key()) != bucket(events[add_idx].key())
        {
            continue;
        }
        replace.insert(add_idx, del_idx);
    }

    if replace.is_empty() {
        return events;
    }

    let consumed: std::collections::HashSet<usize> = replace.values().copied().collect();
    let mut out = Vec::with_capacity(events.len());
    for (idx, event) in events.iter().enumerate() {
        if consumed.contains(&idx) {
            continue; // deleted half of a pair
        }
        match replace.get(&idx) {
            Some(&del_idx) => {
                let (DiffEvent::Added { key, digest }, DiffEvent::Deleted { key: prev, .. }) =
                    (&events[idx], &events[del_idx])
                else {
                    continue;
                };
                out.push(DiffEvent::Renamed {
                    key: key.clone(),
                    previous_key: prev.clone(),
                    digest: *digest,
                });
            }
            None => out.push(event.clone()),
        }
    }
    out
}
