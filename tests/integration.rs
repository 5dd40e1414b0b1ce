//! End-to-end scenarios driven through the public engine surface with
//! a miniature LSM host (see `harness`).
//!
//! ## Coverage areas
//! - **Scenario 1**: add / delete / modify across one compaction (fast path)
//! - **Scenario 2**: identity diff is empty
//! - **Scenario 3**: fallback after pruned lineage, correct per full scan
//! - **Scenario 4**: rename detection on and off
//! - **Scenario 5**: cooperative cancellation mid-run
//! - **Scenario 6**: reverse-order diff classified literally
//! - **Boundaries**: empty snapshot, budget exhaustion, deadlines,
//!   dedup of identical submits, range deletes without compaction
//! - **Equivalence**: fast path ≡ full scan on a mixed workload
//! - **Durability**: results and lineage survive engine restart;
//!   snapshot deletion releases preserved files

mod harness;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use harness::MiniLsm;
use snapdiff::jobs::JobFailure;
use snapdiff::sstable::value_digest;
use snapdiff::{
    DiffAlgorithm, DiffConfig, DiffEngine, DiffEvent, DiffOptions, EngineError, JobRecord,
    JobState, PruneMode, RenameDetection,
};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn test_config() -> DiffConfig {
    DiffConfig {
        max_concurrent_jobs: 2,
        cancel_check_interval: 16,
        ..DiffConfig::default()
    }
}

fn open_engine(tmp: &TempDir, host: Arc<MiniLsm>, config: DiffConfig) -> DiffEngine {
    DiffEngine::open(tmp.path().join("engine"), host, config).unwrap()
}

/// Declare a snapshot on the host, then let the engine capture it.
fn snap(host: &MiniLsm, engine: &DiffEngine, id: u64, prev: Option<u64>) {
    host.declare_snapshot(id);
    engine.snapshot_created(id, prev).unwrap();
}

fn await_terminal(engine: &DiffEngine, job_id: u64) -> JobRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let record = engine.get_status(job_id).unwrap();
        if record.state.is_terminal() {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} did not reach a terminal state in time"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn collect_results(engine: &DiffEngine, job_id: u64) -> Vec<DiffEvent> {
    let mut events = Vec::new();
    let mut cursor = 0u64;
    loop {
        let (page, next) = engine.list_results(job_id, cursor, 7).unwrap();
        events.extend(page);
        match next {
            Some(c) => cursor = c,
            None => return events,
        }
    }
}

fn run_diff(engine: &DiffEngine, from: u64, to: u64, options: DiffOptions) -> JobRecord {
    let job_id = engine.submit_diff(from, to, options, "test").unwrap();
    await_terminal(engine, job_id)
}

/// Ground-truth diff of two frozen host views, classified exactly like
/// the engine classifies (rename detection off).
fn oracle_diff(
    from: &BTreeMap<Vec<u8>, Vec<u8>>,
    to: &BTreeMap<Vec<u8>, Vec<u8>>,
) -> Vec<DiffEvent> {
    let mut keys: Vec<&Vec<u8>> = from.keys().chain(to.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut events = Vec::new();
    for key in keys {
        match (from.get(key), to.get(key)) {
            (None, Some(v)) => events.push(DiffEvent::Added {
                key: key.clone(),
                digest: value_digest(v),
            }),
            (Some(v), None) => events.push(DiffEvent::Deleted {
                key: key.clone(),
                digest: value_digest(v),
            }),
            (Some(a), Some(b)) if a != b => events.push(DiffEvent::Modified {
                key: key.clone(),
                old_digest: value_digest(a),
                new_digest: value_digest(b),
            }),
            _ => {}
        }
    }
    events
}

fn assert_ascending(events: &[DiffEvent]) {
    for pair in events.windows(2) {
        assert!(
            pair[0].key() < pair[1].key(),
            "events must be strictly ascending by key"
        );
    }
}

// ================================================================================================
// Scenario 1 — add / delete / modify across one compaction
// ================================================================================================

/// # Scenario
/// Snapshot A holds `{a:1, b:2, c:3}` in one SST. Between A and B:
/// `a` is overwritten, `b` deleted, `d` added; the memtable flushes and
/// a full compaction merges both files, dropping `b`'s tombstone.
///
/// # Expectation
/// Fast path (lineage complete); events `MODIFIED(a)`, `DELETED(b)`,
/// `ADDED(d)` in key order.
#[test]
fn scenario_add_delete_modify_across_one_compaction() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());
    let listener = engine.listener();

    host.put("a", "1");
    host.put("b", "2");
    host.put("c", "3");
    snap(&host, &engine, 1, None);

    host.put("a", "11");
    host.delete("b");
    host.put("d", "4");
    host.flush();
    host.compact_all(Some(&listener));
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.algorithm, Some(DiffAlgorithm::Fast));

    let events = collect_results(&engine, record.job_id);
    assert_ascending(&events);
    assert_eq!(events, oracle_diff(&host.view(1), &host.view(2)));
    assert_eq!(
        events,
        vec![
            DiffEvent::Modified {
                key: b"a".to_vec(),
                old_digest: value_digest(b"1"),
                new_digest: value_digest(b"11"),
            },
            DiffEvent::Deleted {
                key: b"b".to_vec(),
                digest: value_digest(b"2"),
            },
            DiffEvent::Added {
                key: b"d".to_vec(),
                digest: value_digest(b"4"),
            },
        ]
    );

    engine.close().unwrap();
}

// ================================================================================================
// Scenario 2 — identity
// ================================================================================================

#[test]
fn scenario_identity_diff_is_empty() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    host.put("k", "v");
    snap(&host, &engine, 1, None);
    snap(&host, &engine, 2, Some(1)); // no writes in between

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.algorithm, Some(DiffAlgorithm::Fast));
    assert_eq!(record.total_events, 0);
    assert!(collect_results(&engine, record.job_id).is_empty());

    engine.close().unwrap();
}

// ================================================================================================
// Scenario 3 — fallback after pruned lineage
// ================================================================================================

/// A compaction runs without the listener (as if its record had been
/// GC'd and the inputs never preserved): the fast path must decline and
/// the fallback must still produce the correct diff — with the switch
/// visible only as `algorithm: Fallback`.
#[test]
fn scenario_fallback_after_pruned_lineage() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    for i in 0..20 {
        host.put(format!("key_{i:02}"), format!("v{i}"));
    }
    snap(&host, &engine, 1, None);

    host.put("key_03", "changed");
    host.delete("key_07");
    host.put("new_key", "fresh");
    host.flush();
    host.compact_all(None); // lineage never captured
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.algorithm, Some(DiffAlgorithm::Fallback));
    assert!(record.failure.is_none());

    let events = collect_results(&engine, record.job_id);
    assert_ascending(&events);
    assert_eq!(events, oracle_diff(&host.view(1), &host.view(2)));

    engine.close().unwrap();
}

// ================================================================================================
// Scenario 4 — rename detection
// ================================================================================================

#[test]
fn scenario_rename_detection_on_and_off() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    host.put("old-key", "v");
    snap(&host, &engine, 1, None);

    host.put("new-key", "v");
    host.delete("old-key");
    snap(&host, &engine, 2, Some(1));

    // With pairing: one renamed event at the new key.
    let on = run_diff(
        &engine,
        1,
        2,
        DiffOptions {
            rename_detection: Some(RenameDetection::SameBucket),
            ..DiffOptions::default()
        },
    );
    assert_eq!(on.state, JobState::Done);
    let events = collect_results(&engine, on.job_id);
    assert_eq!(
        events,
        vec![DiffEvent::Renamed {
            key: b"new-key".to_vec(),
            previous_key: b"old-key".to_vec(),
            digest: value_digest(b"v"),
        }]
    );

    // Without: the raw delete + add pair.
    let off = run_diff(
        &engine,
        1,
        2,
        DiffOptions {
            rename_detection: Some(RenameDetection::Off),
            ..DiffOptions::default()
        },
    );
    let events = collect_results(&engine, off.job_id);
    assert_eq!(
        events,
        vec![
            DiffEvent::Added {
                key: b"new-key".to_vec(),
                digest: value_digest(b"v"),
            },
            DiffEvent::Deleted {
                key: b"old-key".to_vec(),
                digest: value_digest(b"v"),
            },
        ]
    );

    engine.close().unwrap();
}

/// The bucket is the key prefix up to the *first* `/`: a move between
/// sub-directories of one bucket pairs, a move across buckets does not.
#[test]
fn same_bucket_rename_spans_subdirectories() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    host.put("vol/a/x", "payload");
    host.put("red/x", "pigment");
    snap(&host, &engine, 1, None);

    host.put("vol/b/x", "payload");
    host.delete("vol/a/x");
    host.put("blue/x", "pigment");
    host.delete("red/x");
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(
        &engine,
        1,
        2,
        DiffOptions {
            rename_detection: Some(RenameDetection::SameBucket),
            ..DiffOptions::default()
        },
    );
    assert_eq!(record.state, JobState::Done);

    let events = collect_results(&engine, record.job_id);
    assert_eq!(
        events,
        vec![
            // `red/x` → `blue/x` crosses buckets: no pairing.
            DiffEvent::Added {
                key: b"blue/x".to_vec(),
                digest: value_digest(b"pigment"),
            },
            DiffEvent::Deleted {
                key: b"red/x".to_vec(),
                digest: value_digest(b"pigment"),
            },
            // `vol/a/x` → `vol/b/x` stays inside bucket `vol`: renamed.
            DiffEvent::Renamed {
                key: b"vol/b/x".to_vec(),
                previous_key: b"vol/a/x".to_vec(),
                digest: value_digest(b"payload"),
            },
        ]
    );

    engine.close().unwrap();
}

// ================================================================================================
// Scenario 5 — cancellation
// ================================================================================================

/// A deliberately slow fallback diff (throttled snapshot iterators) is
/// cancelled shortly after submit: the job must reach CANCELLED, any
/// partial results must be gone, and a second cancel must report
/// AlreadyTerminal.
#[test]
fn scenario_cancellation_mid_run() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::with_iter_delay(
        tmp.path().join("host"),
        Some(Duration::from_millis(2)),
    );
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    for i in 0..600 {
        host.put(format!("key_{i:05}"), "x");
    }
    snap(&host, &engine, 1, None);
    host.put("key_00000", "y");
    host.flush();
    host.compact_all(None); // force the (slow) fallback
    snap(&host, &engine, 2, Some(1));

    let job_id = engine
        .submit_diff(1, 2, DiffOptions::default(), "test")
        .unwrap();

    // Identical concurrent submits land on the same job while it runs.
    let dup = engine
        .submit_diff(1, 2, DiffOptions::default(), "test")
        .unwrap();
    assert_eq!(job_id, dup);

    std::thread::sleep(Duration::from_millis(100));
    engine.cancel_diff(job_id).unwrap();

    let record = await_terminal(&engine, job_id);
    assert_eq!(record.state, JobState::Cancelled);
    assert!(collect_results(&engine, job_id).is_empty());

    match engine.cancel_diff(job_id) {
        Err(EngineError::Job(snapdiff::jobs::JobError::AlreadyTerminal(_))) => {}
        other => panic!("expected AlreadyTerminal, got {other:?}"),
    }

    engine.close().unwrap();
}

// ================================================================================================
// Scenario 6 — reverse-order diff
// ================================================================================================

/// `from` newer than `to`: accepted, classified literally. A key that
/// appeared between the two snapshots shows as DELETED when diffing
/// newer → older.
#[test]
fn scenario_reverse_order_is_literal() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    host.put("k1", "v1");
    snap(&host, &engine, 1, None); // older
    host.put("k2", "v2");
    snap(&host, &engine, 2, Some(1)); // newer

    let record = run_diff(&engine, 2, 1, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.algorithm, Some(DiffAlgorithm::Fast));

    let events = collect_results(&engine, record.job_id);
    assert_eq!(
        events,
        vec![DiffEvent::Deleted {
            key: b"k2".to_vec(),
            digest: value_digest(b"v2"),
        }]
    );
    // And the mirror image going the documented direction.
    let forward = run_diff(&engine, 1, 2, DiffOptions::default());
    let forward_events = collect_results(&engine, forward.job_id);
    assert_eq!(
        forward_events,
        vec![DiffEvent::Added {
            key: b"k2".to_vec(),
            digest: value_digest(b"v2"),
        }]
    );

    engine.close().unwrap();
}

#[test]
fn reverse_order_can_be_rejected_by_config() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let config = DiffConfig {
        reject_reverse_order: true,
        ..test_config()
    };
    let engine = open_engine(&tmp, Arc::clone(&host), config);

    host.put("k", "v");
    snap(&host, &engine, 1, None);
    host.put("k2", "v2");
    snap(&host, &engine, 2, Some(1));

    match engine.submit_diff(2, 1, DiffOptions::default(), "test") {
        Err(EngineError::InvalidSnapshotOrder { from: 2, to: 1 }) => {}
        other => panic!("expected InvalidSnapshotOrder, got {other:?}"),
    }
    engine.close().unwrap();
}

// ================================================================================================
// Boundaries
// ================================================================================================

#[test]
fn empty_snapshot_yields_only_added() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    snap(&host, &engine, 1, None); // nothing written yet

    host.put("a", "1");
    host.put("b", "2");
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    let events = collect_results(&engine, record.job_id);
    assert!(events.iter().all(|e| matches!(e, DiffEvent::Added { .. })));
    assert_eq!(events.len(), 2);

    engine.close().unwrap();
}

#[test]
fn budget_exceeded_fails_the_job_and_purges_partials() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());
    let listener = engine.listener();

    host.put("a", "1");
    host.put("b", "2");
    host.put("c", "3");
    snap(&host, &engine, 1, None);
    host.put("a", "11");
    host.delete("b");
    host.put("d", "4");
    host.flush();
    host.compact_all(Some(&listener));
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(
        &engine,
        1,
        2,
        DiffOptions {
            key_budget: Some(2),
            ..DiffOptions::default()
        },
    );
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure, Some(JobFailure::BudgetExceeded));
    assert!(collect_results(&engine, record.job_id).is_empty());

    engine.close().unwrap();
}

#[test]
fn deadline_elapsed_fails_with_timeout_not_cancelled() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::with_iter_delay(
        tmp.path().join("host"),
        Some(Duration::from_millis(2)),
    );
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    for i in 0..600 {
        host.put(format!("key_{i:05}"), "x");
    }
    snap(&host, &engine, 1, None);
    host.put("key_00001", "y");
    host.flush();
    host.compact_all(None); // slow fallback
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(
        &engine,
        1,
        2,
        DiffOptions {
            deadline_ms: Some(100),
            ..DiffOptions::default()
        },
    );
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure, Some(JobFailure::Timeout));
    assert!(collect_results(&engine, record.job_id).is_empty());

    engine.close().unwrap();
}

/// Range tombstone flushed but not compacted: the covered keys' puts
/// live only in a file shared by both snapshots, so the fast path must
/// surface them through shared-file candidates.
#[test]
fn range_delete_without_compaction_diffs_correctly() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    for i in 0..10 {
        host.put(format!("key_{i:02}"), format!("v{i}"));
    }
    snap(&host, &engine, 1, None);

    host.delete_range("key_03", "key_07");
    host.put("key_99", "tail");
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.algorithm, Some(DiffAlgorithm::Fast));

    let events = collect_results(&engine, record.job_id);
    assert_ascending(&events);
    assert_eq!(events, oracle_diff(&host.view(1), &host.view(2)));
    // Keys 03..07 deleted, key_99 added.
    assert_eq!(events.len(), 5);

    engine.close().unwrap();
}

// ================================================================================================
// Fast ≡ fallback
// ================================================================================================

fn mixed_workload(host: &MiniLsm, engine: &DiffEngine, listener: Option<&snapdiff::listener::CompactionListener>) {
    for i in 0..60 {
        host.put(format!("user/{i:03}"), format!("profile-{i}"));
    }
    for i in 0..20 {
        host.put(format!("meta/{i:03}"), format!("m-{i}"));
    }
    snap(host, engine, 1, None);

    for i in (0..60).step_by(3) {
        host.put(format!("user/{i:03}"), format!("profile-{i}-v2"));
    }
    for i in (0..20).step_by(4) {
        host.delete(format!("meta/{i:03}"));
    }
    host.delete_range("user/040", "user/050");
    for i in 0..10 {
        host.put(format!("new/{i:03}"), format!("n-{i}"));
    }
    host.put("user/007", "profile-7"); // touched twice
    host.flush();
    host.compact_all(listener);
    snap(host, engine, 2, Some(1));
}

#[test]
fn fast_path_matches_full_scan_on_mixed_workload() {
    // Rig 1: lineage recorded → fast path.
    let tmp_fast = TempDir::new().unwrap();
    let host_fast = MiniLsm::new(tmp_fast.path().join("host"));
    let engine_fast = open_engine(&tmp_fast, Arc::clone(&host_fast), test_config());
    let listener = engine_fast.listener();
    mixed_workload(&host_fast, &engine_fast, Some(&listener));

    let fast = run_diff(&engine_fast, 1, 2, DiffOptions::default());
    assert_eq!(fast.state, JobState::Done);
    assert_eq!(fast.algorithm, Some(DiffAlgorithm::Fast));
    let fast_events = collect_results(&engine_fast, fast.job_id);

    // Rig 2: identical workload, lineage discarded → fallback.
    let tmp_full = TempDir::new().unwrap();
    let host_full = MiniLsm::new(tmp_full.path().join("host"));
    let engine_full = open_engine(&tmp_full, Arc::clone(&host_full), test_config());
    mixed_workload(&host_full, &engine_full, None);

    let full = run_diff(&engine_full, 1, 2, DiffOptions::default());
    assert_eq!(full.state, JobState::Done);
    assert_eq!(full.algorithm, Some(DiffAlgorithm::Fallback));
    let full_events = collect_results(&engine_full, full.job_id);

    // Both equal each other and the oracle.
    let oracle = oracle_diff(&host_fast.view(1), &host_fast.view(2));
    assert_ascending(&fast_events);
    assert_eq!(fast_events, oracle);
    assert_eq!(full_events, oracle);

    engine_fast.close().unwrap();
    engine_full.close().unwrap();
}

// ================================================================================================
// Durability
// ================================================================================================

#[test]
fn results_and_lineage_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));

    let (job_id, expected) = {
        let engine = open_engine(&tmp, Arc::clone(&host), test_config());
        let listener = engine.listener();

        host.put("a", "1");
        host.put("b", "2");
        snap(&host, &engine, 1, None);
        host.put("a", "11");
        host.put("c", "3");
        host.flush();
        host.compact_all(Some(&listener));
        snap(&host, &engine, 2, Some(1));

        let record = run_diff(&engine, 1, 2, DiffOptions::default());
        assert_eq!(record.state, JobState::Done);
        let events = collect_results(&engine, record.job_id);
        engine.close().unwrap();
        (record.job_id, events)
    };

    // Reopen over the same directory: the finished job, its results,
    // the snapshot map, and the preserved lineage must all be back.
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());
    let record = engine.get_status(job_id).unwrap();
    assert_eq!(record.state, JobState::Done);
    assert_eq!(collect_results(&engine, job_id), expected);

    // A fresh diff over the recovered lineage still takes the fast path.
    let rerun = run_diff(
        &engine,
        1,
        2,
        DiffOptions {
            key_budget: Some(1_000),
            ..DiffOptions::default()
        },
    );
    assert_eq!(rerun.state, JobState::Done);
    assert_eq!(rerun.algorithm, Some(DiffAlgorithm::Fast));
    assert_eq!(collect_results(&engine, rerun.job_id), expected);

    engine.close().unwrap();
}

#[test]
fn snapshot_deletion_releases_preserved_files() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());
    let listener = engine.listener();

    host.put("a", "1");
    snap(&host, &engine, 1, None);
    host.put("b", "2");
    host.flush();
    host.compact_all(Some(&listener));
    snap(&host, &engine, 2, Some(1));

    let backup_dir = tmp.path().join("engine").join("backup");
    let preserved = || {
        std::fs::read_dir(&backup_dir)
            .map(|dir| dir.count())
            .unwrap_or(0)
    };
    assert!(preserved() > 0, "compaction inputs should be preserved");

    engine.snapshot_deleted(1).unwrap();
    engine.snapshot_deleted(2).unwrap();
    assert_eq!(preserved(), 0, "released files must be deleted");

    engine.close().unwrap();
}

#[test]
fn purge_removes_results() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let engine = open_engine(&tmp, Arc::clone(&host), test_config());

    host.put("a", "1");
    snap(&host, &engine, 1, None);
    host.put("b", "2");
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert!(!collect_results(&engine, record.job_id).is_empty());

    engine.purge_diff(record.job_id).unwrap();
    match engine.get_status(record.job_id) {
        Err(EngineError::Job(snapdiff::jobs::JobError::NotFound(_))) => {}
        other => panic!("expected NotFound after purge, got {other:?}"),
    }

    engine.close().unwrap();
}

#[test]
fn pruned_preservation_mode_still_supports_diffs() {
    let tmp = TempDir::new().unwrap();
    let host = MiniLsm::new(tmp.path().join("host"));
    let config = DiffConfig {
        prune_mode_default: PruneMode::Pruned,
        ..test_config()
    };
    let engine = open_engine(&tmp, Arc::clone(&host), config);
    let listener = engine.listener();

    host.put("a", "1");
    host.put("b", "2");
    snap(&host, &engine, 1, None);
    host.put("a", "11");
    host.delete("b");
    host.flush();
    host.compact_all(Some(&listener));
    snap(&host, &engine, 2, Some(1));

    let record = run_diff(&engine, 1, 2, DiffOptions::default());
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.algorithm, Some(DiffAlgorithm::Fast));
    assert_eq!(
        collect_results(&engine, record.job_id),
        oracle_diff(&host.view(1), &host.view(2))
    );

    engine.close().unwrap();
}
