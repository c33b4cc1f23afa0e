//! Tests for the file checkpoint store through the checkpoint manager

use std::sync::Arc;
use std::time::Duration;

use session_governor::core::{BudgetLedger, Checkpoint, CheckpointManager, CheckpointStore, GovernorError};
use session_governor::infra::FileCheckpointStore;
use session_governor::util::ManualClock;

const WINDOW: Duration = Duration::from_secs(5 * 3600);

#[test]
fn test_file_round_trip_and_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let clock = ManualClock::new(10_000_000_000);
    let manager = CheckpointManager::new(
        Arc::new(FileCheckpointStore::new(&path)),
        WINDOW,
        Duration::from_millis(1),
        Arc::new(clock.clone()),
    );
    let mut ledger = BudgetLedger::new(200_000, WINDOW, 20_000, Arc::new(clock.clone()));
    ledger.record(1_500, 500);

    let first = Checkpoint::capture("s1", &ledger, vec!["b".into()], Some("a".into()), vec![], None, 1);
    manager.save(&first).unwrap();
    let second = Checkpoint::capture("s1", &ledger, vec![], None, vec!["a".into(), "b".into()], None, 2);
    manager.save(&second).unwrap();

    let loaded = manager.load().unwrap().unwrap();
    assert_eq!(loaded, second);
    assert_eq!(loaded.ledger_tokens(), 2_000);

    // only the checkpoint itself is left behind
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("session.json")]);
}

#[test]
fn test_truncated_file_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("session.json"));
    store.write(b"{\"version\": 1, \"session_id\":").unwrap();
    let manager = CheckpointManager::new(
        Arc::new(store),
        WINDOW,
        Duration::from_millis(1),
        Arc::new(ManualClock::new(10_000_000_000)),
    );
    assert!(matches!(manager.load(), Err(GovernorError::CheckpointCorrupt(_))));
}

#[test]
fn test_missing_file_means_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("none.json"));
    assert!(store.read().unwrap().is_none());
    store.clear().unwrap();
}
