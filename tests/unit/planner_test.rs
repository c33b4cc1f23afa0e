//! Tests for planner ingestion

use std::io::Write;
use std::time::Duration;

use session_governor::core::{GovernorError, ItemStatus};
use session_governor::infra::JsonlPlanner;
use session_governor::util::Priority;

#[test]
fn test_loads_jsonl_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# nightly plan").unwrap();
    writeln!(
        file,
        r#"{{"id":"refactor","priority":"high","estimate":{{"input_tokens":4000,"output_tokens":1000,"duration":"20m"}},"outputs":[{{"name":"patch","path":"out/refactor.diff"}}],"criteria":[{{"name":"tests_passed","threshold":1.0,"comparator":"gte"}}]}}"#
    )
    .unwrap();
    writeln!(file).unwrap();
    writeln!(file, r#"{{"id":"docs","estimate":{{"input_tokens":500,"output_tokens":500}}}}"#).unwrap();

    let items = JsonlPlanner::new(file.path()).load().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "refactor");
    assert_eq!(items[0].priority, Priority::High);
    assert_eq!(items[0].estimate.duration, Duration::from_secs(1_200));
    assert!(items[0].is_well_formed());
    assert_eq!(items[1].priority, Priority::Normal);
    assert_eq!(items[1].status, ItemStatus::Pending);
    assert!(!items[1].is_well_formed());
}

#[test]
fn test_missing_file_is_ingest_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = JsonlPlanner::new(dir.path().join("absent.jsonl")).load().unwrap_err();
    assert!(matches!(err, GovernorError::Ingest(_)));
}
