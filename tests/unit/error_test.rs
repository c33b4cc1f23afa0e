//! Tests for error types

use session_governor::core::GovernorError;

#[test]
fn test_queue_full_error() {
    let err = GovernorError::QueueFull("12 queued".to_string());
    assert_eq!(format!("{}", err), "queue full: 12 queued");
}

#[test]
fn test_checkpoint_write_error() {
    let err = GovernorError::CheckpointWrite("disk full".to_string());
    assert_eq!(format!("{}", err), "checkpoint write failed: disk full");
}

#[test]
fn test_invalid_config_error() {
    let err = GovernorError::InvalidConfig("hard_cap must be greater than 0".to_string());
    assert_eq!(
        format!("{}", err),
        "invalid configuration: hard_cap must be greater than 0"
    );
}

#[test]
fn test_errors_convert_into_anyhow() {
    let err: anyhow::Error = GovernorError::Backend("connection failed".to_string()).into();
    assert_eq!(err.to_string(), "backend error: connection failed");
}
