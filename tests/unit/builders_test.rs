//! Tests for session builders

use std::sync::Arc;

use async_trait::async_trait;
use session_governor::builders::SessionBuilder;
use session_governor::config::GovernorConfig;
use session_governor::core::{ExecutionCollaborator, ExecutionReport, GovernorError, Policy, WorkItem};
use session_governor::infra::{InMemoryCheckpointStore, StaticTelemetry};
use session_governor::util::ManualClock;

struct Noop;

#[async_trait]
impl ExecutionCollaborator for Noop {
    async fn execute(&self, _item: &WorkItem, _policy: &Policy) -> ExecutionReport {
        ExecutionReport {
            success: true,
            ..ExecutionReport::default()
        }
    }
}

fn builder(cfg: GovernorConfig) -> SessionBuilder {
    SessionBuilder::new(cfg)
        .with_clock(Arc::new(ManualClock::new(10_000_000_000)))
        .with_telemetry(Arc::new(StaticTelemetry::new(16.0, 50.0)))
        .with_checkpoint_store(Arc::new(InMemoryCheckpointStore::default()))
}

#[test]
fn test_builds_with_explicit_session_id() {
    let session = builder(GovernorConfig::default())
        .with_executor(Arc::new(Noop))
        .with_session_id("night-1")
        .build()
        .unwrap();
    assert_eq!(session.session_id(), "night-1");
    assert_eq!(session.governor().ledger().reserve(), 20_000);
    assert!(session.queued().is_empty());
}

#[test]
fn test_generates_session_id() {
    let a = builder(GovernorConfig::default()).with_executor(Arc::new(Noop)).build().unwrap();
    let b = builder(GovernorConfig::default()).with_executor(Arc::new(Noop)).build().unwrap();
    assert_ne!(a.session_id(), b.session_id());
}

#[test]
fn test_requires_executor() {
    let err = builder(GovernorConfig::default()).build().unwrap_err();
    assert!(matches!(err, GovernorError::InvalidConfig(_)));
}

#[test]
fn test_rejects_invalid_config() {
    let mut cfg = GovernorConfig::default();
    cfg.budget.hard_cap = 0;
    let err = builder(cfg).with_executor(Arc::new(Noop)).build().unwrap_err();
    assert!(matches!(err, GovernorError::InvalidConfig(_)));
}

#[test]
fn test_background_telemetry_session_runs() {
    let mut session = builder(GovernorConfig::default())
        .with_executor(Arc::new(Noop))
        .with_background_telemetry(true)
        .build()
        .unwrap();
    let report = session.run().unwrap();
    assert!(report.completed.is_empty());
}
