//! Tests for audit sink

use serde_json::json;
use session_governor::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);
    let event = build_audit_event("s1", Some("item1"), AuditAction::Admit, 5, Some(json!({"reserved": 10})));

    sink.record(event.clone());
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], event);
    assert_eq!(events[0].item_id.as_deref(), Some("item1"));
    assert_eq!(events[0].action.to_string(), "admit");
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);
    for (n, action) in [AuditAction::Admit, AuditAction::Gate, AuditAction::Complete]
        .into_iter()
        .enumerate()
    {
        sink.record(build_audit_event("s1", Some("item1"), action, n as u128, None));
    }
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].action, AuditAction::Gate);
    assert_eq!(events[1].action, AuditAction::Complete);
}

#[test]
fn test_clones_share_events_and_filter_by_item() {
    let sink = InMemoryAuditSink::new(10);
    let handle = sink.clone();
    sink.record(build_audit_event("s1", Some("a"), AuditAction::Defer, 1, None));
    sink.record(build_audit_event("s1", None, AuditAction::Checkpoint, 2, None));
    sink.record(build_audit_event("s1", Some("b"), AuditAction::Admit, 3, None));

    assert_eq!(handle.events().len(), 3);
    let for_a = handle.events_for("a");
    assert_eq!(for_a.len(), 1);
    assert_eq!(for_a[0].action, AuditAction::Defer);
}

#[test]
fn test_event_ids_are_unique() {
    let a = build_audit_event("s1", None, AuditAction::Checkpoint, 1, None);
    let b = build_audit_event("s1", None, AuditAction::Checkpoint, 1, None);
    assert_ne!(a.event_id, b.event_id);
}
