//! Session audit trail.
//!
//! Every admission verdict, gate result, item outcome and checkpoint write
//! becomes one [`AuditEvent`]. The in-memory sink keeps a bounded tail for
//! status reporting and tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::serde::ItemId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Admitted at full size.
    Admit,
    /// Admitted under a tighter policy.
    AdmitDegraded,
    /// Not admitted this time.
    Defer,
    /// One gate evaluated.
    Gate,
    /// Item completed.
    Complete,
    /// Item failed.
    Fail,
    /// Item rolled back after a regression.
    Rollback,
    /// Checkpoint written.
    Checkpoint,
}

impl AuditAction {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admit => "admit",
            Self::AdmitDegraded => "admit_degraded",
            Self::Defer => "defer",
            Self::Gate => "gate",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Rollback => "rollback",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier (uuid v4).
    pub event_id: String,
    /// Session the event belongs to.
    pub session_id: String,
    /// Related item, absent for session-level events.
    pub item_id: Option<ItemId>,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<serde_json::Value>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// Bounded in-memory sink. Clones share the same buffer, so a caller can
/// keep a handle while the orchestrator owns another.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        let max_events = max_events.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events for one item, oldest first.
    #[must_use]
    pub fn events_for(&self, item_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.item_id.as_deref() == Some(item_id))
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Build an audit event with a fresh identifier.
pub fn build_audit_event(
    session_id: impl Into<String>,
    item_id: Option<&str>,
    action: AuditAction,
    created_at_ms: u128,
    payload: Option<serde_json::Value>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        session_id: session_id.into(),
        item_id: item_id.map(str::to_owned),
        action,
        created_at_ms,
        payload,
    }
}
