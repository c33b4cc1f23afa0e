//! Session orchestration: drain the queue through admission and the gates,
//! and stop with a checkpoint when a resource runs out.
//!
//! The orchestrator is the single logical thread of a session. It asks the
//! governor for one decision at a time, runs at most one item through the
//! gate pipeline, and only checks stop conditions between items.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::core::admission::{Decision, Governor};
use crate::core::arbiter::TelemetrySample;
use crate::core::audit::{build_audit_event, AuditAction, AuditSink};
use crate::core::checkpoint::{Checkpoint, CheckpointManager};
use crate::core::error::GovernorError;
use crate::core::gates::{GatePipeline, PipelineOutcome};
use crate::core::policy::Tier;
use crate::core::work_item::{ItemStatus, WorkItem};
use crate::infra::telemetry::TelemetryMonitor;
use crate::util::clock::Clock;
use crate::util::serde::{ItemId, Resource};

/// Why a session stopped before draining its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Emergency tier, or nothing left fits the budget.
    BudgetExhausted,
    /// Critical tier under the finish-current strategy.
    CriticalBudget,
    /// Hardware stayed outside its limits through every wait.
    HardwareUnsafe,
    /// The wall-clock session boundary was reached.
    SessionDeadline,
    /// Cancelled by the operator.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BudgetExhausted => "budget exhausted",
            Self::CriticalBudget => "budget critical",
            Self::HardwareUnsafe => "hardware unsafe",
            Self::SessionDeadline => "session deadline",
            Self::Cancelled => "cancelled",
        })
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum SessionOutcome {
    /// Every item reached a terminal state.
    Drained,
    /// Work remains; a checkpoint was written.
    Checkpointed(StopReason),
}

/// Summary returned by [`SessionOrchestrator::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session identifier.
    pub session_id: String,
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Items completed this session, in completion order.
    pub completed: Vec<ItemId>,
    /// Items that failed this session.
    pub failed: Vec<ItemId>,
    /// Items rolled back this session.
    pub rolled_back: Vec<ItemId>,
    /// Items still queued when the session ended, in resume order.
    pub remaining: Vec<ItemId>,
    /// Tokens inside the ledger window at the end.
    pub tokens_used: u64,
}

/// Cooperative cancellation flag, honoured between items.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request the session to stop at the next item boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Everything a session needs, assembled by the session builder.
pub struct SessionParts {
    /// Session identifier.
    pub session_id: String,
    /// Session settings.
    pub config: SessionConfig,
    /// Tier at which the session stops after the in-flight item.
    pub soft_stop: Option<Tier>,
    /// Admission controller (sole ledger writer).
    pub governor: Governor,
    /// Gate pipeline.
    pub pipeline: GatePipeline,
    /// Checkpoint manager.
    pub checkpoints: CheckpointManager,
    /// Audit sink.
    pub audit: Arc<dyn AuditSink>,
    /// Session clock.
    pub clock: Arc<dyn Clock>,
    /// Optional background sampler used to cut hardware waits short.
    pub monitor: Option<TelemetryMonitor>,
}

#[derive(Debug, Default)]
struct PassTally {
    progressed: bool,
    token_deferrals: usize,
    hardware_deferrals: usize,
}

enum Step {
    Finished,
    Deferred(Resource),
}

/// Drives one session.
pub struct SessionOrchestrator {
    session_id: String,
    config: SessionConfig,
    soft_stop: Option<Tier>,
    governor: Governor,
    pipeline: GatePipeline,
    checkpoints: CheckpointManager,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    monitor: Option<TelemetryMonitor>,
    cancel: CancelHandle,
    items: HashMap<ItemId, WorkItem>,
    queue: VecDeque<ItemId>,
    deferred: Vec<ItemId>,
    finished: Vec<ItemId>,
    started_at_ms: u128,
}

impl fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("session_id", &self.session_id)
            .field("queued", &self.queue.len())
            .field("finished", &self.finished.len())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    /// Assemble an orchestrator from its parts.
    #[must_use]
    pub fn new(parts: SessionParts) -> Self {
        let started_at_ms = parts.clock.now_ms();
        Self {
            session_id: parts.session_id,
            config: parts.config,
            soft_stop: parts.soft_stop,
            governor: parts.governor,
            pipeline: parts.pipeline,
            checkpoints: parts.checkpoints,
            audit: parts.audit,
            clock: parts.clock,
            monitor: parts.monitor,
            cancel: CancelHandle::default(),
            items: HashMap::new(),
            queue: VecDeque::new(),
            deferred: Vec::new(),
            finished: Vec::new(),
            started_at_ms,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Handle for cooperative cancellation.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Admission controller.
    #[must_use]
    pub const fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Queued item identifiers in resume order: items deferred during the
    /// current pass first, since they were ahead of the rest.
    #[must_use]
    pub fn queued(&self) -> Vec<ItemId> {
        self.deferred.iter().chain(&self.queue).cloned().collect()
    }

    /// Current state of one item.
    #[must_use]
    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    /// Queue planner output. Items are ordered by priority, highest first,
    /// keeping planner order within a priority. Items already in a terminal
    /// state are recorded as finished and not queued.
    ///
    /// # Errors
    ///
    /// [`GovernorError::QueueFull`] when the batch would exceed the queue
    /// bound and [`GovernorError::Ingest`] on a duplicate identifier. The
    /// queue is unchanged on error.
    pub fn ingest(&mut self, mut items: Vec<WorkItem>) -> Result<usize, GovernorError> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if self.items.contains_key(&item.id) || !seen.insert(item.id.as_str()) {
                return Err(GovernorError::Ingest(format!("duplicate item id `{}`", item.id)));
            }
        }
        let pending = items.iter().filter(|i| !i.status.is_terminal()).count();
        if self.queue.len() + pending > self.config.max_queue_depth {
            return Err(GovernorError::QueueFull(format!(
                "{} queued + {pending} new exceeds {}",
                self.queue.len(),
                self.config.max_queue_depth
            )));
        }

        items.sort_by(|a, b| b.priority.cmp(&a.priority));
        for mut item in items {
            if item.status.is_terminal() {
                self.finished.push(item.id.clone());
            } else {
                item.status = ItemStatus::Pending;
                self.queue.push_back(item.id.clone());
            }
            self.items.insert(item.id.clone(), item);
        }
        info!(queued = self.queue.len(), new = pending, "work items ingested");
        Ok(pending)
    }

    /// Continue from the last checkpoint, if any: restore the ledger, drop
    /// items finished by earlier sessions and put the in-flight item first,
    /// then the saved queue order, then anything newly ingested.
    ///
    /// # Errors
    ///
    /// Propagates checkpoint read and decode failures.
    pub fn resume(&mut self) -> Result<Option<Checkpoint>, GovernorError> {
        let Some(checkpoint) = self.checkpoints.load()? else {
            return Ok(None);
        };
        self.governor.restore_ledger(checkpoint.ledger.iter().copied());

        let done: HashSet<&str> = checkpoint.finished.iter().map(String::as_str).collect();
        for id in &checkpoint.finished {
            if self.items.contains_key(id) && !self.finished.contains(id) {
                self.finished.push(id.clone());
            }
        }

        let mut ordered = VecDeque::with_capacity(self.queue.len());
        let mut placed = HashSet::new();
        for id in checkpoint.resume_order() {
            if !self.queue.contains(&id) {
                warn!(item_id = %id, "checkpointed item was not ingested, skipping");
                continue;
            }
            placed.insert(id.clone());
            ordered.push_back(id);
        }
        for id in self.queue.drain(..) {
            if !placed.contains(&id) && !done.contains(id.as_str()) {
                ordered.push_back(id);
            }
        }
        self.queue = ordered;

        info!(
            from_session = %checkpoint.session_id,
            queued = self.queue.len(),
            in_flight = ?checkpoint.in_flight,
            ledger_used = self.governor.ledger().used(),
            "resumed from checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Process the queue until it drains or a stop condition is met.
    ///
    /// # Errors
    ///
    /// [`GovernorError::CheckpointWrite`] if the final checkpoint cannot be
    /// written. Item failures never surface here.
    pub fn run(&mut self) -> Result<SessionReport, GovernorError> {
        let mut report = SessionReport {
            session_id: self.session_id.clone(),
            outcome: SessionOutcome::Drained,
            completed: Vec::new(),
            failed: Vec::new(),
            rolled_back: Vec::new(),
            remaining: Vec::new(),
            tokens_used: 0,
        };
        let mut tally = PassTally::default();
        let mut hardware_waits = 0_u32;

        self.started_at_ms = self.clock.now_ms();
        info!(session_id = %self.session_id, queued = self.queue.len(), "session started");

        let stop = loop {
            if self.cancel.is_cancelled() {
                break Some(StopReason::Cancelled);
            }

            let Some(id) = self.queue.pop_front() else {
                if self.deferred.is_empty() {
                    break None;
                }
                if tally.progressed {
                    debug!(deferred = self.deferred.len(), "requeueing deferred items for another pass");
                } else if tally.hardware_deferrals > 0 && hardware_waits < self.config.max_hardware_waits {
                    hardware_waits += 1;
                    self.wait_for_hardware(hardware_waits);
                } else if tally.token_deferrals > 0 {
                    break Some(StopReason::BudgetExhausted);
                } else {
                    break Some(StopReason::HardwareUnsafe);
                }
                let retry = std::mem::take(&mut self.deferred);
                self.queue.extend(retry);
                tally = PassTally::default();
                continue;
            };

            if let Some(reason) = self.boundary_stop(&id) {
                self.queue.push_front(id);
                break Some(reason);
            }

            match self.process(&id, &mut report) {
                Step::Finished => {
                    tally.progressed = true;
                    self.finished.push(id);
                }
                Step::Deferred(resource) => {
                    if resource == Resource::Tokens {
                        tally.token_deferrals += 1;
                    } else {
                        tally.hardware_deferrals += 1;
                    }
                    self.deferred.push(id);
                }
            }
        };

        // Deferred items were ahead of everything still queued.
        let leftover = std::mem::take(&mut self.deferred);
        for id in leftover.into_iter().rev() {
            self.queue.push_front(id);
        }
        report.outcome = stop.map_or(SessionOutcome::Drained, SessionOutcome::Checkpointed);
        report.remaining = self.queued();

        if let Err(e) = self.save(None) {
            error!(session_id = %self.session_id, error = %e, "final checkpoint lost");
            self.pipeline.shutdown();
            return Err(e);
        }
        self.pipeline.shutdown();
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }

        report.tokens_used = self.governor.ledger().used();
        info!(
            session_id = %self.session_id,
            outcome = ?report.outcome,
            completed = report.completed.len(),
            failed = report.failed.len(),
            rolled_back = report.rolled_back.len(),
            remaining = report.remaining.len(),
            tokens_used = report.tokens_used,
            "session finished"
        );
        Ok(report)
    }

    /// Stop conditions checked before `next` is started.
    fn boundary_stop(&mut self, next: &str) -> Option<StopReason> {
        let now = self.clock.now_ms();
        if let Some(limit) = self.config.max_session {
            let deadline = self.started_at_ms + limit.as_millis();
            let needs = self
                .items
                .get(next)
                .map_or(0, |i| i.estimate.duration.as_millis());
            if now.saturating_add(needs) > deadline {
                info!(item_id = %next, "next item would overrun the session boundary");
                return Some(StopReason::SessionDeadline);
            }
        }

        let tier = self.governor.assess().tier;
        let may_retry = self
            .items
            .get(next)
            .is_some_and(|i| i.priority.may_use_emergency());
        match tier {
            Tier::Emergency if may_retry => {
                debug!(item_id = %next, "emergency tier, attempting emergency admission");
                None
            }
            Tier::Emergency => Some(StopReason::BudgetExhausted),
            t if self.soft_stop.is_some_and(|s| t >= s) => Some(StopReason::CriticalBudget),
            _ => None,
        }
    }

    fn process(&mut self, id: &str, report: &mut SessionReport) -> Step {
        let Some(mut item) = self.items.remove(id) else {
            warn!(item_id = %id, error = %GovernorError::UnknownItem(id.to_string()), "dropping queue entry");
            return Step::Finished;
        };
        let step = self.admit_and_run(&mut item, report);
        self.items.insert(item.id.clone(), item);
        step
    }

    fn admit_and_run(&mut self, item: &mut WorkItem, report: &mut SessionReport) -> Step {
        let decision = self.governor.decide(item);
        self.audit_decision(item, &decision);

        let policy = match &decision {
            Decision::Defer { reason, resource } => {
                item.status = ItemStatus::Deferred(reason.clone());
                return Step::Deferred(resource.unwrap_or(Resource::Tokens));
            }
            Decision::AdmitDegraded { adaptation } => adaptation.policy,
            Decision::Admit { .. } => *self.governor.table().policy(Tier::Full),
        };
        let reserved = decision.reserved_tokens();
        item.status = ItemStatus::Admitted;

        if let Err(e) = self.save(Some(&item.id)) {
            warn!(item_id = %item.id, error = %e, "in-flight checkpoint skipped");
        }

        let hardware = self.governor.arbiter().latest().map_or_else(
            || self.governor.arbiter().fallback_sample(),
            |s| TelemetrySample {
                available_ram_gb: s.available_ram_gb,
                cpu_temperature_c: s.cpu_temperature_c,
            },
        );
        let outcome = self.pipeline.run(item, &policy, &hardware);
        self.audit_gates(item, &outcome);

        match &outcome.status {
            ItemStatus::Deferred(reason) => {
                self.governor.release(&item.id, reserved);
                let resource = outcome.blocked_by().unwrap_or(Resource::Thermal);
                info!(item_id = %item.id, resource = %resource, reason = %reason, "item deferred at preflight");
                Step::Deferred(resource)
            }
            status => {
                self.governor.settle(&item.id, reserved, outcome.tokens_used);
                let (action, bucket) = match status {
                    ItemStatus::Completed => (AuditAction::Complete, &mut report.completed),
                    ItemStatus::RolledBack(_) => (AuditAction::Rollback, &mut report.rolled_back),
                    _ => (AuditAction::Fail, &mut report.failed),
                };
                bucket.push(item.id.clone());
                self.audit_item(
                    item,
                    action,
                    json!({ "status": status, "reserved": reserved, "tokens_used": outcome.tokens_used }),
                );
                Step::Finished
            }
        }
    }

    /// Sleep out a hardware backoff, returning early once the background
    /// sampler sees readings back inside the limits.
    fn wait_for_hardware(&self, attempt: u32) {
        let backoff = self.config.hardware_backoff;
        info!(
            attempt,
            max = self.config.max_hardware_waits,
            backoff = %humantime::format_duration(backoff),
            "waiting for hardware to recover"
        );
        let Some(monitor) = &self.monitor else {
            thread::sleep(backoff);
            return;
        };
        let limits = self.governor.arbiter().thresholds();
        let slice = limits.sample_interval.min(backoff).max(Duration::from_millis(1));
        let started = Instant::now();
        while started.elapsed() < backoff && !self.cancel.is_cancelled() {
            thread::sleep(slice.min(backoff.saturating_sub(started.elapsed())));
            let recovered = monitor.latest().and_then(|c| c.sample).is_some_and(|s| {
                s.cpu_temperature_c.is_none_or(|c| c < limits.thermal_limit_c)
                    && s.available_ram_gb >= limits.min_free_ram_gb
            });
            if recovered {
                debug!("hardware back inside limits");
                return;
            }
        }
    }

    fn save(&self, in_flight: Option<&ItemId>) -> Result<(), GovernorError> {
        let queue: Vec<ItemId> = self
            .deferred
            .iter()
            .chain(&self.queue)
            .filter(|id| Some(*id) != in_flight)
            .cloned()
            .collect();
        let checkpoint = Checkpoint::capture(
            self.session_id.clone(),
            self.governor.ledger(),
            queue,
            in_flight.cloned(),
            self.finished.clone(),
            self.governor.arbiter().latest().cloned(),
            self.clock.now_ms(),
        );
        self.checkpoints.save(&checkpoint)?;
        self.audit.record(build_audit_event(
            &self.session_id,
            in_flight.map(String::as_str),
            AuditAction::Checkpoint,
            checkpoint.written_at_ms,
            Some(json!({ "queued": checkpoint.queue.len(), "ledger_tokens": checkpoint.ledger_tokens() })),
        ));
        Ok(())
    }

    fn audit_item(&self, item: &WorkItem, action: AuditAction, payload: serde_json::Value) {
        self.audit.record(build_audit_event(
            &self.session_id,
            Some(&item.id),
            action,
            self.clock.now_ms(),
            Some(payload),
        ));
    }

    fn audit_decision(&self, item: &WorkItem, decision: &Decision) {
        let action = match decision {
            Decision::Admit { .. } => AuditAction::Admit,
            Decision::AdmitDegraded { .. } => AuditAction::AdmitDegraded,
            Decision::Defer { .. } => AuditAction::Defer,
        };
        let payload = serde_json::to_value(decision).unwrap_or_else(|e| json!(e.to_string()));
        self.audit_item(item, action, payload);
    }

    fn audit_gates(&self, item: &WorkItem, outcome: &PipelineOutcome) {
        for result in &outcome.results {
            let payload = serde_json::to_value(result).unwrap_or_else(|e| json!(e.to_string()));
            self.audit_item(item, AuditAction::Gate, payload);
        }
    }
}
