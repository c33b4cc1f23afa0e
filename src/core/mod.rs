//! Budget accounting, admission, quality gates and session orchestration.

pub mod admission;
pub mod arbiter;
pub mod audit;
pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod gate_runner;
pub mod gates;
pub mod ledger;
pub mod orchestrator;
pub mod policy;
pub mod work_item;

pub use admission::{Adaptation, Decision, Governor};
pub use arbiter::{PartialSample, ResourceArbiter, ResourceSnapshot, TelemetrySample, TelemetrySource};
pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, CHECKPOINT_VERSION};
pub use error::{AppResult, GovernorError};
pub use executor::{
    AcceptAll, ExecutionCollaborator, ExecutionOutcome, ExecutionReport, Finding, FsOutputProbe,
    FunctionalOracle, OutputProbe, SampleValidator, Severity, StaticAnalyzer, ValidationResult,
};
pub use gate_runner::{GateRunError, GateRunner, RunnerStats};
pub use gates::{GateName, GateOutcome, GatePipeline, GateResult, PipelineOutcome};
pub use ledger::{BudgetLedger, LedgerEntry};
pub use orchestrator::{
    CancelHandle, SessionOrchestrator, SessionOutcome, SessionParts, SessionReport, StopReason,
};
pub use policy::{AdaptivePolicyTable, Policy, Tier, TierBoundaries};
pub use work_item::{Comparator, ItemStatus, OutputDescriptor, Sample, SuccessCriterion, WorkItem};
