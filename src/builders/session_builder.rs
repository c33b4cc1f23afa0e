//! Build a [`SessionOrchestrator`] from [`GovernorConfig`] plus the explicit
//! session context (clock, telemetry, collaborators, checkpoint store).

use std::sync::Arc;

use uuid::Uuid;

use crate::config::GovernorConfig;
use crate::core::admission::Governor;
use crate::core::arbiter::{ResourceArbiter, TelemetrySource};
use crate::core::audit::{AuditSink, InMemoryAuditSink};
use crate::core::checkpoint::{CheckpointManager, CheckpointStore};
use crate::core::error::GovernorError;
use crate::core::executor::{ExecutionCollaborator, FunctionalOracle, OutputProbe, SampleValidator, StaticAnalyzer};
use crate::core::gates::GatePipeline;
use crate::core::ledger::BudgetLedger;
use crate::core::orchestrator::{SessionOrchestrator, SessionParts};
use crate::infra::checkpoint::InMemoryCheckpointStore;
use crate::infra::telemetry::{SysfsTelemetry, TelemetryMonitor};
use crate::util::clock::{Clock, SystemClock};

/// Fluent session construction. Anything not supplied falls back to the
/// production default: system clock, sysfs telemetry, in-memory audit.
/// An executor and a checkpoint store are required.
pub struct SessionBuilder {
    config: GovernorConfig,
    session_id: Option<String>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySource>,
    execution: Option<Arc<dyn ExecutionCollaborator>>,
    store: Option<Arc<dyn CheckpointStore>>,
    validator: Option<Arc<dyn SampleValidator>>,
    analyzer: Option<Arc<dyn StaticAnalyzer>>,
    oracle: Option<Arc<dyn FunctionalOracle>>,
    probe: Option<Arc<dyn OutputProbe>>,
    audit: Option<Arc<dyn AuditSink>>,
    background_telemetry: bool,
}

impl SessionBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            session_id: None,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(SysfsTelemetry::default()),
            execution: None,
            store: None,
            validator: None,
            analyzer: None,
            oracle: None,
            probe: None,
            audit: None,
            background_telemetry: false,
        }
    }

    /// Fixed session identifier (default: random uuid).
    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Clock shared by ledger, arbiter, gates and checkpoints.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Hardware telemetry source.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Execution collaborator for the proof-of-concept and implementation gates.
    #[must_use]
    pub fn with_executor(mut self, execution: Arc<dyn ExecutionCollaborator>) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Where checkpoints are written.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sample validator (default: accept-all).
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn SampleValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Static analyzer for the implementation gate.
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn StaticAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Functional oracle for the delivery gate.
    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn FunctionalOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Output probe (default: filesystem).
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn OutputProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Audit sink (default: bounded in-memory buffer).
    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run the background telemetry sampler during the session.
    #[must_use]
    pub const fn with_background_telemetry(mut self, enabled: bool) -> Self {
        self.background_telemetry = enabled;
        self
    }

    /// Validate configuration and assemble the session.
    ///
    /// # Errors
    ///
    /// [`GovernorError::InvalidConfig`] for invalid configuration or a
    /// missing executor, and [`GovernorError::Backend`] if worker threads
    /// cannot be started.
    pub fn build(self) -> Result<SessionOrchestrator, GovernorError> {
        let cfg = self.config;
        cfg.validate().map_err(GovernorError::InvalidConfig)?;
        let execution = self
            .execution
            .ok_or_else(|| GovernorError::InvalidConfig("no execution collaborator".into()))?;
        let store: Arc<dyn CheckpointStore> = self.store.unwrap_or_else(|| {
            tracing::warn!("no checkpoint store configured, checkpoints are kept in memory only");
            Arc::new(InMemoryCheckpointStore::default())
        });

        let ledger = BudgetLedger::new(
            cfg.budget.hard_cap,
            cfg.budget.window,
            cfg.budget.reserve(),
            Arc::clone(&self.clock),
        );
        let arbiter = ResourceArbiter::new(
            cfg.arbiter.clone(),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.clock),
        );
        let governor = Governor::new(ledger, cfg.policies.clone(), arbiter, &cfg.admission);

        let mut pipeline = GatePipeline::new(
            execution,
            cfg.gates.clone(),
            cfg.arbiter.thermal_limit_c,
            Arc::clone(&self.clock),
        )
        .map_err(|e| GovernorError::Backend(e.to_string()))?;
        if let Some(validator) = self.validator {
            pipeline = pipeline.with_validator(validator);
        }
        if let Some(analyzer) = self.analyzer {
            pipeline = pipeline.with_analyzer(analyzer);
        }
        if let Some(oracle) = self.oracle {
            pipeline = pipeline.with_oracle(oracle);
        }
        if let Some(probe) = self.probe {
            pipeline = pipeline.with_probe(probe);
        }

        let checkpoints = CheckpointManager::new(
            store,
            cfg.budget.window,
            cfg.session.checkpoint_retry_backoff,
            Arc::clone(&self.clock),
        );

        let monitor = if self.background_telemetry {
            let monitor = TelemetryMonitor::spawn(Arc::clone(&self.telemetry), cfg.arbiter.sample_interval)
                .map_err(|e| GovernorError::Backend(format!("telemetry monitor: {e}")))?;
            Some(monitor)
        } else {
            None
        };

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(InMemoryAuditSink::new(cfg.session.audit_capacity)));
        let session_id = self
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        tracing::info!(
            session_id = %session_id,
            hard_cap = cfg.budget.hard_cap,
            reserve = cfg.budget.reserve(),
            window = %humantime::format_duration(cfg.budget.window),
            stop_strategy = ?cfg.session.stop_strategy,
            "session assembled"
        );

        Ok(SessionOrchestrator::new(SessionParts {
            session_id,
            soft_stop: cfg.soft_stop_tier(),
            config: cfg.session,
            governor,
            pipeline,
            checkpoints,
            audit,
            clock: self.clock,
            monitor,
        }))
    }
}
