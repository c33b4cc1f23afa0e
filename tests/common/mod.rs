//! Shared fixtures for session integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use session_governor::builders::SessionBuilder;
use session_governor::config::GovernorConfig;
use session_governor::core::{
    Comparator, ExecutionCollaborator, ExecutionReport, InMemoryAuditSink, Policy, SessionOrchestrator, Tier,
    WorkItem,
};
use session_governor::infra::{InMemoryCheckpointStore, StaticTelemetry};
use session_governor::util::{ManualClock, Priority, ResourceEstimate};

/// Epoch far enough from zero that window arithmetic never underflows.
pub const T0: u128 = 10_000_000_000;
pub const HOUR: Duration = Duration::from_secs(3600);

/// How the scripted executor treats one item.
#[derive(Debug, Clone)]
pub enum Script {
    /// Succeed and report every criterion as met.
    Succeed,
    /// Executor reports failure.
    Fail,
    /// Succeed but leave out the metric.
    OmitMetric,
    /// Break a baseline check.
    Regress,
    /// Sleep this long before reporting success.
    Hang(Duration),
}

/// Executor whose behaviour is fixed per item. Records the order of
/// `execute` calls and the policy tier each one ran under.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    executed: Arc<Mutex<Vec<(String, Tier)>>>,
    rolled_back: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn script(&self, id: &str, script: Script) {
        self.scripts.lock().insert(id.to_string(), script);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn tiers(&self) -> Vec<(String, Tier)> {
        self.executed.lock().clone()
    }

    pub fn rolled_back(&self) -> Vec<String> {
        self.rolled_back.lock().clone()
    }
}

#[async_trait]
impl ExecutionCollaborator for ScriptedExecutor {
    async fn execute(&self, item: &WorkItem, policy: &Policy) -> ExecutionReport {
        self.executed.lock().push((item.id.clone(), policy.tier));
        let script = self
            .scripts
            .lock()
            .get(&item.id)
            .cloned()
            .unwrap_or(Script::Succeed);

        let tokens = item.estimate.input_tokens.min(policy.max_input_tokens)
            + item.estimate.output_tokens.min(policy.max_output_tokens);
        let mut checks: BTreeMap<String, bool> =
            item.baseline_checks.iter().map(|c| (c.clone(), true)).collect();
        let mut metrics = BTreeMap::from([("accuracy".to_string(), 0.95)]);
        let mut success = true;
        match script {
            Script::Succeed => {}
            Script::Hang(pause) => tokio::time::sleep(pause).await,
            Script::Fail => success = false,
            Script::OmitMetric => metrics.clear(),
            Script::Regress => {
                for passed in checks.values_mut() {
                    *passed = false;
                }
            }
        }
        ExecutionReport {
            success,
            detail: serde_json::json!({ "tier": policy.tier }),
            checks,
            metrics,
            tokens_used: Some(tokens),
        }
    }

    async fn rollback(&self, item: &WorkItem) -> Result<(), String> {
        self.rolled_back.lock().push(item.id.clone());
        Ok(())
    }
}

/// Non-empty artifact every test item declares as its output.
pub fn artifact(dir: &Path) -> PathBuf {
    let path = dir.join("artifact.txt");
    std::fs::write(&path, b"done").unwrap();
    path
}

/// Well-formed item costing `input + output` tokens.
pub fn item(id: &str, priority: Priority, input: u64, output: u64, output_path: &Path) -> WorkItem {
    WorkItem::new(id, priority, ResourceEstimate::tokens(input, output))
        .with_output("artifact", output_path)
        .with_criterion("accuracy", Comparator::Gte, 0.9)
}

/// Like [`item`] but declaring a 10ms duration, so gate deadlines come from
/// the configured minimum.
pub fn quick_item(id: &str, priority: Priority, input: u64, output: u64, output_path: &Path) -> WorkItem {
    let mut it = item(id, priority, input, output, output_path);
    it.estimate.duration = Duration::from_millis(10);
    it
}

/// Configuration for a `cap`-token budget with an absolute reserve and fast
/// retries.
pub fn config(cap: u64, reserve: u64) -> GovernorConfig {
    let mut cfg = GovernorConfig::default();
    cfg.budget.hard_cap = cap;
    cfg.budget.window = 5 * HOUR;
    cfg.budget.reserve_tokens = Some(reserve);
    cfg.gates.runner_workers = 1;
    cfg.session.hardware_backoff = Duration::from_millis(10);
    cfg.session.max_hardware_waits = 1;
    cfg.session.checkpoint_retry_backoff = Duration::from_millis(1);
    cfg
}

/// Handles a test keeps on a session's collaborators.
pub struct Harness {
    pub clock: ManualClock,
    pub telemetry: StaticTelemetry,
    pub store: InMemoryCheckpointStore,
    pub executor: ScriptedExecutor,
    pub audit: InMemoryAuditSink,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            clock: ManualClock::new(T0),
            telemetry: StaticTelemetry::new(32.0, 45.0),
            store: InMemoryCheckpointStore::default(),
            executor: ScriptedExecutor::default(),
            audit: InMemoryAuditSink::new(1_000),
        }
    }

    /// A fresh session sharing this harness's clock, store and executor,
    /// as a restarted process would.
    pub fn session(&self, cfg: GovernorConfig) -> SessionOrchestrator {
        SessionBuilder::new(cfg)
            .with_session_id("test-session")
            .with_clock(Arc::new(self.clock.clone()))
            .with_telemetry(Arc::new(self.telemetry.clone()))
            .with_executor(Arc::new(self.executor.clone()))
            .with_checkpoint_store(Arc::new(self.store.clone()))
            .with_audit_sink(Arc::new(self.audit.clone()))
            .build()
            .unwrap()
    }
}
