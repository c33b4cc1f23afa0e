//! Four-stage blocking quality gate pipeline.
//!
//! An admitted item walks PreFlight → ProofOfConcept → Implementation →
//! Delivery. The first result that is not `Passed` halts the item and no
//! later gate is evaluated. Every result, passing or not, is appended to the
//! item's history.
//!
//! PreFlight is evaluated in the caller against the telemetry sample the
//! admission decision was made on. The three later gates talk to external
//! collaborators and therefore run on the [`GateRunner`] under a deadline
//! derived from the item's declared duration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::core::arbiter::TelemetrySample;
use crate::core::executor::{
    AcceptAll, ExecutionCollaborator, ExecutionReport, Finding, FsOutputProbe, FunctionalOracle,
    OutputProbe, SampleValidator, Severity, StaticAnalyzer,
};
use crate::core::gate_runner::{GateRunError, GateRunner, RunnerStats};
use crate::core::policy::Policy;
use crate::core::work_item::{ItemStatus, SuccessCriterion, WorkItem};
use crate::util::clock::Clock;
use crate::util::serde::Resource;

/// Gate identity, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    /// Well-formedness and hardware headroom.
    PreFlight,
    /// Small-scale rehearsal against declared samples.
    ProofOfConcept,
    /// Full execution with regression checks.
    Implementation,
    /// Outputs, success criteria and oracle.
    Delivery,
}

impl GateName {
    /// All gates in evaluation order.
    pub const ORDER: [Self; 4] = [
        Self::PreFlight,
        Self::ProofOfConcept,
        Self::Implementation,
        Self::Delivery,
    ];

    /// Stable lowercase name used in logs and audit records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreFlight => "pre_flight",
            Self::ProofOfConcept => "proof_of_concept",
            Self::Implementation => "implementation",
            Self::Delivery => "delivery",
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    /// The item may proceed.
    Passed,
    /// A condition outside the item's control stopped it.
    Blocked,
    /// The item itself is at fault.
    Failed,
}

/// One gate evaluation, produced fresh each time and kept in the item's
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// Gate evaluated.
    pub gate: GateName,
    /// Verdict.
    pub outcome: GateOutcome,
    /// One-line explanation.
    pub reason: String,
    /// Structured detail for the audit trail.
    #[serde(default)]
    pub detail: Value,
    /// Whether this result halts the item.
    pub blocking: bool,
    /// Evaluation time (ms since epoch).
    pub evaluated_at_ms: u128,
}

impl GateResult {
    fn new(
        gate: GateName,
        outcome: GateOutcome,
        reason: impl Into<String>,
        detail: Value,
        at_ms: u128,
    ) -> Self {
        Self {
            gate,
            outcome,
            reason: reason.into(),
            detail,
            blocking: outcome != GateOutcome::Passed,
            evaluated_at_ms: at_ms,
        }
    }

    /// Whether the gate passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }
}

/// What the pipeline concluded for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// Final status; terminal unless PreFlight was blocked by hardware, in
    /// which case it is `Deferred`.
    pub status: ItemStatus,
    /// Results in evaluation order (also appended to the item's history).
    pub results: Vec<GateResult>,
    /// Tokens the executor reported consuming, if it ran and reported.
    pub tokens_used: Option<u64>,
}

impl PipelineOutcome {
    /// Last gate that was evaluated.
    #[must_use]
    pub fn last_gate(&self) -> Option<GateName> {
        self.results.last().map(|r| r.gate)
    }

    /// Hardware resource that blocked PreFlight, if that is why the item
    /// stopped.
    #[must_use]
    pub fn blocked_by(&self) -> Option<Resource> {
        self.results
            .last()
            .filter(|r| r.gate == GateName::PreFlight && r.outcome == GateOutcome::Blocked)
            .and_then(|r| r.detail.get("blocked_by"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Criteria not met by `metrics`. A criterion with no measurement is unmet.
#[must_use]
pub fn unmet_criteria(criteria: &[SuccessCriterion], metrics: &BTreeMap<String, f64>) -> Vec<String> {
    criteria
        .iter()
        .filter_map(|c| match metrics.get(&c.name) {
            None => Some(format!("{}: not measured", c.name)),
            Some(measured) if !c.comparator.holds(*measured, c.threshold) => Some(format!(
                "{}: {measured} {} {} does not hold",
                c.name,
                c.comparator.symbol(),
                c.threshold
            )),
            Some(_) => None,
        })
        .collect()
}

/// Append `result` to the item's history and the run's results; return it
/// back when it halts the item.
fn record(
    item: &mut WorkItem,
    results: &mut Vec<GateResult>,
    result: GateResult,
) -> Option<GateResult> {
    if result.passed() {
        debug!(item_id = %item.id, gate = %result.gate, reason = %result.reason, "gate passed");
    } else {
        warn!(
            item_id = %item.id,
            gate = %result.gate,
            outcome = ?result.outcome,
            reason = %result.reason,
            "gate halted item"
        );
    }
    item.history.push(result.clone());
    results.push(result.clone());
    (!result.passed()).then_some(result)
}

/// Sequential gate evaluator bound to its collaborators.
pub struct GatePipeline {
    execution: Arc<dyn ExecutionCollaborator>,
    validator: Arc<dyn SampleValidator>,
    analyzer: Option<Arc<dyn StaticAnalyzer>>,
    oracle: Option<Arc<dyn FunctionalOracle>>,
    probe: Arc<dyn OutputProbe>,
    runner: GateRunner,
    config: GateConfig,
    thermal_limit_c: f64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for GatePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePipeline")
            .field("runner", &self.runner)
            .field("analyzer", &self.analyzer.is_some())
            .field("oracle", &self.oracle.is_some())
            .field("thermal_limit_c", &self.thermal_limit_c)
            .finish_non_exhaustive()
    }
}

impl GatePipeline {
    /// Pipeline with the accept-all validator, the filesystem output probe
    /// and no analyzer or oracle. `thermal_limit_c` applies to items that
    /// declare no temperature limit of their own.
    ///
    /// # Errors
    ///
    /// Fails if the gate runner threads cannot be started.
    pub fn new(
        execution: Arc<dyn ExecutionCollaborator>,
        config: GateConfig,
        thermal_limit_c: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GateRunError> {
        let runner = GateRunner::new(config.runner_workers, config.runner_queue_depth)?;
        Ok(Self {
            execution,
            validator: Arc::new(AcceptAll),
            analyzer: None,
            oracle: None,
            probe: Arc::new(FsOutputProbe),
            runner,
            config,
            thermal_limit_c,
            clock,
        })
    }

    /// Replace the sample validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn SampleValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Attach a static analyzer to the implementation gate.
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn StaticAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Attach a functional oracle to the delivery gate.
    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn FunctionalOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Replace the output probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn OutputProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Gate runner counters.
    #[must_use]
    pub fn runner_stats(&self) -> RunnerStats {
        self.runner.stats()
    }

    /// Stop the gate runner.
    pub fn shutdown(&self) {
        self.runner.shutdown();
    }

    /// Drive `item` through all four gates under `policy`, using `hardware`
    /// as the PreFlight reading.
    pub fn run(
        &self,
        item: &mut WorkItem,
        policy: &Policy,
        hardware: &TelemetrySample,
    ) -> PipelineOutcome {
        item.status = ItemStatus::Running;
        let timeout = self.config.timeout_for(item.estimate.duration);
        let mut results = Vec::with_capacity(GateName::ORDER.len());
        let mut tokens_used = None;

        let status = 'gates: {
            let pre = self.pre_flight(item, hardware);
            let halted = record(item, &mut results, pre);
            if let Some(result) = halted {
                break 'gates match result.outcome {
                    GateOutcome::Blocked => ItemStatus::Deferred(result.reason),
                    _ => ItemStatus::Failed(result.reason),
                };
            }

            let poc = self.proof_of_concept(item, timeout);
            if let Some(result) = record(item, &mut results, poc) {
                break 'gates ItemStatus::Failed(result.reason);
            }

            let (implementation, report, regressed) = self.implementation(item, policy, timeout);
            tokens_used = report.as_ref().and_then(|r| r.tokens_used);
            if let Some(result) = record(item, &mut results, implementation) {
                break 'gates if regressed {
                    self.roll_back(item, result.reason, timeout)
                } else {
                    ItemStatus::Failed(result.reason)
                };
            }

            let report = report.unwrap_or_default();
            let delivery = self.delivery(item, report, timeout);
            if let Some(result) = record(item, &mut results, delivery) {
                break 'gates ItemStatus::Failed(result.reason);
            }
            ItemStatus::Completed
        };

        info!(item_id = %item.id, status = ?status, gates = results.len(), "gate pipeline finished");
        item.status = status.clone();
        PipelineOutcome {
            status,
            results,
            tokens_used,
        }
    }

    fn now(&self) -> u128 {
        self.clock.now_ms()
    }

    fn pre_flight(&self, item: &WorkItem, hardware: &TelemetrySample) -> GateResult {
        let gate = GateName::PreFlight;
        let mut problems = Vec::new();
        if item.outputs.is_empty() {
            problems.push("declares no outputs");
        }
        if item.criteria.is_empty() {
            problems.push("declares no success criteria");
        }
        if !problems.is_empty() {
            return GateResult::new(
                gate,
                GateOutcome::Failed,
                format!("malformed item: {}", problems.join(", ")),
                json!({ "problems": problems }),
                self.now(),
            );
        }

        let limit_c = item.max_temperature_c.unwrap_or(self.thermal_limit_c);
        let mut detail = json!({
            "available_ram_gb": hardware.available_ram_gb,
            "required_ram_gb": item.estimate.ram_gb,
            "cpu_temperature_c": hardware.cpu_temperature_c,
            "temperature_limit_c": limit_c,
        });
        let blocked = if hardware.available_ram_gb < item.estimate.ram_gb {
            Some((
                Resource::Ram,
                format!(
                    "needs {:.1} GB RAM, {:.1} GB available",
                    item.estimate.ram_gb, hardware.available_ram_gb
                ),
            ))
        } else {
            hardware
                .cpu_temperature_c
                .filter(|c| *c >= limit_c)
                .map(|c| (Resource::Thermal, format!("cpu at {c:.1} °C, item limit {limit_c:.1} °C")))
        };

        match blocked {
            Some((resource, reason)) => {
                detail["blocked_by"] = json!(resource);
                GateResult::new(gate, GateOutcome::Blocked, reason, detail, self.now())
            }
            None => GateResult::new(gate, GateOutcome::Passed, "ready", detail, self.now()),
        }
    }

    fn proof_of_concept(&self, item: &WorkItem, timeout: Duration) -> GateResult {
        let gate = GateName::ProofOfConcept;
        if item.samples.is_empty() {
            return GateResult::new(
                gate,
                GateOutcome::Passed,
                "no samples declared",
                json!({ "skipped": true }),
                self.now(),
            );
        }

        let validator = Arc::clone(&self.validator);
        let execution = Arc::clone(&self.execution);
        let item = item.clone();
        let verdict = self.runner.run(
            move || async move {
                for sample in &item.samples {
                    let check = validator.evaluate(sample);
                    if !check.passed {
                        return Err(format!("sample {} rejected: {}", sample.name, check.reason));
                    }
                }
                Ok(execution.rehearse(&item, &item.samples).await)
            },
            timeout,
        );

        match verdict {
            Ok(Ok(outcome)) if outcome.success => GateResult::new(
                gate,
                GateOutcome::Passed,
                "rehearsal succeeded",
                outcome.detail,
                self.now(),
            ),
            Ok(Ok(outcome)) => GateResult::new(
                gate,
                GateOutcome::Failed,
                "rehearsal failed",
                outcome.detail,
                self.now(),
            ),
            Ok(Err(rejected)) => {
                GateResult::new(gate, GateOutcome::Failed, rejected, Value::Null, self.now())
            }
            Err(e) => self.runner_failure(gate, &e),
        }
    }

    /// Returns the result, the executor report when one arrived, and whether
    /// the failure was a regression that calls for rollback.
    fn implementation(
        &self,
        item: &WorkItem,
        policy: &Policy,
        timeout: Duration,
    ) -> (GateResult, Option<ExecutionReport>, bool) {
        let gate = GateName::Implementation;
        let execution = Arc::clone(&self.execution);
        let analyzer = self.analyzer.clone();
        let owned = item.clone();
        let policy = *policy;
        let ran = self.runner.run(
            move || async move {
                let report = execution.execute(&owned, &policy).await;
                let findings = analyzer
                    .map(|a| a.analyze(&owned, &report))
                    .unwrap_or_default();
                (report, findings)
            },
            timeout,
        );

        let (report, findings) = match ran {
            Ok(out) => out,
            Err(e) => return (self.runner_failure(gate, &e), None, false),
        };

        let result = self.judge_implementation(item, &report, &findings);
        let regressed = result.detail.get("regressions").is_some();
        (result, Some(report), regressed)
    }

    fn judge_implementation(
        &self,
        item: &WorkItem,
        report: &ExecutionReport,
        findings: &[Finding],
    ) -> GateResult {
        let gate = GateName::Implementation;
        if !report.success {
            return GateResult::new(
                gate,
                GateOutcome::Failed,
                "executor reported failure",
                json!({ "executor": report.detail }),
                self.now(),
            );
        }

        let regressions: Vec<&str> = item
            .baseline_checks
            .iter()
            .filter(|name| report.checks.get(*name) != Some(&true))
            .map(String::as_str)
            .collect();
        if !regressions.is_empty() {
            return GateResult::new(
                gate,
                GateOutcome::Failed,
                format!("regression in previously passing checks: {}", regressions.join(", ")),
                json!({ "regressions": regressions }),
                self.now(),
            );
        }

        let new_failures: Vec<&str> = report
            .checks
            .iter()
            .filter(|(name, passed)| !**passed && !item.baseline_checks.contains(*name))
            .map(|(name, _)| name.as_str())
            .collect();
        if !new_failures.is_empty() {
            return GateResult::new(
                gate,
                GateOutcome::Failed,
                format!("new checks failing: {}", new_failures.join(", ")),
                json!({ "failing": new_failures }),
                self.now(),
            );
        }

        let errors: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .collect();
        if !errors.is_empty() {
            let rules: Vec<&str> = errors.iter().map(|f| f.rule.as_str()).collect();
            return GateResult::new(
                gate,
                GateOutcome::Blocked,
                format!("static analysis: {}", rules.join(", ")),
                json!({ "findings": errors }),
                self.now(),
            );
        }

        GateResult::new(
            gate,
            GateOutcome::Passed,
            format!("{} checks passing", report.checks.len()),
            json!({ "checks": report.checks, "findings": findings }),
            self.now(),
        )
    }

    fn delivery(&self, item: &WorkItem, report: ExecutionReport, timeout: Duration) -> GateResult {
        let gate = GateName::Delivery;
        let probe = Arc::clone(&self.probe);
        let oracle = self.oracle.clone();
        let item = item.clone();
        let probed = self.runner.run(
            move || async move {
                let missing: Vec<String> = item
                    .outputs
                    .iter()
                    .filter(|o| probe.size(o).unwrap_or(0) == 0)
                    .map(|o| o.name.clone())
                    .collect();
                let unmet = unmet_criteria(&item.criteria, &report.metrics);
                let confidence = oracle.map(|o| o.confidence(&item, &report));
                (missing, unmet, confidence)
            },
            timeout,
        );

        let (missing, unmet, confidence) = match probed {
            Ok(out) => out,
            Err(e) => return self.runner_failure(gate, &e),
        };

        let threshold = self.config.oracle_threshold;
        let oracle_ok = confidence.is_none_or(|c| c >= threshold);
        let detail = json!({
            "missing_outputs": missing,
            "unmet_criteria": unmet,
            "oracle_confidence": confidence,
            "oracle_threshold": threshold,
        });

        let mut reasons = Vec::new();
        if !missing.is_empty() {
            reasons.push(format!("missing or empty outputs: {}", missing.join(", ")));
        }
        if !unmet.is_empty() {
            reasons.push(format!("unmet criteria: {}", unmet.join("; ")));
        }
        if !oracle_ok {
            reasons.push(format!(
                "oracle confidence {:.2} below {threshold:.2}",
                confidence.unwrap_or_default()
            ));
        }

        if reasons.is_empty() {
            GateResult::new(gate, GateOutcome::Passed, "delivered", detail, self.now())
        } else {
            GateResult::new(gate, GateOutcome::Failed, reasons.join("; "), detail, self.now())
        }
    }

    fn roll_back(&self, item: &WorkItem, reason: String, timeout: Duration) -> ItemStatus {
        let execution = Arc::clone(&self.execution);
        let owned = item.clone();
        let undone = self
            .runner
            .run(move || async move { execution.rollback(&owned).await }, timeout);
        match undone {
            Ok(Ok(())) => {
                info!(item_id = %item.id, "implementation rolled back");
                ItemStatus::RolledBack(reason)
            }
            Ok(Err(e)) => {
                warn!(item_id = %item.id, error = %e, "rollback failed");
                ItemStatus::Failed(format!("{reason}; rollback failed: {e}"))
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "rollback did not complete");
                ItemStatus::Failed(format!("{reason}; rollback failed: {e}"))
            }
        }
    }

    fn runner_failure(&self, gate: GateName, err: &GateRunError) -> GateResult {
        GateResult::new(
            gate,
            GateOutcome::Failed,
            err.to_string(),
            json!({ "runner_error": err.to_string() }),
            self.now(),
        )
    }
}
