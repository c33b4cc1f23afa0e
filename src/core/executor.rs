//! Collaborator interfaces consumed by the quality gates.
//!
//! The core never looks inside a work item's payload; anything that needs to
//! understand it lives behind one of these traits. Each trait has either a
//! documented default implementation or is optional in the pipeline, so real
//! validators can be substituted without touching the gates.

use std::collections::BTreeMap;
use std::fs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::policy::Policy;
use crate::core::work_item::{OutputDescriptor, Sample, WorkItem};

/// `{success, detail}` returned by a rehearsal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the rehearsal worked.
    pub success: bool,
    /// Opaque executor detail.
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl ExecutionOutcome {
    /// Successful outcome with a message.
    pub fn ok(detail: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    /// Failed outcome with a message.
    pub fn failed(detail: impl Into<serde_json::Value>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Result of full-scale execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionReport {
    /// Whether the executor considers the run successful.
    pub success: bool,
    /// Opaque executor detail.
    #[serde(default)]
    pub detail: serde_json::Value,
    /// Named checks and whether each passed.
    #[serde(default)]
    pub checks: BTreeMap<String, bool>,
    /// Measured metrics used by delivery criteria.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Tokens actually consumed, when the executor knows.
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

/// External executor used by the proof-of-concept and implementation gates.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use session_governor::core::{ExecutionCollaborator, ExecutionReport, Policy, WorkItem};
///
/// struct Noop;
///
/// #[async_trait]
/// impl ExecutionCollaborator for Noop {
///     async fn execute(&self, _item: &WorkItem, _policy: &Policy) -> ExecutionReport {
///         ExecutionReport { success: true, ..ExecutionReport::default() }
///     }
/// }
/// ```
#[async_trait]
pub trait ExecutionCollaborator: Send + Sync + 'static {
    /// Small-scale rehearsal against the item's declared samples.
    async fn rehearse(&self, _item: &WorkItem, samples: &[Sample]) -> ExecutionOutcome {
        ExecutionOutcome::ok(format!("no rehearsal for {} samples", samples.len()))
    }

    /// Full-scale execution within `policy`'s sizing.
    async fn execute(&self, item: &WorkItem, policy: &Policy) -> ExecutionReport;

    /// Revert whatever `execute` changed.
    async fn rollback(&self, _item: &WorkItem) -> Result<(), String> {
        Ok(())
    }
}

/// Verdict on one rehearsal sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the sample is acceptable.
    pub passed: bool,
    /// Explanation.
    pub reason: String,
}

/// Per-sample validator: `evaluate(sample) -> result`.
pub trait SampleValidator: Send + Sync + 'static {
    /// Judge one sample.
    fn evaluate(&self, sample: &Sample) -> ValidationResult;
}

/// Validator that accepts every sample. This is the extension point for
/// domain validators; it performs no checking at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SampleValidator for AcceptAll {
    fn evaluate(&self, sample: &Sample) -> ValidationResult {
        ValidationResult {
            passed: true,
            reason: format!("{}: accepted without validation", sample.name),
        }
    }
}

/// Severity of a static-analysis finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Worth a look; does not block.
    Warning,
    /// Blocks the implementation gate.
    Error,
}

/// One static-analysis finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule that fired.
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
}

/// Pluggable static analysis, invoked only from the implementation gate.
pub trait StaticAnalyzer: Send + Sync + 'static {
    /// Inspect the executed item.
    fn analyze(&self, item: &WorkItem, report: &ExecutionReport) -> Vec<Finding>;
}

/// Functional oracle consulted at delivery.
pub trait FunctionalOracle: Send + Sync + 'static {
    /// Confidence in `[0, 1]` that the delivered work is functionally right.
    fn confidence(&self, item: &WorkItem, report: &ExecutionReport) -> f64;
}

/// Locates declared outputs.
pub trait OutputProbe: Send + Sync + 'static {
    /// Size in bytes, or `None` when the output does not exist.
    fn size(&self, output: &OutputDescriptor) -> Option<u64>;
}

/// Probe that stats the output path on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOutputProbe;

impl OutputProbe for FsOutputProbe {
    fn size(&self, output: &OutputDescriptor) -> Option<u64> {
        fs::metadata(&output.path).ok().map(|m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_all_accepts() {
        let s = Sample {
            name: "s1".into(),
            data: serde_json::json!({"x": 1}),
        };
        assert!(AcceptAll.evaluate(&s).passed);
    }

    #[test]
    fn fs_probe_reports_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let desc = OutputDescriptor {
            name: "out".into(),
            path: path.clone(),
        };
        assert_eq!(FsOutputProbe.size(&desc), None);
        fs::write(&path, b"").unwrap();
        assert_eq!(FsOutputProbe.size(&desc), Some(0));
        fs::write(&path, b"hello").unwrap();
        assert_eq!(FsOutputProbe.size(&desc), Some(5));
    }

    #[test]
    fn report_deserializes_from_minimal_json() {
        let r: ExecutionReport = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(r.success);
        assert!(r.metrics.is_empty());
        assert_eq!(r.tokens_used, None);
    }
}
