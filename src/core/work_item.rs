//! Work item model: the unit the planner emits and the gates judge.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::gates::GateResult;
use crate::util::serde::{ItemId, Priority, ResourceEstimate};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ItemStatus {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// Admitted and budget reserved, gates not yet started.
    Admitted,
    /// Gates are running.
    Running,
    /// Put back for a later pass.
    Deferred(String),
    /// Every gate passed.
    Completed,
    /// A gate failed or blocked permanently.
    Failed(String),
    /// Implementation regressed and the executor reverted it.
    RolledBack(String),
}

impl ItemStatus {
    /// Completed, Failed and RolledBack are final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::RolledBack(_))
    }
}

/// How a measured metric is compared against a criterion threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// `measured >= threshold`
    Gte,
    /// `measured > threshold`
    Gt,
    /// `measured <= threshold`
    Lte,
    /// `measured < threshold`
    Lt,
    /// `|measured - threshold| <= 1e-9`
    Eq,
}

impl Comparator {
    /// Apply the comparison.
    #[must_use]
    pub fn holds(self, measured: f64, threshold: f64) -> bool {
        match self {
            Self::Gte => measured >= threshold,
            Self::Gt => measured > threshold,
            Self::Lte => measured <= threshold,
            Self::Lt => measured < threshold,
            Self::Eq => (measured - threshold).abs() <= 1e-9,
        }
    }

    /// Operator symbol for reasons and logs.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Gte => ">=",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
        }
    }
}

/// Named quantitative success criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    /// Metric name looked up in the measured metrics.
    pub name: String,
    /// Threshold value.
    pub threshold: f64,
    /// Comparison applied as `measured <op> threshold`.
    pub comparator: Comparator,
}

/// An artifact the item must leave behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// Display name.
    pub name: String,
    /// Location checked by the output probe.
    pub path: PathBuf,
}

/// Small-scale rehearsal input for the proof-of-concept gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Sample name.
    pub name: String,
    /// Opaque sample content handed to validators.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Planner-assigned identifier.
    pub id: ItemId,
    /// Priority class.
    #[serde(default)]
    pub priority: Priority,
    /// Declared cost.
    pub estimate: ResourceEstimate,
    /// Artifacts that must exist after delivery.
    #[serde(default)]
    pub outputs: Vec<OutputDescriptor>,
    /// Criteria checked against measured metrics at delivery.
    #[serde(default)]
    pub criteria: Vec<SuccessCriterion>,
    /// Rehearsal samples; empty skips the proof-of-concept gate.
    #[serde(default)]
    pub samples: Vec<Sample>,
    /// Checks that passed before this item ran and must keep passing.
    #[serde(default)]
    pub baseline_checks: BTreeSet<String>,
    /// Highest CPU temperature this item tolerates.
    #[serde(default)]
    pub max_temperature_c: Option<f64>,
    /// Opaque payload forwarded to the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: ItemStatus,
    /// Every gate result ever produced for this item.
    #[serde(default)]
    pub history: Vec<GateResult>,
}

impl WorkItem {
    /// Minimal item with an estimate and nothing else.
    pub fn new(id: impl Into<ItemId>, priority: Priority, estimate: ResourceEstimate) -> Self {
        Self {
            id: id.into(),
            priority,
            estimate,
            outputs: Vec::new(),
            criteria: Vec::new(),
            samples: Vec::new(),
            baseline_checks: BTreeSet::new(),
            max_temperature_c: None,
            payload: serde_json::Value::Null,
            status: ItemStatus::Pending,
            history: Vec::new(),
        }
    }

    /// Add an expected output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(OutputDescriptor {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// Add a success criterion.
    #[must_use]
    pub fn with_criterion(
        mut self,
        name: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
    ) -> Self {
        self.criteria.push(SuccessCriterion {
            name: name.into(),
            threshold,
            comparator,
        });
        self
    }

    /// Add a rehearsal sample.
    #[must_use]
    pub fn with_sample(mut self, name: impl Into<String>, data: serde_json::Value) -> Self {
        self.samples.push(Sample {
            name: name.into(),
            data,
        });
        self
    }

    /// Add a previously passing check.
    #[must_use]
    pub fn with_baseline_check(mut self, name: impl Into<String>) -> Self {
        self.baseline_checks.insert(name.into());
        self
    }

    /// Whether the item carries everything the gates need.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.outputs.is_empty() && !self.criteria.is_empty()
    }
}
