//! Serializable value types shared by the core, infra and runtime layers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Work item identifier assigned by the external planner.
pub type ItemId = String;

/// Priority levels. Derived ordering puts `Critical` highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work, first to wait.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Important work.
    High,
    /// Must make progress whenever any budget is left.
    Critical,
}

impl Priority {
    /// Whether this priority may fall back to the Emergency policy when the
    /// token budget blocks.
    #[must_use]
    pub const fn may_use_emergency(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// Declared cost of a work item. Never mutated after the planner emits it;
/// degraded admission produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    /// Prompt/input tokens.
    pub input_tokens: u64,
    /// Completion/output tokens.
    pub output_tokens: u64,
    /// Peak resident memory in GB.
    #[serde(default)]
    pub ram_gb: f64,
    /// Expected wall-clock duration.
    #[serde(with = "humantime_serde", default = "default_duration")]
    pub duration: Duration,
    /// Planner confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_duration() -> Duration {
    Duration::from_secs(60)
}

const fn default_confidence() -> f64 {
    0.5
}

impl ResourceEstimate {
    /// Token-only estimate with default RAM, duration and confidence.
    #[must_use]
    pub fn tokens(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ram_gb: 0.0,
            duration: default_duration(),
            confidence: default_confidence(),
        }
    }

    /// Total tokens charged against the budget.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Physical or budgetary resource the arbiter can report as limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Rolling compute-token budget.
    Tokens,
    /// CPU temperature.
    Thermal,
    /// Available RAM.
    Ram,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tokens => "tokens",
            Self::Thermal => "thermal",
            Self::Ram => "ram",
        };
        f.write_str(name)
    }
}
