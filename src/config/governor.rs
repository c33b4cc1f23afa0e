//! Governor configuration structures.
//!
//! Every section has defaults, so an empty JSON object is a valid
//! configuration. Durations are written in humantime form (`"5h"`, `"30s"`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::policy::{AdaptivePolicyTable, Tier};

/// Token budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Hard cap enforced by the external API over the window.
    pub hard_cap: u64,
    /// Trailing window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Reserve as a fraction of the hard cap.
    pub reserve_fraction: f64,
    /// Absolute reserve; overrides `reserve_fraction` when set.
    pub reserve_tokens: Option<u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hard_cap: 200_000,
            window: Duration::from_secs(5 * 3600),
            reserve_fraction: 0.10,
            reserve_tokens: None,
        }
    }
}

impl BudgetConfig {
    /// Reserve in tokens.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn reserve(&self) -> u64 {
        self.reserve_tokens
            .unwrap_or_else(|| (self.hard_cap as f64 * self.reserve_fraction).ceil() as u64)
    }

    /// Validate budget values.
    pub fn validate(&self) -> Result<(), String> {
        if self.hard_cap == 0 {
            return Err("hard_cap must be greater than 0".into());
        }
        if self.window.is_zero() {
            return Err("window must be greater than 0".into());
        }
        if !(0.0..1.0).contains(&self.reserve_fraction) {
            return Err("reserve_fraction must lie in [0, 1)".into());
        }
        if self.reserve() >= self.hard_cap {
            return Err("reserve must be smaller than hard_cap".into());
        }
        Ok(())
    }
}

/// Hardware thresholds used by the resource arbiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// CPU temperature at which work stops (°C).
    pub thermal_limit_c: f64,
    /// CPU temperature at which a warning is raised (°C).
    pub thermal_warning_c: f64,
    /// Free RAM below which work stops (GB).
    pub min_free_ram_gb: f64,
    /// Free RAM below which a warning is raised (GB).
    pub warn_free_ram_gb: f64,
    /// Background sampling cadence.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            thermal_limit_c: 90.0,
            thermal_warning_c: 80.0,
            min_free_ram_gb: 2.0,
            warn_free_ram_gb: 4.0,
            sample_interval: Duration::from_secs(30),
        }
    }
}

impl ArbiterConfig {
    /// Warning thresholds must be looser than hard limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.thermal_warning_c >= self.thermal_limit_c {
            return Err("thermal_warning_c must be below thermal_limit_c".into());
        }
        if self.min_free_ram_gb < 0.0 || self.warn_free_ram_gb <= self.min_free_ram_gb {
            return Err("warn_free_ram_gb must exceed a non-negative min_free_ram_gb".into());
        }
        if self.sample_interval.is_zero() {
            return Err("sample_interval must be greater than 0".into());
        }
        Ok(())
    }
}

/// Admission controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Cost multiplier per task subtype. Degraded estimates always use the
    /// largest one.
    pub subtype_cost_factors: BTreeMap<String, f64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let subtype_cost_factors = [("summarize", 1.0), ("analyze", 1.15), ("generate", 1.3)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            subtype_cost_factors,
        }
    }
}

impl AdmissionConfig {
    /// Largest subtype factor, never below 1.
    #[must_use]
    pub fn pessimistic_factor(&self) -> f64 {
        self.subtype_cost_factors
            .values()
            .copied()
            .fold(1.0, f64::max)
    }

    /// Factors must be finite and positive.
    pub fn validate(&self) -> Result<(), String> {
        for (name, factor) in &self.subtype_cost_factors {
            if !factor.is_finite() || *factor <= 0.0 {
                return Err(format!("subtype `{name}` has invalid cost factor {factor}"));
            }
        }
        Ok(())
    }
}

/// Quality gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Gate timeout as a multiple of the item's declared duration.
    pub timeout_factor: f64,
    /// Lower bound on any gate timeout.
    #[serde(with = "humantime_serde")]
    pub min_timeout: Duration,
    /// Minimum functional-oracle confidence at delivery.
    pub oracle_threshold: f64,
    /// Gate runner worker threads.
    pub runner_workers: usize,
    /// Pending gate jobs before submissions are refused.
    pub runner_queue_depth: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout_factor: 1.5,
            min_timeout: Duration::from_secs(30),
            oracle_threshold: 0.8,
            runner_workers: num_cpus::get().clamp(1, 4),
            runner_queue_depth: 16,
        }
    }
}

impl GateConfig {
    /// Timeout for a gate on an item declaring `duration`. Saturates at
    /// [`Duration::MAX`] instead of overflowing.
    #[must_use]
    pub fn timeout_for(&self, duration: Duration) -> Duration {
        Duration::try_from_secs_f64(duration.as_secs_f64() * self.timeout_factor)
            .unwrap_or(Duration::MAX)
            .max(self.min_timeout)
    }

    /// Validate gate values.
    pub fn validate(&self) -> Result<(), String> {
        if !self.timeout_factor.is_finite() || self.timeout_factor < 1.0 {
            return Err("timeout_factor must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.oracle_threshold) {
            return Err("oracle_threshold must lie in [0, 1]".into());
        }
        if self.runner_workers == 0 {
            return Err("runner_workers must be greater than 0".into());
        }
        if self.runner_queue_depth == 0 {
            return Err("runner_queue_depth must be greater than 0".into());
        }
        Ok(())
    }
}

/// What the orchestrator does once the budget reaches the Critical tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopStrategy {
    /// Finish the in-flight item, then checkpoint and stop.
    #[default]
    FinishCurrent,
    /// Keep admitting degraded work until Emergency.
    Continue,
}

/// Session-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Behaviour at the Critical tier.
    pub stop_strategy: StopStrategy,
    /// Wall-clock session boundary.
    #[serde(with = "humantime_serde::option")]
    pub max_session: Option<Duration>,
    /// Maximum queued items.
    pub max_queue_depth: usize,
    /// Pause before re-checking hardware after a pass deferred on it.
    #[serde(with = "humantime_serde")]
    pub hardware_backoff: Duration,
    /// Hardware waits before the session gives up and checkpoints.
    pub max_hardware_waits: u32,
    /// Pause before retrying a failed checkpoint write.
    #[serde(with = "humantime_serde")]
    pub checkpoint_retry_backoff: Duration,
    /// Audit events retained in memory.
    pub audit_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_strategy: StopStrategy::default(),
            max_session: None,
            max_queue_depth: 10_000,
            hardware_backoff: Duration::from_secs(60),
            max_hardware_waits: 5,
            checkpoint_retry_backoff: Duration::from_millis(500),
            audit_capacity: 4_096,
        }
    }
}

impl SessionConfig {
    /// Validate session values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.audit_capacity == 0 {
            return Err("audit_capacity must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GovernorConfig {
    /// Token budget.
    pub budget: BudgetConfig,
    /// Tier boundaries and per-tier policies.
    pub policies: AdaptivePolicyTable,
    /// Hardware thresholds.
    pub arbiter: ArbiterConfig,
    /// Admission settings.
    pub admission: AdmissionConfig,
    /// Gate settings.
    pub gates: GateConfig,
    /// Session settings.
    pub session: SessionConfig,
    /// External executor command (program followed by arguments).
    pub executor_command: Option<Vec<String>>,
}

impl GovernorConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.budget
            .validate()
            .map_err(|e| format!("budget invalid: {e}"))?;
        self.policies
            .validate()
            .map_err(|e| format!("policies invalid: {e}"))?;
        self.arbiter
            .validate()
            .map_err(|e| format!("arbiter invalid: {e}"))?;
        self.admission
            .validate()
            .map_err(|e| format!("admission invalid: {e}"))?;
        self.gates
            .validate()
            .map_err(|e| format!("gates invalid: {e}"))?;
        self.session
            .validate()
            .map_err(|e| format!("session invalid: {e}"))?;
        if let Some(cmd) = &self.executor_command {
            if cmd.is_empty() {
                return Err("executor_command must name a program".into());
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Tier at which the session stops after the in-flight item, if any.
    #[must_use]
    pub const fn soft_stop_tier(&self) -> Option<Tier> {
        match self.session.stop_strategy {
            StopStrategy::FinishCurrent => Some(Tier::Critical),
            StopStrategy::Continue => None,
        }
    }
}
