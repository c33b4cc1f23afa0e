//! Resource arbiter: one verdict over tokens, temperature and memory.
//!
//! Evaluation order is fixed. The token budget is checked first because
//! exhausting it mid-item cannot be undone, temperature second because it is a
//! hardware-safety limit, and RAM last because memory pressure is the most
//! recoverable of the three.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ArbiterConfig;
use crate::core::error::GovernorError;
use crate::core::ledger::BudgetLedger;
use crate::core::policy::{AdaptivePolicyTable, Tier};
use crate::util::clock::Clock;
use crate::util::serde::Resource;

/// One hardware reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Available RAM in GB.
    pub available_ram_gb: f64,
    /// CPU temperature in °C; `None` on hosts without a thermal sensor.
    pub cpu_temperature_c: Option<f64>,
}

/// Each figure of a sample read on its own, so one failed sensor does not
/// discard the other.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialSample {
    /// RAM reading or why it failed.
    pub available_ram_gb: Result<f64, String>,
    /// Temperature reading (`Ok(None)`: no sensor) or why it failed.
    pub cpu_temperature_c: Result<Option<f64>, String>,
}

/// Synchronous hardware telemetry query.
pub trait TelemetrySource: Send + Sync {
    /// Take a fresh sample.
    fn sample(&self) -> Result<TelemetrySample, GovernorError>;

    /// Take a fresh sample figure by figure. The default splits
    /// [`Self::sample`], failing both figures together.
    fn sample_partial(&self) -> PartialSample {
        match self.sample() {
            Ok(s) => PartialSample {
                available_ram_gb: Ok(s.available_ram_gb),
                cpu_temperature_c: Ok(s.cpu_temperature_c),
            },
            Err(e) => PartialSample {
                available_ram_gb: Err(e.to_string()),
                cpu_temperature_c: Err(e.to_string()),
            },
        }
    }
}

/// Arbiter verdict at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// When the snapshot was taken (ms since epoch).
    pub taken_at_ms: u128,
    /// Tier selected from the remaining ratio.
    pub tier: Tier,
    /// `remaining / hard_cap`.
    pub remaining_ratio: f64,
    /// Tokens available to admission (after reserve, clamped at zero).
    pub available_tokens: u64,
    /// RAM reading used for the verdict.
    pub available_ram_gb: f64,
    /// Temperature reading used for the verdict, absent without a sensor.
    pub cpu_temperature_c: Option<f64>,
    /// Whether any hardware figure is the conservative fallback.
    pub telemetry_fallback: bool,
    /// False when some resource blocks progress.
    pub can_continue: bool,
    /// First blocking resource in evaluation order.
    pub limiting_resource: Option<Resource>,
    /// Resources past their warning threshold (blocking ones included).
    pub warnings: Vec<Resource>,
}

impl ResourceSnapshot {
    /// Whether a thermal or RAM warning is active.
    #[must_use]
    pub fn hardware_warning(&self) -> bool {
        self.warnings
            .iter()
            .any(|r| matches!(r, Resource::Thermal | Resource::Ram))
    }
}

/// Combines ledger, policy table and hardware telemetry into one verdict.
pub struct ResourceArbiter {
    thresholds: ArbiterConfig,
    telemetry: Arc<dyn TelemetrySource>,
    clock: Arc<dyn Clock>,
    latest: Option<ResourceSnapshot>,
}

impl ResourceArbiter {
    /// Create an arbiter.
    pub fn new(
        thresholds: ArbiterConfig,
        telemetry: Arc<dyn TelemetrySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            thresholds,
            telemetry,
            clock,
            latest: None,
        }
    }

    /// Configured thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> &ArbiterConfig {
        &self.thresholds
    }

    /// Conservative stand-in used when telemetry fails: both readings sit
    /// exactly on their warning thresholds.
    #[must_use]
    pub const fn fallback_sample(&self) -> TelemetrySample {
        TelemetrySample {
            available_ram_gb: self.thresholds.warn_free_ram_gb,
            cpu_temperature_c: Some(self.thresholds.thermal_warning_c),
        }
    }

    /// Fresh hardware sample. Each figure that cannot be read is replaced by
    /// its conservative fallback; the flag reports whether any was.
    pub fn sample_hardware(&self) -> (TelemetrySample, bool) {
        let partial = self.telemetry.sample_partial();
        let fallback = self.fallback_sample();
        let mut used_fallback = false;

        let available_ram_gb = partial.available_ram_gb.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "RAM reading unavailable, using conservative default");
            used_fallback = true;
            fallback.available_ram_gb
        });
        let cpu_temperature_c = partial.cpu_temperature_c.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "temperature reading unavailable, using conservative default");
            used_fallback = true;
            fallback.cpu_temperature_c
        });

        (
            TelemetrySample {
                available_ram_gb,
                cpu_temperature_c,
            },
            used_fallback,
        )
    }

    /// Evaluate every resource with a fresh hardware sample.
    pub fn evaluate(
        &mut self,
        ledger: &BudgetLedger,
        table: &AdaptivePolicyTable,
    ) -> ResourceSnapshot {
        let (sample, telemetry_fallback) = self.sample_hardware();
        let snapshot = self.judge(ledger, table, sample, telemetry_fallback);
        if self.latest.as_ref().map(|s| s.tier) != Some(snapshot.tier) {
            tracing::info!(
                tier = ?snapshot.tier,
                remaining_ratio = snapshot.remaining_ratio,
                "budget tier changed"
            );
        }
        self.latest = Some(snapshot.clone());
        snapshot
    }

    /// Last snapshot produced by [`Self::evaluate`].
    #[must_use]
    pub const fn latest(&self) -> Option<&ResourceSnapshot> {
        self.latest.as_ref()
    }

    fn judge(
        &self,
        ledger: &BudgetLedger,
        table: &AdaptivePolicyTable,
        sample: TelemetrySample,
        telemetry_fallback: bool,
    ) -> ResourceSnapshot {
        let t = &self.thresholds;
        let remaining_ratio = ledger.remaining_ratio();
        let tier = table.tier_for(remaining_ratio);
        let available = ledger.available();

        let mut limiting_resource = None;
        let mut warnings = Vec::new();

        let tokens_blocked = tier == Tier::Emergency || available <= 0;
        if tokens_blocked || tier >= Tier::Critical {
            warnings.push(Resource::Tokens);
        }
        if tokens_blocked {
            limiting_resource = Some(Resource::Tokens);
        }

        let thermal_blocked = sample.cpu_temperature_c.is_some_and(|c| c >= t.thermal_limit_c);
        if thermal_blocked || sample.cpu_temperature_c.is_some_and(|c| c >= t.thermal_warning_c) {
            warnings.push(Resource::Thermal);
        }
        if thermal_blocked && limiting_resource.is_none() {
            limiting_resource = Some(Resource::Thermal);
        }

        let ram_blocked = sample.available_ram_gb < t.min_free_ram_gb;
        if ram_blocked || sample.available_ram_gb < t.warn_free_ram_gb {
            warnings.push(Resource::Ram);
        }
        if ram_blocked && limiting_resource.is_none() {
            limiting_resource = Some(Resource::Ram);
        }

        ResourceSnapshot {
            taken_at_ms: self.clock.now_ms(),
            tier,
            remaining_ratio,
            available_tokens: ledger.available_clamped(),
            available_ram_gb: sample.available_ram_gb,
            cpu_temperature_c: sample.cpu_temperature_c,
            telemetry_fallback,
            can_continue: limiting_resource.is_none(),
            limiting_resource,
            warnings,
        }
    }
}
