//! Admission controller ("governor").
//!
//! The governor is the only writer of the budget ledger. Each decision takes a
//! fresh arbiter snapshot, and an admitted estimate is charged to the ledger
//! before `decide` returns, so consecutive decisions always see each other.

use serde::{Deserialize, Serialize};

use crate::config::AdmissionConfig;
use crate::core::arbiter::{ResourceArbiter, ResourceSnapshot};
use crate::core::ledger::{BudgetLedger, LedgerEntry};
use crate::core::policy::{AdaptivePolicyTable, Policy, Tier};
use crate::core::work_item::WorkItem;
use crate::util::serde::{Resource, ResourceEstimate};

/// Reason attached to a deferral when even the Emergency policy does not fit.
pub const INSUFFICIENT_BUDGET: &str = "insufficient budget under maximal adaptation";

/// Sizing chosen for a degraded admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adaptation {
    /// Policy the executor must respect.
    pub policy: Policy,
    /// Re-estimated cost under that policy (this is what was reserved).
    pub estimate: ResourceEstimate,
    /// Whether this came from the Emergency retry for a blocked budget.
    pub emergency_retry: bool,
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// Run at declared size.
    Admit {
        /// Reserved estimate (the declared one).
        estimate: ResourceEstimate,
    },
    /// Run under a degraded policy.
    AdmitDegraded {
        /// Chosen sizing.
        adaptation: Adaptation,
    },
    /// Not now.
    Defer {
        /// Why.
        reason: String,
        /// Resource responsible, when one resource is to blame.
        resource: Option<Resource>,
    },
}

impl Decision {
    /// Whether the item may run.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        !matches!(self, Self::Defer { .. })
    }

    /// Tokens reserved by this decision.
    #[must_use]
    pub const fn reserved_tokens(&self) -> u64 {
        match self {
            Self::Admit { estimate } => estimate.total_tokens(),
            Self::AdmitDegraded { adaptation } => adaptation.estimate.total_tokens(),
            Self::Defer { .. } => 0,
        }
    }

    /// Degraded policy to hand the executor; `None` for a full-size admission.
    #[must_use]
    pub const fn policy(&self) -> Option<&Policy> {
        match self {
            Self::AdmitDegraded { adaptation } => Some(&adaptation.policy),
            _ => None,
        }
    }

    fn defer(reason: impl Into<String>, resource: Option<Resource>) -> Self {
        Self::Defer {
            reason: reason.into(),
            resource,
        }
    }
}

/// Admission controller owning the ledger, policy table and arbiter.
pub struct Governor {
    ledger: BudgetLedger,
    table: AdaptivePolicyTable,
    arbiter: ResourceArbiter,
    pessimistic_factor: f64,
}

impl Governor {
    /// Assemble a governor.
    pub fn new(
        ledger: BudgetLedger,
        table: AdaptivePolicyTable,
        arbiter: ResourceArbiter,
        admission: &AdmissionConfig,
    ) -> Self {
        Self {
            ledger,
            table,
            arbiter,
            pessimistic_factor: admission.pessimistic_factor(),
        }
    }

    /// Read access to the ledger.
    #[must_use]
    pub const fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Policy table.
    #[must_use]
    pub const fn table(&self) -> &AdaptivePolicyTable {
        &self.table
    }

    /// Arbiter (for fresh hardware samples and the latest snapshot).
    #[must_use]
    pub const fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    /// Replace ledger contents from a checkpoint.
    pub fn restore_ledger(&mut self, entries: impl IntoIterator<Item = LedgerEntry>) {
        self.ledger.restore(entries);
    }

    /// Fresh arbiter snapshot.
    pub fn assess(&mut self) -> ResourceSnapshot {
        self.arbiter.evaluate(&self.ledger, &self.table)
    }

    /// Decide on `item` at its declared estimate.
    pub fn decide(&mut self, item: &WorkItem) -> Decision {
        let estimate = item.estimate.clone();
        self.decide_with(item, &estimate)
    }

    /// Decide on `item` at an explicit estimate, reserving on admission.
    pub fn decide_with(&mut self, item: &WorkItem, estimate: &ResourceEstimate) -> Decision {
        let snapshot = self.assess();
        let decision = self.choose(item, estimate, &snapshot);
        let reserved = decision.reserved_tokens();
        if reserved > 0 {
            let charged = match &decision {
                Decision::AdmitDegraded { adaptation } => &adaptation.estimate,
                _ => estimate,
            };
            self.ledger.record(charged.input_tokens, charged.output_tokens);
        }
        match &decision {
            Decision::Admit { .. } => tracing::info!(
                item_id = %item.id,
                tier = ?snapshot.tier,
                reserved,
                "admitted"
            ),
            Decision::AdmitDegraded { adaptation } => tracing::info!(
                item_id = %item.id,
                tier = ?snapshot.tier,
                policy = ?adaptation.policy.tier,
                emergency_retry = adaptation.emergency_retry,
                reserved,
                "admitted degraded"
            ),
            Decision::Defer { reason, .. } => tracing::info!(
                item_id = %item.id,
                tier = ?snapshot.tier,
                %reason,
                "deferred"
            ),
        }
        decision
    }

    fn choose(
        &self,
        item: &WorkItem,
        estimate: &ResourceEstimate,
        snapshot: &ResourceSnapshot,
    ) -> Decision {
        if !snapshot.can_continue {
            return self.blocked(item, estimate, snapshot);
        }

        let start = if snapshot.hardware_warning() {
            // margins are shrinking: no full-size work until they recover
            snapshot.tier.tighter()
        } else {
            if self.ledger.can_run(estimate) {
                return Decision::Admit {
                    estimate: estimate.clone(),
                };
            }
            snapshot.tier
        };

        self.adapt_from(start, estimate).map_or_else(
            || Decision::defer(INSUFFICIENT_BUDGET, Some(Resource::Tokens)),
            |adaptation| Decision::AdmitDegraded { adaptation },
        )
    }

    fn blocked(
        &self,
        item: &WorkItem,
        estimate: &ResourceEstimate,
        snapshot: &ResourceSnapshot,
    ) -> Decision {
        let limiting = snapshot.limiting_resource.unwrap_or(Resource::Tokens);
        if limiting != Resource::Tokens || !item.priority.may_use_emergency() {
            return Decision::defer(format!("{limiting} limit reached"), Some(limiting));
        }
        let policy = *self.table.policy(Tier::Emergency);
        let adapted = policy.adapt(estimate, self.pessimistic_factor);
        if self.ledger.can_run(&adapted) {
            return Decision::AdmitDegraded {
                adaptation: Adaptation {
                    policy,
                    estimate: adapted,
                    emergency_retry: true,
                },
            };
        }
        Decision::defer(
            format!(
                "tokens limit reached; emergency adaptation needs {} tokens, {} available",
                adapted.total_tokens(),
                self.ledger.available_clamped()
            ),
            Some(Resource::Tokens),
        )
    }

    /// First policy from `start` downward whose pessimistic re-estimate fits.
    fn adapt_from(&self, start: Tier, estimate: &ResourceEstimate) -> Option<Adaptation> {
        self.table.tiers_from(start).find_map(|policy| {
            let adapted = policy.adapt(estimate, self.pessimistic_factor);
            self.ledger.can_run(&adapted).then(|| Adaptation {
                policy: *policy,
                estimate: adapted,
                emergency_retry: false,
            })
        })
    }

    /// Return the reservation of an item that was admitted but never ran.
    pub fn release(&mut self, item_id: &str, reserved: u64) {
        if reserved > 0 && self.ledger.cancel_last(reserved) {
            tracing::debug!(item_id, reserved, "reservation released");
        }
    }

    /// Reconcile a finished item's actual consumption with its reservation.
    /// Overage is charged; under-use is not refunded.
    pub fn settle(&mut self, item_id: &str, reserved: u64, actual: Option<u64>) {
        let Some(actual) = actual else {
            return;
        };
        if actual > reserved {
            let overage = actual - reserved;
            tracing::warn!(item_id, reserved, actual, overage, "item exceeded its reservation");
            self.ledger.record(overage, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArbiterConfig;
    use crate::infra::telemetry::StaticTelemetry;
    use crate::util::clock::{Clock, ManualClock};
    use crate::util::serde::Priority;
    use std::sync::Arc;
    use std::time::Duration;

    fn governor(cap: u64, reserve: u64, used: u64, telemetry: StaticTelemetry) -> Governor {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10_000_000_000));
        let mut ledger =
            BudgetLedger::new(cap, Duration::from_secs(18_000), reserve, Arc::clone(&clock));
        ledger.record(used, 0);
        let arbiter = ResourceArbiter::new(ArbiterConfig::default(), Arc::new(telemetry), clock);
        Governor::new(
            ledger,
            AdaptivePolicyTable::default(),
            arbiter,
            &AdmissionConfig::default(),
        )
    }

    fn cool() -> StaticTelemetry {
        StaticTelemetry::new(32.0, 45.0)
    }

    fn item(id: &str, priority: Priority, input: u64, output: u64) -> WorkItem {
        WorkItem::new(id, priority, ResourceEstimate::tokens(input, output))
    }

    #[test]
    fn fitting_item_is_admitted_and_reserved() {
        let mut g = governor(200_000, 20_000, 0, cool());
        let d = g.decide(&item("a", Priority::Normal, 100_000, 50_000));
        assert!(matches!(d, Decision::Admit { .. }));
        assert_eq!(g.ledger().used(), 150_000);
    }

    #[test]
    fn oversized_item_degrades_to_first_fitting_tier() {
        let mut g = governor(200_000, 20_000, 150_000, cool());
        // 30k available; Moderate and Constrained re-estimates are too big
        let d = g.decide(&item("b", Priority::Low, 30_000, 10_000));
        let Decision::AdmitDegraded { adaptation } = d else {
            panic!("expected degraded admission, got {d:?}");
        };
        assert_eq!(adaptation.policy.tier, Tier::Critical);
        assert_eq!(adaptation.estimate.total_tokens(), 15_600);
        assert!(!adaptation.emergency_retry);
        assert_eq!(g.ledger().used(), 165_600);
    }

    #[test]
    fn nothing_fits_defers_with_reason() {
        let mut g = governor(200_000, 20_000, 178_500, cool());
        let d = g.decide(&item("c", Priority::Low, 50_000, 50_000));
        assert_eq!(
            d,
            Decision::Defer {
                reason: INSUFFICIENT_BUDGET.into(),
                resource: Some(Resource::Tokens),
            }
        );
        assert_eq!(g.ledger().used(), 178_500);
    }

    #[test]
    fn blocked_budget_defers_low_priority() {
        let mut g = governor(100_000, 2_000, 96_000, cool());
        let d = g.decide(&item("d", Priority::Normal, 500, 500));
        assert!(matches!(
            d,
            Decision::Defer {
                resource: Some(Resource::Tokens),
                ..
            }
        ));
    }

    #[test]
    fn blocked_budget_gives_critical_items_one_emergency_attempt() {
        // ratio 0.04 => Emergency tier with 4k still available
        let mut g = governor(100_000, 0, 96_000, cool());
        let d = g.decide(&item("e", Priority::Critical, 10_000, 10_000));
        let Decision::AdmitDegraded { adaptation } = d else {
            panic!("expected emergency admission, got {d:?}");
        };
        assert!(adaptation.emergency_retry);
        assert_eq!(adaptation.policy.tier, Tier::Emergency);
        assert_eq!(adaptation.estimate.total_tokens(), 3_900);
        assert_eq!(g.ledger().available(), 100);

        // a second critical item no longer fits even the emergency policy
        let d = g.decide(&item("e2", Priority::Critical, 10_000, 10_000));
        assert!(!d.is_admitted());
    }

    #[test]
    fn thermal_block_is_never_overridden_by_priority() {
        let mut g = governor(200_000, 20_000, 0, StaticTelemetry::new(32.0, 95.0));
        let d = g.decide(&item("f", Priority::Critical, 10, 10));
        assert!(matches!(
            d,
            Decision::Defer {
                resource: Some(Resource::Thermal),
                ..
            }
        ));
        assert_eq!(g.ledger().used(), 0);
    }

    #[test]
    fn hardware_warning_skips_full_size_admission() {
        let mut g = governor(200_000, 20_000, 0, StaticTelemetry::new(3.0, 45.0));
        let d = g.decide(&item("g", Priority::Normal, 100_000, 20_000));
        let Decision::AdmitDegraded { adaptation } = d else {
            panic!("expected degraded admission, got {d:?}");
        };
        assert_eq!(adaptation.policy.tier, Tier::Moderate);
    }

    #[test]
    fn overage_is_charged_on_settle() {
        let mut g = governor(200_000, 20_000, 0, cool());
        g.settle("x", 1_000, Some(1_500));
        assert_eq!(g.ledger().used(), 500);
        g.settle("x", 1_000, Some(200));
        g.settle("x", 1_000, None);
        assert_eq!(g.ledger().used(), 500);
    }
}
