//! Degradation tiers and the policy table bound to them.

use serde::{Deserialize, Serialize};

use crate::util::serde::ResourceEstimate;

/// Degradation level, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Plenty of budget.
    Full,
    /// Noticeably reduced sizing.
    Moderate,
    /// Small work only.
    Constrained,
    /// Minimal work; sessions may stop after the current item.
    Critical,
    /// Stop and checkpoint.
    Emergency,
}

impl Tier {
    /// All tiers, least restrictive first.
    pub const ALL: [Self; 5] = [
        Self::Full,
        Self::Moderate,
        Self::Constrained,
        Self::Critical,
        Self::Emergency,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Full => 0,
            Self::Moderate => 1,
            Self::Constrained => 2,
            Self::Critical => 3,
            Self::Emergency => 4,
        }
    }

    /// Next more restrictive tier, saturating at Emergency.
    #[must_use]
    pub const fn tighter(self) -> Self {
        match self {
            Self::Full => Self::Moderate,
            Self::Moderate => Self::Constrained,
            Self::Constrained => Self::Critical,
            Self::Critical | Self::Emergency => Self::Emergency,
        }
    }
}

/// Concrete sizing parameters bound to a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Tier this policy belongs to.
    pub tier: Tier,
    /// Maximum number of fragments the executor may split work into.
    pub max_fragments: u32,
    /// Input token cap.
    pub max_input_tokens: u64,
    /// Output token cap.
    pub max_output_tokens: u64,
    /// Retries the executor may spend.
    pub retry_allowance: u32,
}

impl Policy {
    /// Re-estimate `estimate` under this policy's caps, scaled by the
    /// pessimistic subtype cost `factor` and rounded up. The factor is
    /// applied in whole permille so equal inputs always give equal results.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn adapt(&self, estimate: &ResourceEstimate, factor: f64) -> ResourceEstimate {
        let permille = (factor.max(1.0) * 1000.0).round() as u64;
        let scale = |tokens: u64| tokens.saturating_mul(permille).div_ceil(1000);
        ResourceEstimate {
            input_tokens: scale(estimate.input_tokens.min(self.max_input_tokens)),
            output_tokens: scale(estimate.output_tokens.min(self.max_output_tokens)),
            ram_gb: estimate.ram_gb,
            duration: estimate.duration,
            confidence: estimate.confidence,
        }
    }
}

/// Lower bounds on the remaining-budget ratio for each tier above Emergency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBoundaries {
    /// Ratio strictly above this selects Full.
    pub full_above: f64,
    /// Ratio at or above this selects Moderate.
    pub moderate_from: f64,
    /// Ratio at or above this selects Constrained.
    pub constrained_from: f64,
    /// Ratio at or above this selects Critical; below is Emergency.
    pub critical_from: f64,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            full_above: 0.75,
            moderate_from: 0.25,
            constrained_from: 0.15,
            critical_from: 0.05,
        }
    }
}

impl TierBoundaries {
    /// Boundaries must be strictly decreasing inside `(0, 1)`.
    pub fn validate(&self) -> Result<(), String> {
        let ordered = [
            self.full_above,
            self.moderate_from,
            self.constrained_from,
            self.critical_from,
        ];
        if ordered.iter().any(|b| !(0.0..1.0).contains(b)) {
            return Err("tier boundaries must lie in [0, 1)".into());
        }
        if ordered.windows(2).any(|w| w[0] <= w[1]) {
            return Err("tier boundaries must be strictly decreasing".into());
        }
        Ok(())
    }
}

/// Fixed lookup from remaining-budget ratio to tier to policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptivePolicyTable {
    boundaries: TierBoundaries,
    policies: [Policy; 5],
}

impl Default for AdaptivePolicyTable {
    fn default() -> Self {
        Self::new(TierBoundaries::default(), default_policies())
    }
}

/// Default sizing for each tier, least restrictive first.
#[must_use]
pub const fn default_policies() -> [Policy; 5] {
    [
        Policy {
            tier: Tier::Full,
            max_fragments: 8,
            max_input_tokens: 120_000,
            max_output_tokens: 32_000,
            retry_allowance: 3,
        },
        Policy {
            tier: Tier::Moderate,
            max_fragments: 4,
            max_input_tokens: 60_000,
            max_output_tokens: 16_000,
            retry_allowance: 2,
        },
        Policy {
            tier: Tier::Constrained,
            max_fragments: 2,
            max_input_tokens: 24_000,
            max_output_tokens: 8_000,
            retry_allowance: 1,
        },
        Policy {
            tier: Tier::Critical,
            max_fragments: 1,
            max_input_tokens: 8_000,
            max_output_tokens: 4_000,
            retry_allowance: 1,
        },
        Policy {
            tier: Tier::Emergency,
            max_fragments: 1,
            max_input_tokens: 2_000,
            max_output_tokens: 1_000,
            retry_allowance: 0,
        },
    ]
}

impl AdaptivePolicyTable {
    /// Build a table. `policies` is indexed by tier, least restrictive first;
    /// each entry's `tier` field is overwritten to keep the table consistent.
    #[must_use]
    pub fn new(boundaries: TierBoundaries, mut policies: [Policy; 5]) -> Self {
        for (policy, tier) in policies.iter_mut().zip(Tier::ALL) {
            policy.tier = tier;
        }
        Self {
            boundaries,
            policies,
        }
    }

    /// Boundaries must be ordered and policies must be listed in tier order
    /// with caps that never grow as tiers tighten.
    pub fn validate(&self) -> Result<(), String> {
        self.boundaries.validate()?;
        for (policy, tier) in self.policies.iter().zip(Tier::ALL) {
            if policy.tier != tier {
                return Err(format!("policy for {tier:?} is listed as {:?}", policy.tier));
            }
        }
        for pair in self.policies.windows(2) {
            let (looser, tighter) = (&pair[0], &pair[1]);
            if tighter.max_input_tokens > looser.max_input_tokens
                || tighter.max_output_tokens > looser.max_output_tokens
            {
                return Err(format!(
                    "{:?} policy allows more tokens than {:?}",
                    tighter.tier, looser.tier
                ));
            }
        }
        Ok(())
    }

    /// Configured boundaries.
    #[must_use]
    pub const fn boundaries(&self) -> &TierBoundaries {
        &self.boundaries
    }

    /// Tier for a remaining-budget ratio. Exact boundary values select the
    /// less restrictive side except at `full_above`, which is exclusive.
    #[must_use]
    pub fn tier_for(&self, ratio: f64) -> Tier {
        let b = &self.boundaries;
        if ratio > b.full_above {
            Tier::Full
        } else if ratio >= b.moderate_from {
            Tier::Moderate
        } else if ratio >= b.constrained_from {
            Tier::Constrained
        } else if ratio >= b.critical_from {
            Tier::Critical
        } else {
            Tier::Emergency
        }
    }

    /// Policy bound to `tier`.
    #[must_use]
    pub const fn policy(&self, tier: Tier) -> &Policy {
        &self.policies[tier.index()]
    }

    /// `tier` and every more restrictive tier's policy, in order.
    pub fn tiers_from(&self, tier: Tier) -> impl Iterator<Item = &Policy> {
        self.policies[tier.index()..].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_boundaries_select_expected_tiers() {
        let t = AdaptivePolicyTable::default();
        assert_eq!(t.tier_for(1.0), Tier::Full);
        assert_eq!(t.tier_for(0.76), Tier::Full);
        assert_eq!(t.tier_for(0.75), Tier::Moderate);
        assert_eq!(t.tier_for(0.25), Tier::Moderate);
        assert_eq!(t.tier_for(0.2), Tier::Constrained);
        assert_eq!(t.tier_for(0.15), Tier::Constrained);
        assert_eq!(t.tier_for(0.1), Tier::Critical);
        assert_eq!(t.tier_for(0.05), Tier::Critical);
        assert_eq!(t.tier_for(0.049), Tier::Emergency);
        assert_eq!(t.tier_for(0.0), Tier::Emergency);
    }

    #[test]
    fn tier_selection_is_monotonic() {
        let t = AdaptivePolicyTable::default();
        let mut previous = Tier::Full;
        for step in (0..=10_000).rev() {
            let ratio = f64::from(step) / 10_000.0;
            let tier = t.tier_for(ratio);
            assert!(tier >= previous, "ratio {ratio} picked {tier:?} after {previous:?}");
            previous = tier;
        }
        assert_eq!(previous, Tier::Emergency);
    }

    #[test]
    fn tiers_from_walks_toward_emergency() {
        let t = AdaptivePolicyTable::default();
        let tiers: Vec<Tier> = t.tiers_from(Tier::Constrained).map(|p| p.tier).collect();
        assert_eq!(tiers, vec![Tier::Constrained, Tier::Critical, Tier::Emergency]);
        assert_eq!(t.tiers_from(Tier::Emergency).count(), 1);
    }

    #[test]
    fn adapt_caps_and_scales_pessimistically() {
        let p = AdaptivePolicyTable::default().policy(Tier::Critical).to_owned();
        let est = ResourceEstimate::tokens(30_000, 10_000);
        let adapted = p.adapt(&est, 1.25);
        assert_eq!(adapted.input_tokens, 10_000);
        assert_eq!(adapted.output_tokens, 5_000);
        // factors below one never shrink the estimate
        assert_eq!(p.adapt(&est, 0.5).total_tokens(), 12_000);
    }

    #[test]
    fn boundary_validation() {
        assert!(TierBoundaries::default().validate().is_ok());
        let bad = TierBoundaries {
            full_above: 0.2,
            ..TierBoundaries::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn tighter_saturates() {
        assert_eq!(Tier::Full.tighter(), Tier::Moderate);
        assert_eq!(Tier::Emergency.tighter(), Tier::Emergency);
    }
}
