//! Tests for configuration validation

use std::time::Duration;

use session_governor::config::{GovernorConfig, StopStrategy};
use session_governor::core::policy::default_policies;
use session_governor::core::{AdaptivePolicyTable, Tier, TierBoundaries};

#[test]
fn test_defaults_are_valid() {
    let cfg = GovernorConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.budget.reserve(), 20_000);
    assert_eq!(cfg.soft_stop_tier(), Some(Tier::Critical));
}

#[test]
fn test_empty_json_uses_defaults() {
    let cfg = GovernorConfig::from_json_str("{}").unwrap();
    assert_eq!(cfg.budget.hard_cap, 200_000);
    assert_eq!(cfg.budget.window, Duration::from_secs(5 * 3600));
}

#[test]
fn test_humantime_durations_and_overrides() {
    let cfg = GovernorConfig::from_json_str(
        r#"{
            "budget": { "hard_cap": 50000, "window": "2h 30m", "reserve_tokens": 5000 },
            "session": { "stop_strategy": "continue", "max_session": "8h", "hardware_backoff": "45s" },
            "executor_command": ["worker", "--fast"]
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.budget.window, Duration::from_secs(9_000));
    assert_eq!(cfg.budget.reserve(), 5_000);
    assert_eq!(cfg.session.stop_strategy, StopStrategy::Continue);
    assert_eq!(cfg.session.max_session, Some(Duration::from_secs(8 * 3600)));
    assert_eq!(cfg.soft_stop_tier(), None);
    assert_eq!(cfg.executor_command.as_deref().map(<[String]>::len), Some(2));
}

#[test]
fn test_invalid_budget() {
    let mut cfg = GovernorConfig::default();
    cfg.budget.hard_cap = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = GovernorConfig::default();
    cfg.budget.reserve_tokens = Some(cfg.budget.hard_cap);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_invalid_thresholds() {
    let mut cfg = GovernorConfig::default();
    cfg.arbiter.thermal_warning_c = cfg.arbiter.thermal_limit_c;
    assert!(cfg.validate().is_err());

    let mut cfg = GovernorConfig::default();
    cfg.gates.timeout_factor = 0.5;
    assert!(cfg.validate().is_err());

    let mut cfg = GovernorConfig::default();
    cfg.executor_command = Some(vec![]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_unordered_tier_boundaries_are_rejected() {
    let mut cfg = GovernorConfig::default();
    cfg.policies = AdaptivePolicyTable::new(
        TierBoundaries {
            full_above: 0.2,
            moderate_from: 0.5,
            constrained_from: 0.15,
            critical_from: 0.05,
        },
        default_policies(),
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_policy_table_round_trips_through_json() {
    let cfg = GovernorConfig::default();
    let json = serde_json::to_string(&cfg).unwrap();
    let parsed = GovernorConfig::from_json_str(&json).unwrap();
    assert_eq!(parsed.policies, cfg.policies);
    assert_eq!(parsed.policies.tier_for(0.5), Tier::Moderate);
}

#[test]
fn test_gate_timeout_scales_with_duration() {
    let cfg = GovernorConfig::default();
    assert_eq!(cfg.gates.timeout_for(Duration::from_secs(1)), Duration::from_secs(30));
    assert_eq!(cfg.gates.timeout_for(Duration::from_secs(60)), Duration::from_secs(90));
}

#[test]
fn test_gate_timeout_saturates_for_enormous_durations() {
    let cfg = GovernorConfig::default();
    assert_eq!(cfg.gates.timeout_for(Duration::MAX), Duration::MAX);
    let eon = Duration::from_secs(15_778_800_000_000_000_000);
    assert_eq!(cfg.gates.timeout_for(eon), Duration::MAX);
}
