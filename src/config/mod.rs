//! Configuration models for budgets, tiers, hardware limits, gates and sessions.

pub mod governor;

pub use governor::{
    AdmissionConfig, ArbiterConfig, BudgetConfig, GateConfig, GovernorConfig, SessionConfig,
    StopStrategy,
};
