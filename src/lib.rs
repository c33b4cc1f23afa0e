//! # Session Governor
//!
//! Budget-, thermal- and memory-aware execution of planned work items during
//! long unattended sessions.
//!
//! A session drains a prioritized queue of work items. Before each item the
//! governor checks a rolling token budget and live hardware telemetry and
//! either admits the item, admits it under a degraded policy, or defers it.
//! Admitted items pass through four blocking quality gates. When a resource
//! runs out the session writes a checkpoint that a later session resumes
//! from, in-flight item first.
//!
//! ## Key pieces
//!
//! - **Budget ledger**: rolling-window token accounting with a hard cap and a
//!   reserve that admission never spends
//! - **Adaptive policy table**: five tiers keyed on the remaining budget ratio
//! - **Resource arbiter**: tokens, then thermal, then RAM
//! - **Governor**: `Admit`, `AdmitDegraded` or `Defer`, with an Emergency retry
//!   for High and Critical items
//! - **Gate pipeline**: pre-flight, proof of concept, implementation, delivery
//! - **Checkpoint manager**: atomic write-then-rename persistence
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use session_governor::builders::SessionBuilder;
//! use session_governor::config::GovernorConfig;
//! use session_governor::infra::{FileCheckpointStore, ProcessExecutor, SysfsTelemetry};
//!
//! let mut session = SessionBuilder::new(GovernorConfig::default())
//!     .with_executor(Arc::new(executor))
//!     .with_checkpoint_store(Arc::new(FileCheckpointStore::new("session.json")))
//!     .with_telemetry(Arc::new(SysfsTelemetry::default()))
//!     .build()?;
//! session.ingest(items)?;
//! session.resume()?;
//! let report = session.run()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Budget accounting, admission, gates and orchestration.
pub mod core;
/// Configuration models for budgets, tiers, hardware limits and sessions.
pub mod config;
/// Builders to assemble a session from configuration.
pub mod builders;
/// Infrastructure adapters for checkpoints, planners, executors and telemetry.
pub mod infra;
/// Command-line surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
