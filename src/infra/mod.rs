//! Infrastructure adapters: checkpoint storage, planners, executors and
//! hardware telemetry.

pub mod checkpoint;
pub mod executor;
pub mod planner;
pub mod telemetry;

pub use checkpoint::{FileCheckpointStore, InMemoryCheckpointStore};
pub use executor::ProcessExecutor;
pub use planner::JsonlPlanner;
pub use telemetry::{StaticTelemetry, SysfsTelemetry, TelemetryMonitor};
