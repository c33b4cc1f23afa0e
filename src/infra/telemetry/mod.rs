//! Telemetry sources and the background sampler.

pub mod fixed;
pub mod monitor;
pub mod sysfs;

pub use fixed::StaticTelemetry;
pub use monitor::TelemetryMonitor;
pub use sysfs::SysfsTelemetry;
