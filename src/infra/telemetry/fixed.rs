//! Settable in-memory telemetry for tests and dry runs.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::arbiter::{TelemetrySample, TelemetrySource};
use crate::core::error::GovernorError;

/// Telemetry that returns whatever was last set. Clones share state, so a
/// test can keep a handle and change readings while a session runs.
#[derive(Debug, Clone)]
pub struct StaticTelemetry {
    reading: Arc<Mutex<Option<TelemetrySample>>>,
}

impl StaticTelemetry {
    /// Fixed reading.
    pub fn new(available_ram_gb: f64, cpu_temperature_c: f64) -> Self {
        Self {
            reading: Arc::new(Mutex::new(Some(TelemetrySample {
                available_ram_gb,
                cpu_temperature_c: Some(cpu_temperature_c),
            }))),
        }
    }

    /// Source whose every sample fails.
    pub fn failing() -> Self {
        Self {
            reading: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the reading.
    pub fn set(&self, available_ram_gb: f64, cpu_temperature_c: f64) {
        *self.reading.lock() = Some(TelemetrySample {
            available_ram_gb,
            cpu_temperature_c: Some(cpu_temperature_c),
        });
    }

    /// Make subsequent samples fail.
    pub fn fail(&self) {
        *self.reading.lock() = None;
    }
}

impl TelemetrySource for StaticTelemetry {
    fn sample(&self) -> Result<TelemetrySample, GovernorError> {
        (*self.reading.lock())
            .ok_or_else(|| GovernorError::TelemetryUnavailable("no reading configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_readings() {
        let t = StaticTelemetry::new(8.0, 50.0);
        let handle = t.clone();
        handle.set(1.0, 70.0);
        let s = t.sample().unwrap();
        assert!((s.available_ram_gb - 1.0).abs() < f64::EPSILON);
        handle.fail();
        assert!(matches!(
            t.sample(),
            Err(GovernorError::TelemetryUnavailable(_))
        ));
    }
}
