//! Linux telemetry from `/proc/meminfo` and the thermal sysfs tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::arbiter::{PartialSample, TelemetrySample, TelemetrySource};
use crate::core::error::GovernorError;

/// Reads `MemAvailable` and the hottest `thermal_zone*/temp`. Hosts with no
/// thermal zones (most VMs and containers) report no temperature rather
/// than a failure.
#[derive(Debug, Clone)]
pub struct SysfsTelemetry {
    meminfo: PathBuf,
    thermal_root: PathBuf,
}

impl Default for SysfsTelemetry {
    fn default() -> Self {
        Self::new("/proc/meminfo", "/sys/class/thermal")
    }
}

impl SysfsTelemetry {
    /// Read from custom locations (useful for tests and containers).
    pub fn new(meminfo: impl AsRef<Path>, thermal_root: impl AsRef<Path>) -> Self {
        Self {
            meminfo: meminfo.as_ref().to_path_buf(),
            thermal_root: thermal_root.as_ref().to_path_buf(),
        }
    }

    fn available_ram_gb(&self) -> Result<f64, GovernorError> {
        let raw = fs::read_to_string(&self.meminfo).map_err(|e| {
            GovernorError::TelemetryUnavailable(format!("{}: {e}", self.meminfo.display()))
        })?;
        parse_mem_available_gb(&raw).ok_or_else(|| {
            GovernorError::TelemetryUnavailable("MemAvailable missing from meminfo".into())
        })
    }

    fn cpu_temperature_c(&self) -> Result<Option<f64>, GovernorError> {
        let zones = match fs::read_dir(&self.thermal_root) {
            Ok(zones) => zones,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GovernorError::TelemetryUnavailable(format!(
                    "{}: {e}",
                    self.thermal_root.display()
                )))
            }
        };
        let zones: Vec<PathBuf> = zones
            .filter_map(Result::ok)
            .filter(|z| z.file_name().to_string_lossy().starts_with("thermal_zone"))
            .map(|z| z.path())
            .collect();
        if zones.is_empty() {
            return Ok(None);
        }
        let hottest = zones
            .iter()
            .filter_map(|z| fs::read_to_string(z.join("temp")).ok())
            .filter_map(|raw| parse_millidegrees(&raw))
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));
        hottest
            .map(Some)
            .ok_or_else(|| GovernorError::TelemetryUnavailable("no readable thermal zone".into()))
    }
}

impl TelemetrySource for SysfsTelemetry {
    fn sample(&self) -> Result<TelemetrySample, GovernorError> {
        Ok(TelemetrySample {
            available_ram_gb: self.available_ram_gb()?,
            cpu_temperature_c: self.cpu_temperature_c()?,
        })
    }

    fn sample_partial(&self) -> PartialSample {
        PartialSample {
            available_ram_gb: self.available_ram_gb().map_err(|e| e.to_string()),
            cpu_temperature_c: self.cpu_temperature_c().map_err(|e| e.to_string()),
        }
    }
}

/// `MemAvailable:  16326412 kB` → GB.
#[allow(clippy::cast_precision_loss)]
fn parse_mem_available_gb(meminfo: &str) -> Option<f64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb as f64 / (1024.0 * 1024.0))
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<i64>().ok().map(|m| {
        #[allow(clippy::cast_precision_loss)]
        let m = m as f64;
        m / 1000.0
    })
}
