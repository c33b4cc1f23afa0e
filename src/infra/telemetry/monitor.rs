//! Background telemetry sampler.
//!
//! Keeps a recent reading for status reporting and hardware-wait pacing.
//! Admission never trusts this cache; it always samples synchronously.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::core::arbiter::{TelemetrySample, TelemetrySource};
use crate::util::clock::now_ms;

/// Most recent background reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedSample {
    /// Reading, or `None` when the last attempt failed.
    pub sample: Option<TelemetrySample>,
    /// When it was taken (ms since epoch).
    pub taken_at_ms: u128,
}

/// Periodic sampler on a dedicated thread.
pub struct TelemetryMonitor {
    latest: Arc<RwLock<Option<CachedSample>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryMonitor {
    /// Start sampling `source` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the sampler thread cannot be spawned.
    pub fn spawn(
        source: Arc<dyn TelemetrySource>,
        interval: Duration,
    ) -> Result<Self, std::io::Error> {
        let latest = Arc::new(RwLock::new(None));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = Arc::clone(&latest);

        let handle = thread::Builder::new()
            .name("governor-telemetry".into())
            .spawn(move || loop {
                let sample = match source.sample() {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(error = %e, "background telemetry sample failed");
                        None
                    }
                };
                *shared.write() = Some(CachedSample {
                    sample,
                    taken_at_ms: now_ms(),
                });
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("telemetry monitor stopping");
                        break;
                    }
                }
            })?;

        Ok(Self {
            latest,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Last background reading, if any has completed.
    #[must_use]
    pub fn latest(&self) -> Option<CachedSample> {
        *self.latest.read()
    }

    /// Stop the sampler and wait for its thread.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("telemetry monitor thread panicked");
            }
        }
    }
}

impl Drop for TelemetryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::telemetry::StaticTelemetry;

    #[test]
    fn samples_in_background_and_stops() {
        let source = StaticTelemetry::new(12.0, 48.0);
        let monitor =
            TelemetryMonitor::spawn(Arc::new(source.clone()), Duration::from_millis(5)).unwrap();
        let mut seen = None;
        for _ in 0..200 {
            if let Some(cached) = monitor.latest() {
                seen = cached.sample;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let sample = seen.expect("monitor produced a sample");
        assert!((sample.available_ram_gb - 12.0).abs() < f64::EPSILON);
        monitor.stop();
        monitor.stop();
    }
}
