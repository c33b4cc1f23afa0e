//! Error types for governor operations.

use thiserror::Error;

/// Errors produced by governor components.
///
/// Budget exhaustion is deliberately absent: running out of budget ends a
/// session through a checkpoint, not through an error.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// Checkpoint could not be persisted even after the retry.
    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),
    /// Checkpoint exists but could not be read.
    #[error("checkpoint read failed: {0}")]
    CheckpointRead(String),
    /// Checkpoint was read but does not decode to a supported snapshot.
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),
    /// Telemetry source could not produce a sample.
    #[error("telemetry unavailable: {0}")]
    TelemetryUnavailable(String),
    /// Work queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// An identifier does not match any known work item.
    #[error("unknown work item: {0}")]
    UnknownItem(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Work items could not be ingested.
    #[error("ingest error: {0}")]
    Ingest(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
