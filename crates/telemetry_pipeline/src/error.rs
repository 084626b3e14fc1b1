//! Error types for the telemetry pipeline.
//!
//! Producer-facing errors ([`EnqueueError`]) are the only ones application code
//! ever sees. Export failures ([`ExportError`]) stay on the exporter side of the
//! pipeline and surface through counters and local logs.

use crate::pipeline::PipelineState;
use std::time::Duration;
use thiserror::Error;

/// Errors returned to producers when an item cannot be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue is at capacity and the overflow policy refused the item.
    #[error("telemetry queue is full")]
    QueueFull,

    /// The pipeline is draining or stopped.
    #[error("telemetry pipeline is closed")]
    PipelineClosed,
}

impl EnqueueError {
    /// Returns `true` if a later enqueue may succeed (e.g., `QueueFull`).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }

    /// Returns `true` if the pipeline will never accept items again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PipelineClosed)
    }
}

/// Error types for batch export operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// The export call did not complete within the per-call timeout
    #[error("export timed out after {0:?}")]
    Timeout(Duration),
    /// Transport-layer error (connection refused, reset, 5xx)
    #[error("transport error: {0}")]
    Transport(String),
    /// The sink asked us to slow down (HTTP 429)
    #[error("export throttled by sink")]
    Throttled { retry_after: Option<Duration> },
    /// The sink refused the payload; sending it again will not help
    #[error("export rejected: {0}")]
    Rejected(String),
    /// The batch could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// All attempts failed with retryable errors
    #[error("all {attempts} export attempts failed, last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ExportError> },
}

impl ExportError {
    /// Whether a retry of the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transport(_) | Self::Throttled { .. }
        )
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors raised while reading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed.
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A setting is outside its allowed range.
    #[error("{field} {reason}")]
    OutOfRange {
        field: &'static str,
        reason: &'static str,
    },
}

/// Errors from the pipeline controller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The exporter could not be constructed.
    #[error("exporter setup failed: {0}")]
    ExporterSetup(#[from] ExportError),

    /// The pipeline must be started from within a Tokio runtime.
    #[error("no Tokio runtime available to spawn pipeline tasks")]
    NoRuntime,

    /// The requested operation is not valid in the current state.
    #[error("pipeline is {0:?}, expected Running")]
    NotRunning(PipelineState),

    /// Draining did not finish before the deadline; remaining tasks were aborted.
    #[error("pipeline drain did not finish within {0:?}")]
    DrainTimeout(Duration),

    /// A background task panicked.
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}
