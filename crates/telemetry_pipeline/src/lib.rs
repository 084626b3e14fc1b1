//! In-process telemetry pipeline
//!
//! Application code records spans, counter increments and log lines through a
//! cheap [`Instrumentation`] handle. Items go into a bounded [`ItemQueue`]; a
//! single batcher task groups them per kind into bounded [`Batch`]es, and one
//! export worker per kind ships each batch through a [`RetryingExporter`]
//! (by default an [`HttpExporter`] posting JSON to `{endpoint}/v1/{kind}`).
//!
//! Delivery is best-effort: a full queue or a failing sink loses telemetry,
//! counts the loss, and never blocks or fails the host application (except
//! under [`OverflowPolicy::Block`], which waits up to `block_timeout`).
//!
//! ```ignore
//! let mut pipeline = PipelineController::start_http(PipelineConfig::from_env()?)?;
//! let telemetry = pipeline.instrumentation();
//!
//! let span = telemetry.start_span("GET /hello");
//! let _ = telemetry.increment_counter("hello.requests", 1, Attributes::new());
//! drop(span);
//!
//! pipeline.shutdown().await?;
//! ```
//!
//! Trait methods use native `impl Future + Send` returns (no `#[async_trait]`);
//! [`TelemetryExporterBoxed`] is the object-safe counterpart.

pub mod attributes;
pub mod batch_processor;
pub mod bridge;
pub mod config;
pub mod error;
pub mod exporter;
pub mod http_exporter;
pub mod instrument;
pub mod item;
pub mod pipeline;
pub mod queue;
pub mod resilient_exporter;

mod invariants;

// Re-export main types
pub use attributes::{AttributeValue, Attributes, DEFAULT_MAX_ATTRIBUTES};
pub use batch_processor::{BatchConfig, BatchMetrics, BatchProcessor};
pub use bridge::TelemetryLayer;
pub use config::PipelineConfig;
pub use error::{ConfigError, EnqueueError, ExportError, PipelineError};
pub use exporter::{
    ExportResult, InMemoryExporter, NullExporter, StdoutExporter, TelemetryExporter,
    TelemetryExporterBoxed,
};
pub use http_exporter::HttpExporter;
pub use instrument::{Instrumentation, SpanGuard};
pub use item::{
    AggregationKind, Batch, ItemKind, LogRecord, MetricPoint, MetricValue, Resource, Severity, SpanData,
    SpanId, SpanStatus, TelemetryItem, TraceId,
};
pub use pipeline::{PipelineController, PipelineMetrics, PipelineState};
pub use queue::{ItemQueue, OverflowPolicy, QueueConfig, QueueMetrics, QueuedItem};
pub use resilient_exporter::{RetryPolicy, RetryingExporter};
