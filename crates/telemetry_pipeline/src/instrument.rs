//! Producer-facing instrumentation handle and scoped span guards.
//!
//! Every operation is fail-open: it returns `Result<(), EnqueueError>` and
//! callers are free to ignore it. Async callers under the block policy use the
//! `*_async` variants, which await queue space instead of parking the thread.
//!
//! ```ignore
//! let telemetry = pipeline.instrumentation();
//!
//! let mut span = telemetry.start_span("GET /hello");
//! span.set_attribute("http.method", "GET");
//! let _ = telemetry.increment_counter("hello.requests", 1, [("endpoint", "/hello")].into_iter().collect());
//! let _ = span.log(Severity::Info, "Hello endpoint called", Attributes::new());
//! span.set_status(SpanStatus::Ok);
//! // span enqueued here, or on any early return / panic
//! ```

use crate::attributes::{AttributeValue, Attributes};
use crate::error::EnqueueError;
use crate::invariants::debug_assert_span_closed;
use crate::item::{
    now_unix_nanos, AggregationKind, LogRecord, MetricPoint, MetricValue, Severity, SpanData, SpanId,
    SpanStatus, TelemetryItem, TraceId,
};
use crate::queue::ItemQueue;
use std::sync::Arc;

struct Shared {
    queue: Arc<ItemQueue>,
    max_attributes: usize,
}

/// Cheap, cloneable handle for emitting spans, metrics and logs.
#[derive(Clone)]
pub struct Instrumentation {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("queued", &self.shared.queue.len())
            .field("max_attributes", &self.shared.max_attributes)
            .finish()
    }
}

impl Instrumentation {
    pub(crate) fn new(queue: Arc<ItemQueue>, max_attributes: usize) -> Self {
        Self {
            shared: Arc::new(Shared { queue, max_attributes }),
        }
    }

    /// Opens a root span with a fresh trace id.
    pub fn start_span(&self, name: impl Into<String>) -> SpanGuard {
        SpanGuard::open(self.clone(), TraceId::random(), None, name.into())
    }

    /// Enqueues a counter increment.
    pub fn increment_counter(
        &self,
        name: impl Into<String>,
        delta: u64,
        attributes: Attributes,
    ) -> Result<(), EnqueueError> {
        self.emit(counter_item(name.into(), delta, attributes))
    }

    /// Like [`Instrumentation::increment_counter`], awaiting space under the block policy.
    pub async fn increment_counter_async(
        &self,
        name: impl Into<String>,
        delta: u64,
        attributes: Attributes,
    ) -> Result<(), EnqueueError> {
        self.emit_async(counter_item(name.into(), delta, attributes)).await
    }

    /// Enqueues a log record with no trace context.
    pub fn log(
        &self,
        severity: Severity,
        message: impl Into<String>,
        attributes: Attributes,
    ) -> Result<(), EnqueueError> {
        self.emit(log_item(severity, message.into(), attributes, None))
    }

    /// Like [`Instrumentation::log`], awaiting space under the block policy.
    pub async fn log_async(
        &self,
        severity: Severity,
        message: impl Into<String>,
        attributes: Attributes,
    ) -> Result<(), EnqueueError> {
        self.emit_async(log_item(severity, message.into(), attributes, None))
            .await
    }

    /// Enqueues a prebuilt item, applying the attribute bound.
    ///
    /// Under the block policy this may park the calling thread (see
    /// [`ItemQueue::push`]); async code should use the `*_async` operations.
    pub fn emit(&self, item: TelemetryItem) -> Result<(), EnqueueError> {
        self.shared.queue.push(self.bounded(item))
    }

    /// Enqueues a prebuilt item, awaiting space under the block policy.
    pub async fn emit_async(&self, item: TelemetryItem) -> Result<(), EnqueueError> {
        self.shared.queue.push_async(self.bounded(item)).await
    }

    fn bounded(&self, mut item: TelemetryItem) -> TelemetryItem {
        let limit = self.shared.max_attributes;
        match &mut item {
            TelemetryItem::Span(span) => {
                span.attributes.enforce_limit(limit);
                span.dropped_attributes_count = span.attributes.dropped_count();
            }
            TelemetryItem::Metric(point) => point.attributes.enforce_limit(limit),
            TelemetryItem::Log(record) => record.attributes.enforce_limit(limit),
        }
        item
    }

    /// Whether the pipeline still accepts items.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }
}

fn counter_item(name: String, delta: u64, attributes: Attributes) -> TelemetryItem {
    TelemetryItem::Metric(MetricPoint {
        name,
        value: MetricValue::U64(delta),
        aggregation: AggregationKind::Counter,
        attributes,
        timestamp_unix_nano: now_unix_nanos(),
    })
}

fn log_item(
    severity: Severity,
    message: String,
    attributes: Attributes,
    context: Option<(TraceId, SpanId)>,
) -> TelemetryItem {
    TelemetryItem::Log(LogRecord {
        timestamp_unix_nano: now_unix_nanos(),
        severity,
        message,
        attributes,
        trace_id: context.map(|(trace, _)| trace),
        span_id: context.map(|(_, span)| span),
    })
}

struct OpenSpan {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    name: String,
    start_time_unix_nano: u64,
    attributes: Attributes,
    status: SpanStatus,
}

/// An open span; enqueued exactly once when ended or dropped.
///
/// A guard dropped while its thread is panicking is recorded with an error
/// status.
#[must_use = "a span is recorded when its guard is dropped"]
pub struct SpanGuard {
    telemetry: Instrumentation,
    span: Option<OpenSpan>,
    trace_id: TraceId,
    span_id: SpanId,
}

impl SpanGuard {
    fn open(telemetry: Instrumentation, trace_id: TraceId, parent: Option<SpanId>, name: String) -> Self {
        let span_id = SpanId::random();
        let attributes = Attributes::with_limit(telemetry.shared.max_attributes);
        Self {
            telemetry,
            span: Some(OpenSpan {
                trace_id,
                span_id,
                parent_span_id: parent,
                name,
                start_time_unix_nano: now_unix_nanos(),
                attributes,
                status: SpanStatus::Unset,
            }),
            trace_id,
            span_id,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Sets an attribute; ignored once the span is full (the drop is counted).
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(span) = self.span.as_mut() {
            span.attributes.insert(key, value);
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(span) = self.span.as_mut() {
            span.status = status;
        }
    }

    /// Opens a span in the same trace with this span as parent.
    pub fn start_child(&self, name: impl Into<String>) -> SpanGuard {
        SpanGuard::open(
            self.telemetry.clone(),
            self.trace_id,
            Some(self.span_id),
            name.into(),
        )
    }

    /// Enqueues a log record carrying this span's trace context.
    pub fn log(
        &self,
        severity: Severity,
        message: impl Into<String>,
        attributes: Attributes,
    ) -> Result<(), EnqueueError> {
        self.telemetry
            .emit(log_item(severity, message.into(), attributes, Some(self.context())))
    }

    /// Like [`SpanGuard::log`], awaiting space under the block policy.
    pub async fn log_async(
        &self,
        severity: Severity,
        message: impl Into<String>,
        attributes: Attributes,
    ) -> Result<(), EnqueueError> {
        self.telemetry
            .emit_async(log_item(severity, message.into(), attributes, Some(self.context())))
            .await
    }

    fn context(&self) -> (TraceId, SpanId) {
        (self.trace_id, self.span_id)
    }

    /// Closes the span now and reports whether it was enqueued.
    pub fn end(mut self) -> Result<(), EnqueueError> {
        match self.finish() {
            Some(item) => self.telemetry.emit(item),
            None => Ok(()),
        }
    }

    /// Closes the span now, awaiting space under the block policy.
    pub async fn end_async(mut self) -> Result<(), EnqueueError> {
        match self.finish() {
            Some(item) => self.telemetry.emit_async(item).await,
            None => Ok(()),
        }
    }

    /// Takes the open span out of the guard; `None` once already closed.
    fn finish(&mut self) -> Option<TelemetryItem> {
        let mut span = self.span.take()?;
        if std::thread::panicking() && !matches!(span.status, SpanStatus::Error { .. }) {
            span.status = SpanStatus::error("panicked");
        }

        // Wall clock may step backwards; a span never ends before it starts
        let end_time_unix_nano = now_unix_nanos().max(span.start_time_unix_nano);
        debug_assert_span_closed!(span.start_time_unix_nano, end_time_unix_nano);

        let dropped_attributes_count = span.attributes.dropped_count();
        Some(TelemetryItem::Span(SpanData {
            trace_id: span.trace_id,
            span_id: span.span_id,
            parent_span_id: span.parent_span_id,
            name: span.name,
            start_time_unix_nano: span.start_time_unix_nano,
            end_time_unix_nano,
            attributes: span.attributes,
            dropped_attributes_count,
            status: span.status,
        }))
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(item) = self.finish() {
            let _ = self.telemetry.emit(item);
        }
    }
}
