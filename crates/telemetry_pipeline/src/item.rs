use crate::attributes::Attributes;
use crate::invariants::debug_assert_single_kind;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;

/// Current wall-clock time in Unix nanoseconds (0 if the clock is before the epoch)
pub(crate) fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// The export lane an item travels through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Traces,
    Metrics,
    Logs,
}

impl ItemKind {
    /// All kinds, in lane order.
    pub const ALL: [ItemKind; 3] = [ItemKind::Traces, ItemKind::Metrics, ItemKind::Logs];

    /// Lane index, matching the position in [`ItemKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            ItemKind::Traces => 0,
            ItemKind::Metrics => 1,
            ItemKind::Logs => 2,
        }
    }

    /// Export path relative to the endpoint.
    pub fn path(self) -> &'static str {
        match self {
            ItemKind::Traces => "v1/traces",
            ItemKind::Metrics => "v1/metrics",
            ItemKind::Logs => "v1/logs",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Traces => "traces",
            ItemKind::Metrics => "metrics",
            ItemKind::Logs => "logs",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 128-bit trace identifier, rendered as 32 lowercase hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub u128);

/// 64-bit span identifier, rendered as 16 lowercase hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

impl TraceId {
    /// Random non-zero trace id.
    pub fn random() -> Self {
        Self(rand::random::<u128>().max(1))
    }
}

impl SpanId {
    /// Random non-zero span id.
    pub fn random() -> Self {
        Self(rand::random::<u64>().max(1))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

macro_rules! hex_id_serde {
    ($ty:ident, $inner:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                <$inner>::from_str_radix(&s, 16)
                    .map($ty)
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id_serde!(TraceId, u128);
hex_id_serde!(SpanId, u64);

/// Span completion status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum SpanStatus {
    /// Status not set by the instrumented code
    #[default]
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error { description: String },
}

impl SpanStatus {
    pub fn error(description: impl Into<String>) -> Self {
        Self::Error {
            description: description.into(),
        }
    }
}

/// A completed, timed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Parent within this process (no cross-service propagation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "is_zero")]
    pub dropped_attributes_count: u32,
    pub status: SpanStatus,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl SpanData {
    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano.saturating_sub(self.start_time_unix_nano)
    }
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// OpenTelemetry severity number for the level.
    pub fn number(self) -> u8 {
        match self {
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
        }
    }
}

impl From<&tracing::Level> for Severity {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Severity::Error,
            tracing::Level::WARN => Severity::Warn,
            tracing::Level::INFO => Severity::Info,
            _ => Severity::Debug,
        }
    }
}

/// A single log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_unix_nano: u64,
    pub severity: Severity,
    pub message: String,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
}

/// How a metric point is meant to be aggregated upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Counter,
    Gauge,
    Histogram,
}

/// Numeric metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    U64(u64),
    F64(f64),
}

/// One measurement of an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: MetricValue,
    pub aggregation: AggregationKind,
    pub attributes: Attributes,
    pub timestamp_unix_nano: u64,
}

/// Anything the pipeline carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryItem {
    Span(SpanData),
    Metric(MetricPoint),
    Log(LogRecord),
}

impl TelemetryItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            TelemetryItem::Span(_) => ItemKind::Traces,
            TelemetryItem::Metric(_) => ItemKind::Metrics,
            TelemetryItem::Log(_) => ItemKind::Logs,
        }
    }

    pub fn timestamp_unix_nano(&self) -> u64 {
        match self {
            TelemetryItem::Span(span) => span.end_time_unix_nano,
            TelemetryItem::Metric(point) => point.timestamp_unix_nano,
            TelemetryItem::Log(record) => record.timestamp_unix_nano,
        }
    }

    pub fn as_span(&self) -> Option<&SpanData> {
        match self {
            TelemetryItem::Span(span) => Some(span),
            _ => None,
        }
    }

    pub fn as_log(&self) -> Option<&LogRecord> {
        match self {
            TelemetryItem::Log(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_metric(&self) -> Option<&MetricPoint> {
        match self {
            TelemetryItem::Metric(point) => Some(point),
            _ => None,
        }
    }
}

impl From<SpanData> for TelemetryItem {
    fn from(span: SpanData) -> Self {
        TelemetryItem::Span(span)
    }
}

impl From<LogRecord> for TelemetryItem {
    fn from(record: LogRecord) -> Self {
        TelemetryItem::Log(record)
    }
}

impl From<MetricPoint> for TelemetryItem {
    fn from(point: MetricPoint) -> Self {
        TelemetryItem::Metric(point)
    }
}

/// Process-wide labels attached to every exported batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    labels: BTreeMap<String, String>,
}

impl Resource {
    pub const SERVICE_NAME: &'static str = "service.name";

    /// Resource with the service name and SDK labels.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::default()
            .with_label(Self::SERVICE_NAME, service_name)
            .with_label("telemetry.sdk.language", "rust")
            .with_label("telemetry.sdk.name", env!("CARGO_PKG_NAME"))
            .with_label("telemetry.sdk.version", env!("CARGO_PKG_VERSION"))
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.get(Self::SERVICE_NAME)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Sealed, immutable group of items of one kind.
///
/// Cloning is cheap: items and resource are shared, so a retry re-sends the
/// exact same contents.
#[derive(Debug, Clone)]
pub struct Batch {
    kind: ItemKind,
    items: Arc<[TelemetryItem]>,
    resource: Arc<Resource>,
    opened_at: Instant,
    sealed_at: SystemTime,
}

impl Batch {
    pub(crate) fn seal(
        kind: ItemKind,
        items: Vec<TelemetryItem>,
        resource: Arc<Resource>,
        opened_at: Instant,
    ) -> Self {
        debug_assert_single_kind!(items, kind);
        Self {
            kind,
            items: items.into(),
            resource,
            opened_at,
            sealed_at: SystemTime::now(),
        }
    }

    /// Builds a batch outside the pipeline (exporter tests, replay).
    ///
    /// Returns `None` if `items` is empty or mixes kinds.
    pub fn from_items(resource: Arc<Resource>, items: Vec<TelemetryItem>) -> Option<Self> {
        let kind = items.first()?.kind();
        if items.iter().any(|item| item.kind() != kind) {
            return None;
        }
        Some(Self::seal(kind, items, resource, Instant::now()))
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn items(&self) -> &[TelemetryItem] {
        &self.items
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// When the first item of this batch was enqueued.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn sealed_at(&self) -> SystemTime {
        self.sealed_at
    }

    /// Returns the number of items in the batch
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn log(message: &str) -> TelemetryItem {
        TelemetryItem::Log(LogRecord {
            timestamp_unix_nano: now_unix_nanos(),
            severity: Severity::Info,
            message: message.to_owned(),
            attributes: Attributes::new(),
            trace_id: None,
            span_id: None,
        })
    }

    pub(crate) fn counter(name: &str, delta: u64) -> TelemetryItem {
        TelemetryItem::Metric(MetricPoint {
            name: name.to_owned(),
            value: MetricValue::U64(delta),
            aggregation: AggregationKind::Counter,
            attributes: Attributes::new(),
            timestamp_unix_nano: now_unix_nanos(),
        })
    }

    pub(crate) fn span(name: &str) -> TelemetryItem {
        let now = now_unix_nanos();
        TelemetryItem::Span(SpanData {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            name: name.to_owned(),
            start_time_unix_nano: now,
            end_time_unix_nano: now,
            attributes: Attributes::new(),
            dropped_attributes_count: 0,
            status: SpanStatus::Ok,
        })
    }
}
