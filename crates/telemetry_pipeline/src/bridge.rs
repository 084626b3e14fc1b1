//! `tracing` → pipeline bridge: every event becomes a [`LogRecord`].

use crate::attributes::Attributes;
use crate::instrument::Instrumentation;
use crate::item::{now_unix_nanos, LogRecord, Severity, TelemetryItem};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Events from these targets are never bridged, so the pipeline's own
/// diagnostics cannot feed back into it.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

struct EventVisitor<'a> {
    message: &'a mut Option<String>,
    attributes: &'a mut Attributes,
}

impl Visit for EventVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_owned());
        } else {
            self.attributes.insert(field.name(), value);
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.attributes.insert(field.name(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{value:?}"));
        } else {
            self.attributes.insert(field.name(), format!("{value:?}"));
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.attributes.insert(field.name(), value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.attributes.insert(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.attributes.insert(field.name(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.attributes.insert(field.name(), value);
    }
}

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Layer forwarding `tracing` events into the pipeline's log lane.
pub struct TelemetryLayer {
    telemetry: Instrumentation,
}

impl TelemetryLayer {
    pub fn new(telemetry: Instrumentation) -> Self {
        Self { telemetry }
    }
}

impl<S: Subscriber> Layer<S> for TelemetryLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if is_own_target(meta.target()) {
            return;
        }

        let mut message = None;
        let mut attributes = Attributes::new();
        event.record(&mut EventVisitor {
            message: &mut message,
            attributes: &mut attributes,
        });
        attributes.insert("log.target", meta.target());

        // Fail-open: a full or closed pipeline just loses the event
        let _ = self.telemetry.emit(TelemetryItem::Log(LogRecord {
            timestamp_unix_nano: now_unix_nanos(),
            severity: Severity::from(meta.level()),
            message: message.unwrap_or_default(),
            attributes,
            trace_id: None,
            span_id: None,
        }));
    }
}
