//! JSON-over-HTTP exporter.
//!
//! One `POST {endpoint}/v1/{traces|metrics|logs}` per batch, body:
//!
//! ```text
//! {"resource": {"service.name": "..", ..}, "kind": "logs", "items": [..]}
//! ```
//!
//! | Response | Result |
//! |----------|--------|
//! | 2xx | `Ok(())` |
//! | 429 | `Throttled` (with `Retry-After` seconds, if sent) |
//! | 5xx | `Transport` (retryable) |
//! | other 4xx | `Rejected` |
//! | client timeout | `Timeout` |
//! | connect / IO error | `Transport` |

use crate::config::PipelineConfig;
use crate::error::ExportError;
use crate::exporter::{ExportResult, TelemetryExporter};
use crate::item::{Batch, ItemKind, Resource, TelemetryItem};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct ExportPayload<'a> {
    resource: &'a Resource,
    kind: ItemKind,
    items: &'a [TelemetryItem],
}

/// Maps a non-success response to an export error.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ExportResult {
    if status.is_success() {
        return Ok(());
    }
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(ExportError::Throttled { retry_after })
    } else if status.is_server_error() {
        Err(ExportError::Transport(detail))
    } else {
        Err(ExportError::Rejected(detail))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Exporter posting JSON batches to an HTTP collector
#[derive(Debug, Clone)]
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpExporter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ExportError> {
        Self::new(config.endpoint.clone(), config.export_timeout)
    }

    /// Full URL for a kind's export path.
    pub fn url_for(&self, kind: ItemKind) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), kind.path())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_request_error(&self, error: &reqwest::Error) -> ExportError {
        if error.is_timeout() {
            ExportError::Timeout(self.timeout)
        } else {
            ExportError::Transport(error.to_string())
        }
    }
}

impl TelemetryExporter for HttpExporter {
    async fn export(&self, batch: Batch) -> ExportResult {
        let payload = ExportPayload {
            resource: batch.resource(),
            kind: batch.kind(),
            items: batch.items(),
        };
        let body =
            serde_json::to_vec(&payload).map_err(|e| ExportError::Serialization(e.to_string()))?;

        let response = self
            .client
            .post(self.url_for(batch.kind()))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_request_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        classify_status(status, retry_after, &text)
    }

    fn name(&self) -> &str {
        "http"
    }
}
