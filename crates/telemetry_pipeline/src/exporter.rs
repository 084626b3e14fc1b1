use crate::error::ExportError;
use crate::item::{Batch, ItemKind, TelemetryItem};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Outcome of a single export call
pub type ExportResult = Result<(), ExportError>;

/// Trait for sending sealed batches to a sink.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn TelemetryExporterBoxed>`.
pub trait TelemetryExporter: Send + Sync {
    /// Exports one batch. Called at most once at a time per kind.
    fn export(&self, batch: Batch) -> impl Future<Output = ExportResult> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of TelemetryExporter for dynamic dispatch.
pub trait TelemetryExporterBoxed: Send + Sync {
    /// Exports a batch (boxed future for object safety).
    fn export_boxed(&self, batch: Batch) -> Pin<Box<dyn Future<Output = ExportResult> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any TelemetryExporter can be used as TelemetryExporterBoxed
impl<T: TelemetryExporter> TelemetryExporterBoxed for T {
    fn export_boxed(&self, batch: Batch) -> Pin<Box<dyn Future<Output = ExportResult> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        TelemetryExporter::name(self)
    }
}

/// Shared exporters export through the shared value, so callers can keep a
/// handle for inspection after handing a clone to the pipeline.
impl<T: TelemetryExporter> TelemetryExporter for Arc<T> {
    fn export(&self, batch: Batch) -> impl Future<Output = ExportResult> + Send {
        (**self).export(batch)
    }

    fn name(&self) -> &str {
        TelemetryExporter::name(&**self)
    }
}

/// Stdout exporter for local debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// With `verbose` off only a one-line summary per batch is printed.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TelemetryExporter for StdoutExporter {
    async fn export(&self, batch: Batch) -> ExportResult {
        println!(
            "=== Exporting {} {} (service={}) ===",
            batch.len(),
            batch.kind(),
            batch.resource().service_name().unwrap_or("unknown")
        );
        if self.verbose {
            for item in batch.items() {
                let line = serde_json::to_string(item)
                    .map_err(|e| ExportError::Serialization(e.to_string()))?;
                println!("{line}");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Null exporter that discards all batches (for benchmarking)
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryExporter for NullExporter {
    async fn export(&self, _batch: Batch) -> ExportResult {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Exporter that keeps every successfully exported batch in memory.
///
/// Failures can be scripted with [`InMemoryExporter::fail_next`]: each call
/// pops one scripted error before anything is recorded.
#[derive(Default)]
pub struct InMemoryExporter {
    batches: Mutex<Vec<Batch>>,
    failures: Mutex<VecDeque<ExportError>>,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every export call sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes the next `times` calls fail with `error`.
    pub fn fail_next(&self, times: usize, error: ExportError) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.extend(std::iter::repeat(error).take(times));
    }

    /// Successfully exported batches, in export order.
    pub fn batches(&self) -> Vec<Batch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of export calls, failed ones included.
    pub fn export_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// All exported items, flattened.
    pub fn exported_items(&self) -> Vec<TelemetryItem> {
        self.batches()
            .iter()
            .flat_map(|batch| batch.items().iter().cloned())
            .collect()
    }

    pub fn items_of(&self, kind: ItemKind) -> Vec<TelemetryItem> {
        self.batches()
            .iter()
            .filter(|batch| batch.kind() == kind)
            .flat_map(|batch| batch.items().iter().cloned())
            .collect()
    }
}

impl TelemetryExporter for InMemoryExporter {
    async fn export(&self, batch: Batch) -> ExportResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
