//! Pipeline controller: lifecycle, the batcher task and per-kind export workers.
//!
//! ```text
//!  producers ──push──► ItemQueue ──drain──► batcher task ──mpsc(lane)──► export worker (traces)
//!                         ▲                  │                     ├──► export worker (metrics)
//!                         │ full: policy     │ BatchProcessor      └──► export worker (logs)
//!                         └───────────────── ┘ (owned, no atomics)
//! ```
//!
//! The batcher is the queue's only consumer. Each worker owns one kind's
//! mailbox, so at most one export per kind is in flight while the next batch
//! keeps forming. A full mailbox makes the batcher wait, which stops queue
//! draining and lets the queue's overflow policy take over.

use crate::batch_processor::BatchProcessor;
use crate::config::PipelineConfig;
use crate::error::{ExportError, PipelineError};
use crate::exporter::{TelemetryExporter, TelemetryExporterBoxed};
use crate::http_exporter::HttpExporter;
use crate::instrument::Instrumentation;
use crate::invariants::debug_assert_valid_transition;
use crate::item::{Batch, ItemKind, Resource};
use crate::queue::{ItemQueue, QueueMetrics, QueuedItem};
use crate::resilient_exporter::RetryingExporter;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Controller lifecycle: `Stopped → Starting → Running → Draining → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from → to`; on a lost race returns the state actually found.
    fn transition(&self, from: PipelineState, to: PipelineState) -> Result<(), PipelineState> {
        debug_assert_valid_transition!(from, to);
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PipelineState::from_u8)
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Thread-safe export-side counters (uses atomics)
///
/// This is separate from `BatchMetrics`, which the batcher task owns alone.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    items_exported: AtomicU64,
    batches_exported: AtomicU64,
    items_dropped: AtomicU64,
    batches_dropped: AtomicU64,
    inflight_exports: AtomicU64,
    // Items taken off the queue and batches handed to a worker, not yet
    // exported or dropped
    held_items: AtomicU64,
    held_batches: AtomicU64,
}

impl PipelineMetrics {
    pub fn items_exported(&self) -> u64 {
        self.items_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    /// Items in batches that were given up on after export failed
    pub fn items_dropped(&self) -> u64 {
        self.items_dropped.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn inflight_exports(&self) -> u64 {
        self.inflight_exports.load(Ordering::Relaxed)
    }

    fn record_taken(&self, item_count: u64) {
        self.held_items.fetch_add(item_count, Ordering::Relaxed);
    }

    fn record_handed_off(&self) {
        self.held_batches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self, item_count: u64) {
        self.items_exported.fetch_add(item_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.release(item_count);
    }

    fn record_drop(&self, item_count: u64) {
        self.items_dropped.fetch_add(item_count, Ordering::Relaxed);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.release(item_count);
    }

    fn release(&self, item_count: u64) {
        self.held_items.fetch_sub(item_count, Ordering::Relaxed);
        self.held_batches.fetch_sub(1, Ordering::Relaxed);
    }

    /// Counts everything the aborted tasks still held, plus `queued` items
    /// never taken off the queue, as dropped. Returns the dropped item count.
    ///
    /// Only valid once every task has stopped.
    fn record_abandoned(&self, queued: u64) -> u64 {
        let items = self.held_items.swap(0, Ordering::Relaxed) + queued;
        let batches = self.held_batches.swap(0, Ordering::Relaxed);
        self.items_dropped.fetch_add(items, Ordering::Relaxed);
        self.batches_dropped.fetch_add(batches, Ordering::Relaxed);
        self.inflight_exports.store(0, Ordering::Relaxed);
        items
    }
}

// =============================================================================
// TASKS
// =============================================================================

enum WorkerMsg {
    Export(Batch),
    /// Acked once every batch queued before it has been processed
    Flush(oneshot::Sender<()>),
}

enum Control {
    /// Replies with one ack receiver per export worker
    Flush(oneshot::Sender<Vec<oneshot::Receiver<()>>>),
}

struct Batcher {
    queue: Arc<ItemQueue>,
    processor: BatchProcessor,
    lanes: Vec<mpsc::Sender<WorkerMsg>>,
    metrics: Arc<PipelineMetrics>,
    export_interval: Duration,
    buf: Vec<QueuedItem>,
}

impl Batcher {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>, mut control_rx: mpsc::Receiver<Control>) {
        loop {
            let periodic = Instant::now() + self.export_interval;
            let wake_at = self
                .processor
                .next_deadline()
                .map_or(periodic, |deadline| deadline.min(periodic));

            tokio::select! {
                biased;

                // Fires on an explicit signal and when the controller is dropped
                _ = &mut shutdown_rx => break,

                Some(control) = control_rx.recv() => match control {
                    Control::Flush(reply) => {
                        // Only what was queued when the flush arrived
                        let queued = self.queue.len();
                        self.pump(queued).await;
                        for batch in self.processor.take_all() {
                            self.hand_off(batch).await;
                        }
                        let mut acks = Vec::with_capacity(self.lanes.len());
                        for lane in &self.lanes {
                            let (ack_tx, ack_rx) = oneshot::channel();
                            if lane.send(WorkerMsg::Flush(ack_tx)).await.is_ok() {
                                acks.push(ack_rx);
                            }
                        }
                        let _ = reply.send(acks);
                        continue;
                    }
                },

                () = self.queue.data_notified() => {}

                () = sleep_until(wake_at) => {}
            }

            let limit = self.queue.capacity();
            self.pump(limit).await;
            for batch in self.processor.take_expired(Instant::now()) {
                self.hand_off(batch).await;
            }
        }

        self.drain().await;
    }

    /// Moves up to `limit` queued items into open batches, handing off full ones.
    async fn pump(&mut self, limit: usize) {
        let chunk = self.processor.config().max_batch_size;
        let mut moved = 0;
        while moved < limit {
            let n = self.queue.drain_into(&mut self.buf, chunk.min(limit - moved));
            if n == 0 {
                break;
            }
            moved += n;
            self.metrics.record_taken(n as u64);

            let mut drained = std::mem::take(&mut self.buf);
            for queued in drained.drain(..) {
                if let Some(batch) = self.processor.add(queued) {
                    self.hand_off(batch).await;
                }
            }
            self.buf = drained;
        }
    }

    async fn hand_off(&self, batch: Batch) {
        let kind = batch.kind();
        let items = batch.len() as u64;
        tracing::debug!(kind = %kind, items, "batch sealed");
        self.metrics.record_handed_off();
        if self.lanes[kind.index()].send(WorkerMsg::Export(batch)).await.is_err() {
            self.metrics.record_drop(items);
            tracing::error!(kind = %kind, items, "export worker gone, batch dropped");
        }
    }

    /// Final pass once the queue is closed: everything left goes to the workers.
    async fn drain(mut self) {
        self.pump(usize::MAX).await;
        for batch in self.processor.take_all() {
            self.hand_off(batch).await;
        }
        let stats = self.processor.metrics();
        tracing::debug!(
            items_batched = stats.items_batched,
            batches_sealed = stats.batches_sealed(),
            "batcher drained"
        );
        // Dropping `self.lanes` ends the workers after their last batch
    }
}

async fn run_worker(
    kind: ItemKind,
    mut rx: mpsc::Receiver<WorkerMsg>,
    exporter: Arc<dyn TelemetryExporterBoxed>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerMsg::Export(batch) => {
                let items = batch.len() as u64;
                metrics.inflight_exports.fetch_add(1, Ordering::Relaxed);
                let result = exporter.export_boxed(batch).await;
                metrics.inflight_exports.fetch_sub(1, Ordering::Relaxed);

                match result {
                    Ok(()) => {
                        metrics.record_success(items);
                        tracing::debug!(kind = %kind, items, exporter = exporter.name(), "batch exported");
                    }
                    Err(e) => {
                        metrics.record_drop(items);
                        if matches!(e, ExportError::RetriesExhausted { .. }) {
                            tracing::error!(kind = %kind, items, error = %e, "export failed, batch dropped");
                        } else {
                            tracing::warn!(kind = %kind, items, error = %e, "export rejected, batch dropped");
                        }
                    }
                }
            }
            WorkerMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Owns the pipeline's tasks and lifecycle.
///
/// Hand [`PipelineController::instrumentation`] handles to producers and call
/// [`PipelineController::shutdown`] before exit to flush what is queued.
pub struct PipelineController {
    state: Arc<StateCell>,
    queue: Arc<ItemQueue>,
    resource: Arc<Resource>,
    instrumentation: Instrumentation,
    metrics: Arc<PipelineMetrics>,
    control_tx: mpsc::Sender<Control>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    tasks: JoinSet<()>,
    drain_timeout: Duration,
}

impl PipelineController {
    /// Spawns the batcher and one export worker per kind on the current runtime.
    ///
    /// `exporter` is wrapped in a [`RetryingExporter`] using the configured
    /// retry policy and per-call timeout.
    pub fn start<E>(config: PipelineConfig, exporter: E) -> Result<Self, PipelineError>
    where
        E: TelemetryExporter + 'static,
    {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let state = Arc::new(StateCell::new(PipelineState::Stopped));
        state
            .transition(PipelineState::Stopped, PipelineState::Starting)
            .map_err(PipelineError::NotRunning)?;

        let resource = Arc::new(Resource::new(config.service_name.clone()));
        let queue = Arc::new(ItemQueue::new(config.queue.clone()));
        let metrics = Arc::new(PipelineMetrics::default());
        let exporter_name = TelemetryExporter::name(&exporter).to_owned();
        let exporter: Arc<dyn TelemetryExporterBoxed> = Arc::new(
            RetryingExporter::new(exporter, config.retry.clone()).with_attempt_timeout(config.export_timeout),
        );

        let mut tasks = JoinSet::new();
        let mut lanes = Vec::with_capacity(ItemKind::ALL.len());
        for kind in ItemKind::ALL {
            let (tx, rx) = mpsc::channel(config.max_pending_batches);
            lanes.push(tx);
            tasks.spawn_on(
                run_worker(kind, rx, Arc::clone(&exporter), Arc::clone(&metrics)),
                &handle,
            );
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::channel(8);
        let batcher = Batcher {
            queue: Arc::clone(&queue),
            processor: BatchProcessor::new(config.batch.clone(), Arc::clone(&resource)),
            lanes,
            metrics: Arc::clone(&metrics),
            export_interval: config.export_interval,
            buf: Vec::with_capacity(config.batch.max_batch_size.min(1024)),
        };
        tasks.spawn_on(batcher.run(shutdown_rx, control_rx), &handle);

        let instrumentation = Instrumentation::new(Arc::clone(&queue), config.max_attributes);
        state
            .transition(PipelineState::Starting, PipelineState::Running)
            .map_err(PipelineError::NotRunning)?;

        tracing::info!(
            service = %config.service_name,
            exporter = %exporter_name,
            max_batch_size = config.batch.max_batch_size,
            capacity = config.queue.capacity,
            "telemetry pipeline started"
        );

        Ok(Self {
            state,
            queue,
            resource,
            instrumentation,
            metrics,
            control_tx,
            shutdown_tx: Some(shutdown_tx),
            tasks,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Starts a pipeline exporting to `config.endpoint` over HTTP.
    pub fn start_http(config: PipelineConfig) -> Result<Self, PipelineError> {
        let exporter = HttpExporter::from_config(&config)?;
        Self::start(config, exporter)
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Cloneable producer handle.
    pub fn instrumentation(&self) -> Instrumentation {
        self.instrumentation.clone()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn queue_metrics(&self) -> &QueueMetrics {
        self.queue.metrics()
    }

    /// Seals every open batch now and waits until all batches handed off so
    /// far have finished their export attempts.
    pub async fn force_flush(&self) -> Result<(), PipelineError> {
        let state = self.state.get();
        if state != PipelineState::Running {
            return Err(PipelineError::NotRunning(state));
        }

        let flush = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.control_tx
                .send(Control::Flush(reply_tx))
                .await
                .map_err(|_| PipelineError::NotRunning(self.state.get()))?;
            let acks = reply_rx
                .await
                .map_err(|_| PipelineError::NotRunning(self.state.get()))?;
            for ack in acks {
                // A worker that went away has nothing left to flush
                let _ = ack.await;
            }
            Ok(())
        };

        tokio::time::timeout(self.drain_timeout, flush)
            .await
            .unwrap_or_else(|_| Err(PipelineError::DrainTimeout(self.drain_timeout)))
    }

    /// Closes the queue, drains everything into final exports and stops.
    ///
    /// Bounded by `drain_timeout`; tasks still running then are aborted and
    /// `DrainTimeout` is returned. Calling this on a stopped pipeline is a no-op.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        match self.state.transition(PipelineState::Running, PipelineState::Draining) {
            Ok(()) => {}
            Err(PipelineState::Stopped) => return Ok(()),
            Err(other) => return Err(PipelineError::NotRunning(other)),
        }

        self.queue.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let outcome = match tokio::time::timeout(self.drain_timeout, join_tasks(&mut self.tasks)).await {
            Ok(result) => result,
            Err(_) => {
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}

                let mut leftover = Vec::new();
                let queued = self.queue.drain_into(&mut leftover, usize::MAX) as u64;
                let lost = self.metrics.record_abandoned(queued);
                tracing::warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    items_lost = lost,
                    "pipeline drain timed out, remaining exports aborted"
                );
                Err(PipelineError::DrainTimeout(self.drain_timeout))
            }
        };

        let _ = self.state.transition(PipelineState::Draining, PipelineState::Stopped);
        tracing::info!(
            items_exported = self.metrics.items_exported(),
            batches_dropped = self.metrics.batches_dropped(),
            items_dropped_at_queue = self.queue.metrics().items_dropped(),
            "telemetry pipeline stopped"
        );
        outcome
    }
}

async fn join_tasks(tasks: &mut JoinSet<()>) -> Result<(), PipelineError> {
    let mut first_failure = None;
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "pipeline task failed");
            first_failure.get_or_insert_with(|| PipelineError::TaskFailed(e.to_string()));
        }
    }
    first_failure.map_or(Ok(()), Err)
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.shutdown_tx.is_none() {
            return;
        }
        // Dropped while running: drain in the background instead of aborting
        self.queue.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tasks.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_processor::BatchConfig;
    use crate::error::EnqueueError;
    use crate::exporter::InMemoryExporter;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_batch(
                BatchConfig::default()
                    .with_max_batch_size(10)
                    .with_max_batch_age(Duration::from_millis(50)),
            )
            .with_export_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new(PipelineState::Stopped);
        assert_eq!(cell.transition(PipelineState::Stopped, PipelineState::Starting), Ok(()));
        assert_eq!(cell.transition(PipelineState::Starting, PipelineState::Running), Ok(()));
        assert_eq!(
            cell.transition(PipelineState::Draining, PipelineState::Stopped),
            Err(PipelineState::Running)
        );
        assert_eq!(cell.get(), PipelineState::Running);
    }

    #[test]
    fn test_start_requires_runtime() {
        let result = PipelineController::start(config(), InMemoryExporter::new());
        assert!(matches!(result, Err(PipelineError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let bad = config().with_drain_timeout(Duration::ZERO);
        let result = PipelineController::start(bad, InMemoryExporter::new());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_basic_lifecycle() {
        let exporter = Arc::new(InMemoryExporter::new());
        let mut pipeline = PipelineController::start(config(), Arc::clone(&exporter)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);

        let telemetry = pipeline.instrumentation();
        for i in 0..25 {
            telemetry.emit(crate::item::testing::log(&format!("line {i}"))).unwrap();
        }

        pipeline.shutdown().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(exporter.exported_items().len(), 25);
        assert_eq!(pipeline.metrics().items_exported(), 25);
        assert!(exporter.batches().iter().all(|b| b.len() <= 10));

        assert_eq!(
            telemetry.emit(crate::item::testing::log("late")),
            Err(EnqueueError::PipelineClosed)
        );
        // Second shutdown is a no-op
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_exports_open_batches() {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = config().with_batch(
            BatchConfig::default()
                .with_max_batch_size(100)
                .with_max_batch_age(Duration::from_secs(60)),
        );
        let mut pipeline = PipelineController::start(config, Arc::clone(&exporter)).unwrap();

        let telemetry = pipeline.instrumentation();
        telemetry.emit(crate::item::testing::span("a")).unwrap();
        telemetry.emit(crate::item::testing::counter("c", 1)).unwrap();

        pipeline.force_flush().await.unwrap();
        assert_eq!(exporter.batches().len(), 2);
        assert_eq!(pipeline.state(), PipelineState::Running);

        pipeline.shutdown().await.unwrap();
        assert_eq!(
            pipeline.force_flush().await.unwrap_err().to_string(),
            PipelineError::NotRunning(PipelineState::Stopped).to_string()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_aborts_stuck_export() {
        let exporter = InMemoryExporter::new().with_delay(Duration::from_secs(3600));
        let config = config()
            .with_export_timeout(Duration::from_secs(7200))
            .with_drain_timeout(Duration::from_secs(5));
        let mut pipeline = PipelineController::start(config, exporter).unwrap();
        let telemetry = pipeline.instrumentation();
        for i in 0..10 {
            telemetry
                .emit(crate::item::testing::log(&format!("stuck {i}")))
                .unwrap();
        }

        let err = pipeline.shutdown().await.unwrap_err();
        assert!(matches!(err, PipelineError::DrainTimeout(d) if d == Duration::from_secs(5)));
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // Nothing accepted goes uncounted
        let metrics = pipeline.metrics();
        assert_eq!(metrics.items_exported(), 0);
        assert_eq!(metrics.items_dropped(), 10);
        assert_eq!(metrics.batches_dropped(), 1);
        assert_eq!(metrics.inflight_exports(), 0);
    }
}
