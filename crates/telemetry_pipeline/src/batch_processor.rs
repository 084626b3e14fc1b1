//! Batch Processor - Pure Batching Abstraction
//!
//! Groups queued items into one open batch per [`ItemKind`] and decides when a
//! batch is sealed. No atomics, no tasks, no exporter: the pipeline's batcher
//! task owns a `BatchProcessor` exclusively and moves the sealed batches to the
//! export workers.
//!
//! A batch is sealed when:
//!
//! 1. it reaches `max_batch_size` items ([`BatchProcessor::add`]), or
//! 2. `max_batch_age` has elapsed since its first item was enqueued
//!    ([`BatchProcessor::take_expired`]), or
//! 3. the caller asks for everything ([`BatchProcessor::take_all`]).
//!
//! # Metrics: BatchMetrics vs PipelineMetrics
//!
//! | Type | Location | Fields | Use Case |
//! |------|----------|--------|----------|
//! | `BatchMetrics` | `batch_processor.rs` | Plain `u64` | Owned by the batcher task |
//! | `PipelineMetrics` | `pipeline.rs` | `AtomicU64` | Shared with workers and callers |

use crate::invariants::debug_assert_batch_bounded;
use crate::item::{Batch, ItemKind, Resource, TelemetryItem};
use crate::queue::QueuedItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch formation
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of items per batch
    pub max_batch_size: usize,
    /// Maximum time an open batch waits, measured from its first item's enqueue
    pub max_batch_age: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            max_batch_age: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_batch_age(mut self, age: Duration) -> Self {
        self.max_batch_age = age;
        self
    }
}

/// Metrics for batch formation (plain u64 - no atomic overhead for sequential use)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Items added to an open batch
    pub items_batched: u64,
    /// Batches sealed because they were full
    pub sealed_by_size: u64,
    /// Batches sealed because they were too old
    pub sealed_by_age: u64,
    /// Batches sealed by an explicit flush
    pub sealed_by_flush: u64,
}

impl BatchMetrics {
    /// Total batches sealed for any reason
    pub fn batches_sealed(&self) -> u64 {
        self.sealed_by_size + self.sealed_by_age + self.sealed_by_flush
    }
}

#[derive(Debug)]
struct OpenBatch {
    items: Vec<TelemetryItem>,
    opened_at: Instant,
}

/// Per-kind batch accumulator.
pub struct BatchProcessor {
    lanes: [Option<OpenBatch>; 3],
    config: BatchConfig,
    resource: Arc<Resource>,
    metrics: BatchMetrics,
}

impl BatchProcessor {
    /// Creates a new batch processor
    pub fn new(config: BatchConfig, resource: Arc<Resource>) -> Self {
        Self {
            lanes: [None, None, None],
            config: BatchConfig {
                max_batch_size: config.max_batch_size.max(1),
                ..config
            },
            resource,
            metrics: BatchMetrics::default(),
        }
    }

    /// Adds an item to its kind's open batch, opening one if needed.
    ///
    /// Returns the sealed batch when the item filled it.
    pub fn add(&mut self, queued: QueuedItem) -> Option<Batch> {
        let kind = queued.item.kind();
        let max = self.config.max_batch_size;
        let lane = self.lanes[kind.index()].get_or_insert_with(|| OpenBatch {
            items: Vec::with_capacity(max.min(1024)),
            opened_at: queued.enqueued_at,
        });
        lane.items.push(queued.item);
        self.metrics.items_batched += 1;

        if lane.items.len() >= max {
            self.metrics.sealed_by_size += 1;
            return self.seal(kind);
        }
        None
    }

    /// Seals every open batch whose age deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Batch> {
        let max_age = self.config.max_batch_age;
        let mut sealed = Vec::new();
        for kind in ItemKind::ALL {
            let expired = self.lanes[kind.index()]
                .as_ref()
                .is_some_and(|open| open.opened_at + max_age <= now);
            if expired {
                if let Some(batch) = self.seal(kind) {
                    self.metrics.sealed_by_age += 1;
                    sealed.push(batch);
                }
            }
        }
        sealed
    }

    /// Seals every open batch regardless of size or age.
    pub fn take_all(&mut self) -> Vec<Batch> {
        let sealed: Vec<Batch> = ItemKind::ALL
            .into_iter()
            .filter_map(|kind| self.seal(kind))
            .collect();
        self.metrics.sealed_by_flush += sealed.len() as u64;
        sealed
    }

    /// Earliest instant at which an open batch becomes due, if any is open.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lanes
            .iter()
            .flatten()
            .map(|open| open.opened_at + self.config.max_batch_age)
            .min()
    }

    /// Returns the total number of items in open batches
    pub fn total_pending(&self) -> usize {
        self.lanes.iter().flatten().map(|open| open.items.len()).sum()
    }

    /// Items in the open batch for `kind`
    pub fn pending(&self, kind: ItemKind) -> usize {
        self.lanes[kind.index()]
            .as_ref()
            .map_or(0, |open| open.items.len())
    }

    fn seal(&mut self, kind: ItemKind) -> Option<Batch> {
        let open = self.lanes[kind.index()].take()?;
        debug_assert_batch_bounded!(open.items.len(), self.config.max_batch_size);
        Some(Batch::seal(
            kind,
            open.items,
            Arc::clone(&self.resource),
            open.opened_at,
        ))
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Returns current metrics (for sequential use)
    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::testing::{counter, log, span};

    fn queued(item: TelemetryItem, at: Instant) -> QueuedItem {
        QueuedItem {
            item,
            enqueued_at: at,
        }
    }

    fn processor(size: usize, age_ms: u64) -> BatchProcessor {
        BatchProcessor::new(
            BatchConfig::default()
                .with_max_batch_size(size)
                .with_max_batch_age(Duration::from_millis(age_ms)),
            Arc::new(Resource::new("test-service")),
        )
    }

    #[test]
    fn test_seals_at_size_limit() {
        let mut processor = processor(3, 1_000);
        let now = Instant::now();

        assert!(processor.add(queued(log("a"), now)).is_none());
        assert!(processor.add(queued(log("b"), now)).is_none());
        let batch = processor.add(queued(log("c"), now)).expect("third item seals");

        assert_eq!(batch.kind(), ItemKind::Logs);
        assert_eq!(batch.len(), 3);
        assert_eq!(processor.total_pending(), 0);
        assert_eq!(processor.metrics().sealed_by_size, 1);

        // Next item opens a fresh batch
        assert!(processor.add(queued(log("d"), now)).is_none());
        assert_eq!(processor.pending(ItemKind::Logs), 1);
    }

    #[test]
    fn test_kinds_batch_independently() {
        let mut processor = processor(2, 1_000);
        let now = Instant::now();

        assert!(processor.add(queued(span("s1"), now)).is_none());
        assert!(processor.add(queued(counter("c1", 1), now)).is_none());
        assert!(processor.add(queued(log("l1"), now)).is_none());
        assert_eq!(processor.total_pending(), 3);

        let batch = processor.add(queued(span("s2"), now)).unwrap();
        assert_eq!(batch.kind(), ItemKind::Traces);
        assert_eq!(processor.pending(ItemKind::Metrics), 1);
        assert_eq!(processor.pending(ItemKind::Logs), 1);
    }

    #[test]
    fn test_age_measured_from_first_item() {
        let mut processor = processor(10, 100);
        let t0 = Instant::now();

        processor.add(queued(log("a"), t0));
        processor.add(queued(log("b"), t0 + Duration::from_millis(80)));
        assert_eq!(processor.next_deadline(), Some(t0 + Duration::from_millis(100)));

        assert!(processor.take_expired(t0 + Duration::from_millis(99)).is_empty());

        let sealed = processor.take_expired(t0 + Duration::from_millis(100));
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].len(), 2);
        assert_eq!(sealed[0].opened_at(), t0);
        assert_eq!(processor.metrics().sealed_by_age, 1);
        assert!(processor.next_deadline().is_none());
    }

    #[test]
    fn test_take_all_flushes_every_lane() {
        let mut processor = processor(10, 10_000);
        let now = Instant::now();

        assert!(processor.take_all().is_empty());

        processor.add(queued(span("s"), now));
        processor.add(queued(log("l"), now));
        let sealed = processor.take_all();

        let kinds: Vec<ItemKind> = sealed.iter().map(Batch::kind).collect();
        assert_eq!(kinds, vec![ItemKind::Traces, ItemKind::Logs]);
        assert_eq!(processor.total_pending(), 0);
        assert_eq!(processor.metrics().batches_sealed(), 2);
    }

    #[test]
    fn test_batches_carry_resource() {
        let mut processor = processor(1, 1_000);
        let batch = processor.add(queued(log("a"), Instant::now())).unwrap();
        assert_eq!(batch.resource().service_name(), Some("test-service"));
    }

    #[test]
    fn test_zero_size_treated_as_one() {
        let mut processor = processor(0, 1_000);
        assert!(processor.add(queued(log("a"), Instant::now())).is_some());
    }
}
