//! Property-based tests for queueing and batch formation.
//!
//! Items carry their sequence number (log message, metric name or span name)
//! so every property can be checked against the exact input order.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::{
    AggregationKind, Attributes, Batch, BatchConfig, BatchProcessor, ItemKind, ItemQueue, LogRecord,
    MetricPoint, MetricValue, OverflowPolicy, QueueConfig, Resource, Severity, SpanData, SpanId,
    SpanStatus, TelemetryItem, TraceId,
};

fn make_item(kind: u8, seq: usize) -> TelemetryItem {
    let id = seq.to_string();
    match kind % 3 {
        0 => TelemetryItem::Span(SpanData {
            trace_id: TraceId(1),
            span_id: SpanId(seq as u64 + 1),
            parent_span_id: None,
            name: id,
            start_time_unix_nano: 0,
            end_time_unix_nano: 1,
            attributes: Attributes::new(),
            dropped_attributes_count: 0,
            status: SpanStatus::Unset,
        }),
        1 => TelemetryItem::Metric(MetricPoint {
            name: id,
            value: MetricValue::U64(1),
            aggregation: AggregationKind::Counter,
            attributes: Attributes::new(),
            timestamp_unix_nano: 0,
        }),
        _ => TelemetryItem::Log(LogRecord {
            timestamp_unix_nano: 0,
            severity: Severity::Info,
            message: id,
            attributes: Attributes::new(),
            trace_id: None,
            span_id: None,
        }),
    }
}

fn seq_of(item: &TelemetryItem) -> usize {
    let id = match item {
        TelemetryItem::Span(span) => &span.name,
        TelemetryItem::Metric(point) => &point.name,
        TelemetryItem::Log(record) => &record.message,
    };
    id.parse().unwrap()
}

fn queue(capacity: usize, policy: OverflowPolicy) -> ItemQueue {
    ItemQueue::new(
        QueueConfig::default()
            .with_capacity(capacity)
            .with_overflow_policy(policy),
    )
}

// =============================================================================
// Batch formation: exactly-once, bounded, single-kind, FIFO per kind
// =============================================================================

proptest! {
    #[test]
    fn prop_every_item_in_exactly_one_batch(
        kinds in proptest::collection::vec(0u8..3, 0..300),
        max_batch_size in 1usize..20,
        chunks in proptest::collection::vec(1usize..50, 1..20),
    ) {
        let queue = queue(10_000, OverflowPolicy::Reject);
        let mut processor = BatchProcessor::new(
            BatchConfig::default()
                .with_max_batch_size(max_batch_size)
                .with_max_batch_age(Duration::from_secs(3600)),
            Arc::new(Resource::new("prop")),
        );

        for (seq, kind) in kinds.iter().enumerate() {
            queue.push(make_item(*kind, seq)).unwrap();
        }

        // Drain in uneven chunks, like a batcher woken at arbitrary points
        let mut sealed: Vec<Batch> = Vec::new();
        let mut buf = Vec::new();
        let mut chunk = chunks.iter().cycle();
        loop {
            let limit = *chunk.next().unwrap();
            if queue.drain_into(&mut buf, limit) == 0 {
                break;
            }
            for queued in buf.drain(..) {
                sealed.extend(processor.add(queued));
            }
        }
        sealed.extend(processor.take_all());

        prop_assert_eq!(processor.total_pending(), 0);
        let mut seen = vec![0u32; kinds.len()];
        for batch in &sealed {
            prop_assert!(!batch.is_empty() && batch.len() <= max_batch_size,
                "batch of {} with limit {}", batch.len(), max_batch_size);
            prop_assert!(batch.items().iter().all(|item| item.kind() == batch.kind()));
            for item in batch.items() {
                seen[seq_of(item)] += 1;
            }
        }
        prop_assert!(seen.iter().all(|&count| count == 1), "item lost or duplicated");

        for kind in ItemKind::ALL {
            let exported: Vec<usize> = sealed
                .iter()
                .filter(|b| b.kind() == kind)
                .flat_map(|b| b.items().iter().map(seq_of))
                .collect();
            let expected: Vec<usize> = kinds
                .iter()
                .enumerate()
                .filter(|(_, k)| make_item(**k, 0).kind() == kind)
                .map(|(seq, _)| seq)
                .collect();
            prop_assert_eq!(exported, expected);
        }
    }
}

// =============================================================================
// Overflow accounting
// =============================================================================

proptest! {
    #[test]
    fn prop_reject_keeps_first_capacity_items(
        capacity in 1usize..64,
        pushes in 0usize..200,
    ) {
        let queue = queue(capacity, OverflowPolicy::Reject);
        let accepted = (0..pushes).filter(|&seq| queue.push(make_item(2, seq)).is_ok()).count();

        let kept = pushes.min(capacity);
        prop_assert_eq!(accepted, kept);
        prop_assert_eq!(queue.metrics().items_dropped(), (pushes - kept) as u64);
        prop_assert_eq!(queue.metrics().items_enqueued(), kept as u64);

        let mut buf = Vec::new();
        queue.drain_into(&mut buf, usize::MAX);
        let seqs: Vec<usize> = buf.iter().map(|q| seq_of(&q.item)).collect();
        prop_assert_eq!(seqs, (0..kept).collect::<Vec<_>>());
    }

    #[test]
    fn prop_evict_oldest_keeps_last_capacity_items(
        capacity in 1usize..64,
        pushes in 0usize..200,
    ) {
        let queue = queue(capacity, OverflowPolicy::EvictOldest);
        for seq in 0..pushes {
            prop_assert!(queue.push(make_item(1, seq)).is_ok());
            prop_assert!(queue.len() <= capacity);
        }

        let kept = pushes.min(capacity);
        prop_assert_eq!(queue.metrics().items_evicted(), (pushes - kept) as u64);
        prop_assert_eq!(queue.metrics().items_dropped(), (pushes - kept) as u64);

        let mut buf = Vec::new();
        queue.drain_into(&mut buf, usize::MAX);
        let seqs: Vec<usize> = buf.iter().map(|q| seq_of(&q.item)).collect();
        prop_assert_eq!(seqs, (pushes - kept..pushes).collect::<Vec<_>>());
    }
}
