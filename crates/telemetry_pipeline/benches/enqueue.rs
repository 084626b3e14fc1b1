//! Producer-side cost of recording telemetry.
//!
//! Run with: cargo bench -p telemetry_pipeline --bench enqueue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use telemetry_pipeline::{
    Attributes, ItemQueue, LogRecord, NullExporter, PipelineConfig, PipelineController, QueueConfig, Severity,
    TelemetryItem,
};

const ITEMS: u64 = 100_000;

fn log_item(i: u64) -> TelemetryItem {
    TelemetryItem::Log(LogRecord {
        timestamp_unix_nano: i,
        severity: Severity::Info,
        message: "request handled".to_owned(),
        attributes: Attributes::new(),
        trace_id: None,
        span_id: None,
    })
}

/// Raw queue push + drain, no pipeline tasks
fn bench_queue_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(ITEMS));

    for producers in [1u64, 4] {
        group.bench_with_input(BenchmarkId::new("push", producers), &producers, |b, &producers| {
            b.iter(|| {
                let queue = Arc::new(ItemQueue::new(QueueConfig::default().with_capacity(ITEMS as usize)));
                let per_producer = ITEMS / producers;
                let handles: Vec<_> = (0..producers)
                    .map(|_| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for i in 0..per_producer {
                                let _ = queue.push(black_box(log_item(i)));
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }

                let mut buf = Vec::with_capacity(ITEMS as usize);
                black_box(queue.drain_into(&mut buf, usize::MAX));
            });
        });
    }
    group.finish();
}

/// Facade calls against a running pipeline with a discarding exporter
fn bench_facade(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pipeline = runtime
        .block_on(async { PipelineController::start(PipelineConfig::default(), NullExporter::new()) })
        .unwrap();
    let telemetry = pipeline.instrumentation();

    let mut group = c.benchmark_group("facade");
    group.throughput(Throughput::Elements(1));

    group.bench_function("increment_counter", |b| {
        b.iter(|| {
            let _ = telemetry.increment_counter(black_box("hello.requests"), 1, Attributes::new());
        });
    });

    group.bench_function("span", |b| {
        b.iter(|| {
            let mut span = telemetry.start_span(black_box("GET /hello"));
            span.set_attribute("http.method", "GET");
            let _ = span.end();
        });
    });

    group.finish();
    drop(pipeline);
}

criterion_group!(benches, bench_queue_push, bench_facade);
criterion_main!(benches);
