//! # Telemetry Pipeline Demo
//!
//! Simulates a small service answering `GET /hello`. Every request:
//!
//! - opens a span `GET /hello` with `http.method` / `http.route` attributes,
//! - increments the `hello.requests` counter (`endpoint=/hello`),
//! - logs "Hello endpoint called" with the span's trace context,
//! - closes the span with status Ok.
//!
//! `tracing` events from the demo itself are bridged into the log lane by
//! [`TelemetryLayer`] and also printed locally.
//!
//! ## Running
//!
//! ```bash
//! # Export to the collector in OTEL_EXPORTER_OTLP_ENDPOINT (default http://localhost:4318)
//! cargo run -p telemetry_pipeline --bin demo -- --requests 200
//!
//! # No collector: print batches to stdout instead
//! cargo run -p telemetry_pipeline --bin demo -- --stdout
//! ```
//!
//! Ctrl-C stops the request loop early; queued telemetry is still drained.
//! Export failures never change the exit code.

use anyhow::{bail, Context as _};
use std::time::{Duration, Instant};
use telemetry_pipeline::{
    Attributes, Instrumentation, PipelineConfig, PipelineController, Severity, SpanStatus,
    StdoutExporter, TelemetryLayer,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

struct Args {
    requests: u64,
    stdout: bool,
    workers: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        requests: 100,
        stdout: false,
        workers: 4,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--stdout" => args.stdout = true,
            "--requests" => {
                let value = iter.next().context("--requests needs a value")?;
                args.requests = value.parse().context("--requests must be a number")?;
            }
            "--workers" => {
                let value = iter.next().context("--workers needs a value")?;
                args.workers = value.parse().context("--workers must be a number")?;
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

/// The simulated request handler.
async fn hello(telemetry: &Instrumentation, request_id: u64) -> String {
    let mut span = telemetry.start_span("GET /hello");
    span.set_attribute("http.method", "GET");
    span.set_attribute("http.route", "/hello");
    span.set_attribute("request.id", request_id);

    let attrs: Attributes = [("endpoint", "/hello")].into_iter().collect();
    let _ = telemetry.increment_counter_async("hello.requests", 1, attrs).await;

    // Pretend to do some work
    tokio::time::sleep(Duration::from_millis(request_id % 7)).await;

    let _ = span
        .log_async(Severity::Info, "Hello endpoint called", Attributes::new())
        .await;
    span.set_status(SpanStatus::Ok);
    let _ = span.end_async().await;

    "Hello, World!".to_owned()
}

async fn serve(telemetry: Instrumentation, requests: u64, workers: u64) -> u64 {
    let workers = workers.max(1);
    let mut tasks = tokio::task::JoinSet::new();
    for worker in 0..workers {
        let telemetry = telemetry.clone();
        tasks.spawn(async move {
            let mut served = 0;
            let mut id = worker;
            while id < requests {
                let _body = hello(&telemetry, id).await;
                served += 1;
                id += workers;
            }
            served
        });
    }

    let mut served = 0;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(n) => served += n,
            Err(e) => tracing::error!(error = %e, "request worker failed"),
        }
    }
    served
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = PipelineConfig::from_env().context("reading pipeline configuration")?;

    println!("📋 Demo Configuration:");
    println!("   Service: {}", config.service_name);
    println!(
        "   Exporter: {}",
        if args.stdout { "stdout".to_owned() } else { config.endpoint.clone() }
    );
    println!("   Requests: {} across {} workers", args.requests, args.workers);
    println!(
        "   Batch: {} items / {:?}, queue {} ({:?})",
        config.batch.max_batch_size,
        config.batch.max_batch_age,
        config.queue.capacity,
        config.queue.overflow_policy
    );
    println!();

    // The bridge needs the pipeline, and the pipeline logs while starting
    let (bridge, bridge_handle) = reload::Layer::new(None::<TelemetryLayer>);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(bridge)
        .init();

    let mut pipeline = if args.stdout {
        PipelineController::start(config, StdoutExporter::new(true))?
    } else {
        PipelineController::start_http(config)?
    };
    let telemetry = pipeline.instrumentation();
    bridge_handle
        .reload(Some(TelemetryLayer::new(telemetry.clone())))
        .context("attaching the tracing bridge")?;

    tracing::info!(requests = args.requests, "demo service starting");
    let started = Instant::now();

    let served = tokio::select! {
        served = serve(telemetry, args.requests, args.workers) => served,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            0
        }
    };
    let elapsed = started.elapsed();

    println!("\n🛑 Draining telemetry pipeline...");
    if let Err(e) = pipeline.shutdown().await {
        // Best-effort delivery: report and exit normally
        eprintln!("   ⚠️  shutdown: {e}");
    }

    let metrics = pipeline.metrics();
    let queue = pipeline.queue_metrics();
    println!("\n📊 Final Statistics\n");
    println!("   Requests served:     {:>10}", served);
    println!("   Elapsed:             {:>10.2?}", elapsed);
    println!("   Items enqueued:      {:>10}", queue.items_enqueued());
    println!("   Items dropped (queue): {:>8}", queue.items_dropped());
    println!("   Items exported:      {:>10}", metrics.items_exported());
    println!("   Batches exported:    {:>10}", metrics.batches_exported());
    println!("   Batches dropped:     {:>10}", metrics.batches_dropped());

    Ok(())
}
