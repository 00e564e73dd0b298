//! Scheduler throughput benchmarks.
//!
//! Measures how fast a loop drains deferred calls and dispatches requests:
//! - Call batch sizes: 100, 1000, 10000
//! - Passthrough request counts: 100, 1000
//!
//! Run with: cargo bench --bench loop_throughput
//! Results saved to: target/criterion/

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

use wsev::handlers::PassthroughHandler;
use wsev::{Callback, Loop, Request, RequestKind};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CALL_BATCHES: &[usize] = &[100, 1_000, 10_000];
const REQUEST_COUNTS: &[usize] = &[100, 1_000];

// ============================================================================
// Benchmark: Call Drain
// ============================================================================

fn bench_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("loop_calls");
    for &count in CALL_BATCHES {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("drain", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| run_calls(count));
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Request Dispatch
// ============================================================================

fn bench_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("loop_requests");
    group.sample_size(20);
    for &count in REQUEST_COUNTS {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("passthrough", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| run_requests(count));
        });
    }
    group.finish();
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn run_calls(count: usize) -> usize {
    let ev = Loop::new();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..count {
        let hits = Arc::clone(&hits);
        ev.call(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        });
    }

    ev.run().unwrap();
    ev.done().await;
    hits.load(Ordering::Relaxed)
}

async fn run_requests(count: usize) -> usize {
    let ev = Loop::new();
    ev.register(RequestKind::PASSTHROUGH, Arc::new(PassthroughHandler::new()))
        .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    for i in 0..count {
        let hits = Arc::clone(&hits);
        ev.request(
            RequestKind::PASSTHROUGH,
            Request::Value(json!(i)),
            Callback::new(move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }

    ev.run().unwrap();
    ev.done().await;
    hits.load(Ordering::Relaxed)
}

criterion_group!(benches, bench_calls, bench_requests);
criterion_main!(benches);
