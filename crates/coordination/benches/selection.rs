//! Selection benchmark
//!
//! Measures the broker's hot path: select a worker, then release the slot.
//! Runs against the in-memory store so the numbers reflect the selection
//! logic rather than network round trips.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use browserfleet_coordination::{
    CoordinationStore, InMemoryCoordinationStore, SelectionLimits, Selector, TimingConfig,
    WorkerKey, WorkerRecord,
};

const CAPABILITY: &str = "chromium";

async fn fleet(workers: usize) -> Arc<InMemoryCoordinationStore> {
    let store = Arc::new(InMemoryCoordinationStore::new());
    for i in 0..workers {
        let key = WorkerKey::new(CAPABILITY, format!("worker-{i}")).unwrap();
        store
            .register_worker(
                WorkerRecord::new(key, format!("ws://worker-{i}:9222"), Utc::now()),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
    }
    store
}

/// Select + release on fleets of increasing size
fn bench_select_release(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("selection/select_release");
    group.throughput(Throughput::Elements(1));

    for workers in [1, 8, 64] {
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let store = fleet(workers).await;
                    // Lifetime never binds, so every iteration is assigned.
                    let selector = Selector::new(
                        store,
                        SelectionLimits::new(8, u32::MAX),
                        &TimingConfig::default(),
                    );

                    let start = Instant::now();
                    for _ in 0..iters {
                        let selection = selector.select(CAPABILITY).await.unwrap();
                        if let Some(assignment) = selection.assignment() {
                            selector.release(&assignment.worker).await.unwrap();
                        }
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Concurrent callers contending for the same fleet
fn bench_concurrent_select(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("selection/concurrent");

    for callers in [4, 16] {
        group.throughput(Throughput::Elements(callers as u64));
        group.bench_with_input(
            BenchmarkId::new("callers", callers),
            &callers,
            |b, &callers| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let store = fleet(16).await;
                    let selector = Selector::new(
                        store,
                        SelectionLimits::new(8, u32::MAX),
                        &TimingConfig::default(),
                    );

                    let start = Instant::now();
                    let handles: Vec<_> = (0..callers)
                        .map(|_| {
                            let selector = selector.clone();
                            tokio::spawn(async move {
                                for _ in 0..iters {
                                    let selection = selector.select(CAPABILITY).await.unwrap();
                                    if let Some(assignment) = selection.assignment() {
                                        selector.release(&assignment.worker).await.unwrap();
                                    }
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap();
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_select_release, bench_concurrent_select);
criterion_main!(benches);
