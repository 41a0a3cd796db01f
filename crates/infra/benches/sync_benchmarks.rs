use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metricsync_core::{StoreAccount, StoreCode, SyncKind};
use metricsync_infra::accounts::InMemoryAccountRegistry;
use metricsync_infra::config::SyncSettings;
use metricsync_infra::jobs::{BatchConfig, BatchExecutor, SyncOrchestrator};
use metricsync_infra::locks::TenantLockManager;
use metricsync_infra::run_log::InMemoryRunLog;
use metricsync_infra::sync::{SyncError, SyncReport, TenantSync};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn store_codes(n: usize) -> Vec<StoreCode> {
    (0..n)
        .map(|i| StoreCode::new(format!("shop-{i:04}")).unwrap())
        .collect()
}

/// Simulated upstream call of fixed latency.
struct SlowSync {
    latency: Duration,
}

#[async_trait]
impl TenantSync for SlowSync {
    async fn sync(&self, _store_code: &StoreCode) -> Result<SyncReport, SyncError> {
        tokio::time::sleep(self.latency).await;
        Ok(SyncReport::processed(1))
    }
}

fn bench_executor_concurrency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_executor_concurrency");
    group.sample_size(20);
    group.throughput(Throughput::Elements(200));

    for concurrency in [1usize, 5, 20, 50].iter() {
        group.bench_with_input(
            BenchmarkId::new("sleep_1ms_x200", concurrency),
            concurrency,
            |b, &concurrency| {
                let executor: BatchExecutor<usize, usize, ()> =
                    BatchExecutor::new(BatchConfig::new(concurrency)).unwrap();
                b.iter(|| {
                    let summary = rt.block_on(executor.run((0..200).collect(), |i| async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok(i)
                    }));
                    black_box(summary.successful);
                });
            },
        );
    }

    group.finish();
}

fn bench_executor_overhead(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_executor_overhead");

    for size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("noop", size), size, |b, &size| {
            let executor: BatchExecutor<usize, usize, ()> =
                BatchExecutor::new(BatchConfig::new(20)).unwrap();
            b.iter(|| {
                let summary =
                    rt.block_on(executor.run((0..size).collect(), |i| async move { Ok(i) }));
                black_box(summary.total());
            });
        });
    }

    group.finish();
}

fn bench_daily_sync(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("daily_sync_in_memory");
    group.sample_size(20);

    for stores in [50usize, 300].iter() {
        group.throughput(Throughput::Elements(*stores as u64));
        group.bench_with_input(BenchmarkId::new("stores", stores), stores, |b, &stores| {
            let registry = InMemoryAccountRegistry::arc();
            for code in store_codes(stores) {
                registry.insert(StoreAccount::connected(code, Utc::now() + chrono::Duration::days(7)));
            }
            let orchestrator = SyncOrchestrator::new(
                registry,
                TenantLockManager::in_memory(),
                InMemoryRunLog::arc(),
                SyncSettings::default(),
            )
            .with_sync(
                SyncKind::ShopMetrics,
                Arc::new(SlowSync {
                    latency: Duration::from_millis(1),
                }),
            );

            b.iter(|| {
                let result = rt
                    .block_on(orchestrator.run_daily_sync(SyncKind::ShopMetrics))
                    .unwrap();
                black_box(result.successful);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_executor_concurrency,
    bench_executor_overhead,
    bench_daily_sync
);
criterion_main!(benches);
