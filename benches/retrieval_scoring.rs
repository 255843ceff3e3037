//! Benchmark the memory retrieval scoring hot path.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use cortex_kernel::services::{ContextManager, MemoryConfig, RetrieveOptions, StoreOptions};

fn bench_retrieve(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("retrieve");
    for &size in &[100usize, 1_000] {
        let mmu = ContextManager::new(MemoryConfig {
            stm_capacity: size,
            ltm_capacity: size,
            auto_compress_threshold: 2.0,
            ..Default::default()
        });
        runtime.block_on(async {
            for i in 0..size {
                mmu.store(
                    format!("entry.{i}"),
                    format!("fact number {i} about service latency and retries"),
                    StoreOptions {
                        importance: Some((i % 10) as f64 / 10.0),
                        ..Default::default()
                    },
                )
                .await;
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(&runtime).iter(|| async {
                mmu.retrieve("service latency retries", RetrieveOptions::default())
                    .await
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_retrieve);
criterion_main!(benches);
