/// Bus Performance Benchmarks using Criterion
///
/// Run with: cargo bench --bench bus_benchmark
///
/// Benchmarks cover:
/// - Publish/subscribe throughput
/// - Request/response round trips
/// - Registry frame encoding
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weft_core::{Bus, Envelope, Lifetime, TypeRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sample {
    seq: u64,
    label: String,
}

#[derive(Debug, Clone)]
struct Ask(u64);

#[derive(Debug, Clone)]
struct Answer(u64);

/// Benchmark: single publisher, single subscriber throughput
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_publish");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for count in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let lifetime = Lifetime::new();
                    let bus = Bus::new(&lifetime);
                    let mut sub = bus.subscribe::<Sample>(false);

                    for seq in 0..count {
                        bus.publish(Sample {
                            seq,
                            label: "bench".to_string(),
                        });
                    }
                    for _ in 0..count {
                        black_box(sub.recv().await);
                    }
                    lifetime.end().await;
                })
            });
        });
    }
    group.finish();
}

/// Benchmark: request/response round trip through a handler
fn bench_request(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let lifetime = Lifetime::new();
    let bus = rt.block_on(async { Bus::new(&lifetime) });
    let _handler = rt
        .block_on(async { bus.register_handler_sync(|Ask(n)| Answer(n + 1)) })
        .unwrap();
    let never = CancellationToken::new();

    c.bench_function("bus_request_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let res: Option<Answer> = bus
                    .request(Ask(1), Duration::from_secs(1), &never)
                    .await
                    .unwrap();
                black_box(res)
            })
        });
    });
}

/// Benchmark: wire encoding of a registered type
fn bench_encode(c: &mut Criterion) {
    let registry = TypeRegistry::builder()
        .register::<Sample>("bench.sample")
        .build()
        .unwrap();
    let envelope = Envelope::wrap(Sample {
        seq: 7,
        label: "a fairly ordinary label".to_string(),
    });

    c.bench_function("registry_encode_decode", |b| {
        b.iter(|| {
            let frame = registry.encode(black_box(&envelope)).unwrap();
            black_box(registry.decode(&frame))
        });
    });
}

criterion_group!(benches, bench_publish, bench_request, bench_encode);
criterion_main!(benches);
