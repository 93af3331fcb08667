use criterion::{black_box, criterion_group, criterion_main, Criterion};
use palisade::{CircuitBreakerPolicy, PipelineError};
use std::time::Duration;

type Breaker = CircuitBreakerPolicy<u16, std::io::Error>;

fn closed_success_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker: Breaker = CircuitBreakerPolicy::new(10, Duration::from_secs(30)).unwrap();

    c.bench_function("breaker_closed_success", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let _ = black_box(
                    breaker
                        .execute(|| async {
                            Ok::<_, PipelineError<std::io::Error>>(black_box(200u16))
                        })
                        .await,
                );
            }
        });
    });
}

fn open_rejection_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker: Breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(3600)).unwrap();

    // Open the circuit once so every benchmarked call short-circuits.
    rt.block_on(async {
        let _ = breaker
            .execute(|| async { Ok::<_, PipelineError<std::io::Error>>(500u16) })
            .await;
    });

    c.bench_function("breaker_open_rejection", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let _ = black_box(
                    breaker
                        .execute(|| async {
                            Ok::<_, PipelineError<std::io::Error>>(black_box(200u16))
                        })
                        .await,
                );
            }
        });
    });
}

criterion_group!(benches, closed_success_path, open_rejection_path);
criterion_main!(benches);
