use criterion::{black_box, criterion_group, criterion_main, Criterion};
use faultline::prelude::*;
use faultline::{CircuitBreaker, MonotonicClock};
use std::sync::Arc;

#[derive(Debug)]
struct Unavailable;

impl Categorized for Unavailable {
    fn category(&self) -> FailureCategory {
        FailureCategory::from_static("Unavailable")
    }
}

fn breaker_admission(c: &mut Criterion) {
    let policy = CircuitBreakerPolicy::default().request_volume_threshold(100);
    let breaker = CircuitBreaker::new(OperationId::from("bench"), Arc::new(MonotonicClock::default()));

    c.bench_function("circuit_breaker_admit_and_record_success", |b| {
        b.iter(|| {
            if let Ok(permit) = breaker.try_acquire(black_box(&policy)) {
                black_box(permit.record(false, &policy));
            }
        });
    });
}

fn breaker_rejection(c: &mut Criterion) {
    // Long delay keeps the breaker open for the whole run.
    let policy = CircuitBreakerPolicy::default()
        .request_volume_threshold(1)
        .delay(TimeAmount::seconds(3_600));
    let breaker = CircuitBreaker::new(OperationId::from("bench"), Arc::new(MonotonicClock::default()));
    if let Ok(permit) = breaker.try_acquire(&policy) {
        permit.record(true, &policy);
    }

    c.bench_function("circuit_breaker_reject_open", |b| {
        b.iter(|| black_box(breaker.try_acquire(black_box(&policy)).is_err()));
    });
}

fn guarded_invocation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = FaultTolerance::new();
    engine
        .register_policy(
            "bench",
            GuardedOperationPolicy::new()
                .with_retry(RetryPolicy::default().max_retries(3))
                .with_circuit_breaker(CircuitBreakerPolicy::default())
                .with_bulkhead(BulkheadPolicy::new(64, 64)),
        )
        .unwrap();

    c.bench_function("guarded_invocation_success", |b| {
        b.to_async(&rt).iter(|| async {
            let result = engine
                .invoke("bench", black_box(7u64), |n, _attempt| async move {
                    Ok::<_, Unavailable>(n + 1)
                })
                .await;
            black_box(result.is_ok())
        });
    });
}

criterion_group!(benches, breaker_admission, breaker_rejection, guarded_invocation);
criterion_main!(benches);
