mod common;

use common::test_helpers::{test_engine, TestError};
use faultline::prelude::*;
use faultline::telemetry::{
    BulkheadEvent, CircuitBreakerEvent, FallbackEvent, RequestOutcome, RetryEvent,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn guarded() -> GuardedOperationPolicy {
    GuardedOperationPolicy::new()
        .with_bulkhead(BulkheadPolicy::new(4, 0))
        .with_circuit_breaker(CircuitBreakerPolicy::default().request_volume_threshold(2))
        .with_retry(RetryPolicy::default().max_retries(2).delay(TimeAmount::millis(10)).jitter(TimeAmount::ZERO))
        .with_fallback(FallbackPolicy::new("zero"))
}

#[tokio::test]
async fn events_follow_the_pipeline_order() {
    let (engine, _, sink) = test_engine();
    engine.register_policy("op", guarded()).unwrap();
    engine.register_fallback(
        "zero",
        fallback_fn(|_: (), _: FaultError<TestError>| async { Ok::<u32, TestError>(0) }),
    );

    let value = engine
        .invoke("op", (), |_: (), _: Attempt| async { Err::<u32, _>(TestError("Down")) })
        .await
        .unwrap();
    assert_eq!(value, 0);

    let events: Vec<PolicyEvent> = sink.events_for("op").into_iter().map(|e| e.event).collect();
    let delay = Duration::from_millis(10);
    assert_eq!(events.len(), 6, "{:?}", events);
    assert_eq!(
        events[0],
        PolicyEvent::Bulkhead(BulkheadEvent::Acquired { active_count: 1, max_concurrency: 4 })
    );
    assert_eq!(events[1], PolicyEvent::Retry(RetryEvent::Attempt { attempt: 1, delay }));
    assert_eq!(events[2], PolicyEvent::Retry(RetryEvent::Attempt { attempt: 2, delay }));
    assert!(matches!(
        events[3],
        PolicyEvent::Retry(RetryEvent::Exhausted { total_attempts: 3, .. })
    ));
    assert_eq!(
        events[4],
        PolicyEvent::Fallback(FallbackEvent::Applied {
            handler: "zero".to_string(),
            category: FailureCategory::new("Down"),
        })
    );
    assert!(matches!(events[5], PolicyEvent::Request(RequestOutcome::Success { .. })));
}

#[tokio::test]
async fn breaker_transitions_are_emitted() {
    let (engine, clock, sink) = test_engine();
    engine
        .register_policy(
            "op",
            GuardedOperationPolicy::new().with_circuit_breaker(
                CircuitBreakerPolicy::default().request_volume_threshold(1).delay(TimeAmount::millis(100)),
            ),
        )
        .unwrap();

    let _ = engine.invoke("op", (), |_: (), _: Attempt| async { Err::<(), _>(TestError("Down")) }).await;
    let _ = engine.invoke("op", (), |_: (), _: Attempt| async { Ok::<_, TestError>(()) }).await;
    clock.advance(Duration::from_millis(100));
    engine.invoke("op", (), |_: (), _: Attempt| async { Ok::<_, TestError>(()) }).await.unwrap();

    let breaker_events: Vec<CircuitBreakerEvent> = sink
        .events_for("op")
        .into_iter()
        .filter_map(|e| match e.event {
            PolicyEvent::CircuitBreaker(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(
        breaker_events,
        vec![
            CircuitBreakerEvent::Opened { failures: 1, samples: 1 },
            CircuitBreakerEvent::Rejected { retry_after: Duration::from_millis(100) },
            CircuitBreakerEvent::HalfOpen,
            CircuitBreakerEvent::Closed,
        ]
    );
    assert_eq!(engine.metrics("op").unwrap().circuit_opened, 1);
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn breaker_transitions_are_logged() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (engine, _, _) = test_engine();
    engine
        .register_policy(
            "orders/place",
            GuardedOperationPolicy::new()
                .with_circuit_breaker(CircuitBreakerPolicy::default().request_volume_threshold(1)),
        )
        .unwrap();
    let _ = engine
        .invoke("orders/place", (), |_: (), _: Attempt| async { Err::<(), _>(TestError("Down")) })
        .await;

    let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("Circuit breaker → open"), "{}", output);
    assert!(output.contains("orders/place"), "{}", output);
}

#[cfg(feature = "serde")]
#[tokio::test]
async fn snapshots_export_as_json() {
    let (engine, _, _) = test_engine();
    engine
        .register_policy(
            "op",
            GuardedOperationPolicy::new()
                .with_retry(RetryPolicy::default().max_retries(2).jitter(TimeAmount::ZERO))
                .with_timeout(TimeoutPolicy::new(TimeAmount::millis(250))),
        )
        .unwrap();
    engine.invoke("op", (), |_: (), _: Attempt| async { Ok::<_, TestError>(()) }).await.unwrap();

    let json = serde_json::to_value(engine.list_operations()).unwrap();
    let snapshot = &json[0];
    assert_eq!(snapshot["id"], "op");
    assert_eq!(snapshot["circuit_state"], "Closed");
    assert_eq!(snapshot["metrics"]["invocations"], 1);
    assert_eq!(snapshot["metrics"]["successes"], 1);
    assert_eq!(snapshot["policy"]["retry"]["max_retries"], 2);
    assert_eq!(snapshot["policy"]["timeout"]["duration"]["value"], 250);
    assert!(snapshot["policy"]["bulkhead"].is_null());

    let policy: GuardedOperationPolicy =
        serde_json::from_value(snapshot["policy"].clone()).unwrap();
    assert_eq!(policy, *engine.registry().resolve("op").unwrap());
}

#[cfg(feature = "serde")]
#[test]
fn events_serialize_with_their_operation() {
    let event = FaultEvent::new(
        OperationId::from("op"),
        RetryEvent::Attempt { attempt: 1, delay: Duration::from_millis(5) },
    );
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["operation"], "op");
    assert_eq!(json["event"]["Retry"]["Attempt"]["attempt"], 1);
}
