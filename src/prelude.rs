//! Convenient re-exports for common faultline types.
pub use crate::{
    backoff::BackoffStrategy,
    category::{Categorized, CategorySet, FailureCategory},
    circuit_breaker::CircuitState,
    error::{FaultError, PolicyError},
    fallback::{fallback_fn, FallbackHandler},
    layer::FaultToleranceLayer,
    pipeline::{Attempt, FaultTolerance},
    policy::{
        BackoffPolicy, BreakerSampling, BulkheadPolicy, CircuitBreakerPolicy, FallbackPolicy,
        GuardedOperationPolicy, OperationId, PolicyKind, RetryPolicy, TimeAmount, TimeUnit,
        TimeoutPolicy,
    },
    telemetry::{FaultEvent, LogSink, MemorySink, NullSink, PolicyEvent},
};
