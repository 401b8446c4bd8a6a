#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # faultline
//!
//! In-process fault-tolerance engine for async Rust: register guarded operations with
//! declarative retry, timeout, circuit breaker, bulkhead and fallback policies, tune
//! individual policy fields at runtime, and invoke operations through one entry point
//! that composes the policies in a fixed order.
//!
//! ## Features
//!
//! - **Retry** with constant, exponential, fibonacci or custom backoff, jitter, abort
//!   conditions and a max-duration budget
//! - **Timeouts** per attempt, with cancellation signalled to the body
//! - **Circuit breakers** with a rolling failure-ratio window and half-open probing
//! - **Bulkheads** limiting concurrency with a bounded FIFO waiting queue
//! - **Fallbacks** producing substitute results from named handlers
//! - **Runtime overrides** of single policy fields from `operation/Kind/field=value` text
//! - **Telemetry** through `tower::Service` sinks and per-operation counters
//!
//! ## Quick Start
//!
//! ```rust
//! use faultline::prelude::*;
//!
//! #[derive(Debug)]
//! enum StoreError { Unavailable }
//!
//! impl Categorized for StoreError {
//!     fn category(&self) -> FailureCategory {
//!         match self {
//!             StoreError::Unavailable => FailureCategory::from_static("Unavailable"),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = FaultTolerance::new();
//!     engine
//!         .register_policy(
//!             "store/get",
//!             GuardedOperationPolicy::new()
//!                 .with_retry(RetryPolicy::default().max_retries(3))
//!                 .with_timeout(TimeoutPolicy::new(TimeAmount::millis(250)))
//!                 .with_circuit_breaker(CircuitBreakerPolicy::default()),
//!         )
//!         .unwrap();
//!
//!     let value = engine
//!         .invoke("store/get", 42u64, |key, _attempt| async move {
//!             Ok::<_, StoreError>(key * 2)
//!         })
//!         .await;
//!     assert_eq!(value.unwrap(), 84);
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod category;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod jitter;
pub mod layer;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use backoff::{Backoff, BackoffError, BackoffStrategy, MAX_BACKOFF};
pub use bulkhead::Bulkhead;
pub use category::{Categorized, CategorySet, FailureCategory};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{parse_overrides, OverrideKey};
pub use error::{FaultError, PolicyError};
pub use fallback::{fallback_fn, FallbackHandler};
pub use jitter::Jitter;
pub use layer::{FaultToleranceLayer, FaultToleranceService};
pub use metrics::MetricsSnapshot;
pub use pipeline::{Attempt, FaultTolerance, FaultToleranceBuilder, OperationSnapshot};
pub use policy::{
    BackoffPolicy, BreakerSampling, BulkheadPolicy, CircuitBreakerPolicy, FallbackPolicy,
    GuardedOperationPolicy, OperationId, PolicyKind, RetryPolicy, TimeAmount, TimeUnit,
    TimeoutPolicy,
};
pub use registry::PolicyRegistry;
pub use retry::{RetryExecutor, RetryReport, RetryStop};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
pub use timeout::TimeoutGovernor;
