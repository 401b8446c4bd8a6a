//! Telemetry for guarded operations.
//!
//! Every strategy of the pipeline emits structured [`PolicyEvent`]s, tagged with the
//! operation they belong to as a [`FaultEvent`]. Events flow through sinks implemented as
//! `tower::Service<FaultEvent>`, so they compose with ordinary tower middleware.
//!
//! # Event Types
//!
//! - **Retry**: `Attempt`, `Aborted`, `Exhausted`
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`, `Rejected`
//! - **Bulkhead**: `Acquired`, `Queued`, `Rejected`
//! - **Timeout**: `Occurred`
//! - **Fallback**: `Applied`, `Failed`
//! - **Every invocation**: `Success`, `Failure`, `Cancelled`
//!
//! Emission is best-effort: a failing sink never changes the outcome of an invocation.

pub mod events;
pub mod sinks;

pub use events::{
    BulkheadEvent, CircuitBreakerEvent, FallbackEvent, FaultEvent, PolicyEvent, RequestOutcome,
    RetryEvent, TimeoutEvent,
};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
