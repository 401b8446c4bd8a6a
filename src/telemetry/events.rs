use crate::category::FailureCategory;
use crate::policy::OperationId;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::Serialize;

/// A policy event tagged with the operation that produced it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct FaultEvent {
    pub operation: OperationId,
    pub event: PolicyEvent,
}

impl FaultEvent {
    pub fn new(operation: OperationId, event: impl Into<PolicyEvent>) -> Self {
        Self { operation, event: event.into() }
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.event)
    }
}

/// Policy events emitted during execution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum PolicyEvent {
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Bulkhead(BulkheadEvent),
    Timeout(TimeoutEvent),
    Fallback(FallbackEvent),
    /// Terminal outcome of one invocation.
    Request(RequestOutcome),
}

/// Events emitted by the retry executor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum RetryEvent {
    /// A retry is about to be made; emitted before the backoff sleep.
    Attempt {
        /// The retry number (1-indexed)
        attempt: usize,
        delay: Duration,
    },
    /// The failure matched `abort_on`; no further attempts.
    Aborted { attempt: usize, category: FailureCategory },
    /// Retries or the duration budget ran out.
    Exhausted { total_attempts: usize, total_duration: Duration },
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CircuitBreakerEvent {
    /// Transitioned to open; `failures` of `samples` in the window failed.
    Opened { failures: usize, samples: usize },
    /// Open delay elapsed; probing.
    HalfOpen,
    /// Probes succeeded; normal operation resumes.
    Closed,
    /// A call was refused without reaching the body.
    Rejected { retry_after: Duration },
}

/// Events emitted by bulkheads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum BulkheadEvent {
    Acquired { active_count: usize, max_concurrency: usize },
    /// Every slot was busy; the caller waits in the queue.
    Queued { waiting: usize, queue_size: usize },
    Rejected { active_count: usize, max_concurrency: usize, waiting: usize },
}

/// Events emitted by the timeout governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum TimeoutEvent {
    /// An attempt exceeded its deadline and was cancelled.
    Occurred { attempt: usize, timeout: Duration },
}

/// Events emitted by the fallback dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum FallbackEvent {
    /// The handler produced the result.
    Applied { handler: String, category: FailureCategory },
    /// The handler itself failed.
    Failed { handler: String, category: FailureCategory },
}

/// Terminal outcome of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration },
    Cancelled { duration: Duration },
}

impl From<RetryEvent> for PolicyEvent {
    fn from(event: RetryEvent) -> Self {
        PolicyEvent::Retry(event)
    }
}

impl From<CircuitBreakerEvent> for PolicyEvent {
    fn from(event: CircuitBreakerEvent) -> Self {
        PolicyEvent::CircuitBreaker(event)
    }
}

impl From<BulkheadEvent> for PolicyEvent {
    fn from(event: BulkheadEvent) -> Self {
        PolicyEvent::Bulkhead(event)
    }
}

impl From<TimeoutEvent> for PolicyEvent {
    fn from(event: TimeoutEvent) -> Self {
        PolicyEvent::Timeout(event)
    }
}

impl From<FallbackEvent> for PolicyEvent {
    fn from(event: FallbackEvent) -> Self {
        PolicyEvent::Fallback(event)
    }
}

impl From<RequestOutcome> for PolicyEvent {
    fn from(event: RequestOutcome) -> Self {
        PolicyEvent::Request(event)
    }
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::Fallback(event) => write!(f, "Fallback::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Aborted { attempt, category } => {
                write!(f, "Aborted(#{}, category={})", attempt, category)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failures, samples } => {
                write!(f, "Opened(failures={}/{})", failures, samples)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Rejected { retry_after } => {
                write!(f, "Rejected(retry_after={:?})", retry_after)
            }
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({}/{})", active_count, max_concurrency)
            }
            BulkheadEvent::Queued { waiting, queue_size } => {
                write!(f, "Queued({}/{})", waiting, queue_size)
            }
            BulkheadEvent::Rejected { active_count, max_concurrency, waiting } => {
                write!(f, "Rejected({}/{}, waiting={})", active_count, max_concurrency, waiting)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { attempt, timeout } => {
                write!(f, "Occurred(#{}, timeout={:?})", attempt, timeout)
            }
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Applied { handler, category } => {
                write!(f, "Applied({}, category={})", handler, category)
            }
            FallbackEvent::Failed { handler, category } => {
                write!(f, "Failed({}, category={})", handler, category)
            }
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
            RequestOutcome::Cancelled { duration } => {
                write!(f, "Cancelled(duration={:?})", duration)
            }
        }
    }
}
