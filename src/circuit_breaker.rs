//! Circuit breaker state machine with a rolling outcome window.
//!
//! - **Closed**: admits everything; each recorded outcome enters a window of the last
//!   `request_volume_threshold` samples. Once the window is full and
//!   `failures / samples >= failure_ratio`, the breaker opens.
//! - **Open**: rejects until `delay` has elapsed since opening, then the next admission
//!   moves it to half-open.
//! - **HalfOpen**: admits one probe at a time. A failed probe reopens (restarting the
//!   timer); `success_threshold` consecutive successful probes close it.
//!
//! Admission hands out a [`BreakerPermit`]. Every transition bumps a generation counter and
//! permits from an older generation are ignored when recorded, so a slow call admitted while
//! closed cannot affect the half-open probe that follows. Dropping a permit without
//! recording (cancellation, panic) frees the probe slot.

use crate::category::FailureCategory;
use crate::clock::Clock;
use crate::policy::{CircuitBreakerPolicy, OperationId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the delay elapses.
    Open,
    /// Probe mode: one call at a time tests recovery.
    HalfOpen,
}

/// Whether an outcome with this category is a failure sample under `policy`.
///
/// `None` (no category) never counts as a failure.
pub(crate) fn counts_as_failure(
    policy: &CircuitBreakerPolicy,
    category: Option<&FailureCategory>,
) -> bool {
    category.map_or(false, |c| policy.fail_on.contains(c) && !policy.skip_on.contains(c))
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// `true` marks a failure; newest at the back.
    window: VecDeque<bool>,
    opened_at_millis: u64,
    half_open_successes: u32,
    probe_in_flight: bool,
    generation: u64,
}

/// Rejection from an open (or busy half-open) breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time until the breaker will admit a probe; zero while another probe runs.
    pub retry_after: Duration,
}

/// State change caused by an admission or a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { failures: usize, samples: usize },
    HalfOpened,
    Closed,
}

/// Per-operation circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    operation: OperationId,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(operation: OperationId, clock: Arc<dyn Clock>) -> Self {
        Self {
            operation,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at_millis: 0,
                half_open_successes: 0,
                probe_in_flight: false,
                generation: 0,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// `(failures, samples)` currently in the rolling window.
    pub fn window(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.window.iter().filter(|failed| **failed).count(), inner.window.len())
    }

    /// Ask for admission. Rejections are not samples.
    pub fn try_acquire(
        &self,
        policy: &CircuitBreakerPolicy,
    ) -> Result<BreakerPermit<'_>, Rejected> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(&inner, false, None)),
            CircuitState::Open => {
                let delay = millis(policy.delay.to_duration());
                let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_millis);
                if elapsed < delay {
                    return Err(Rejected { retry_after: Duration::from_millis(delay - elapsed) });
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.probe_in_flight = true;
                inner.generation += 1;
                tracing::info!(operation = %self.operation, "Circuit breaker → half-open");
                Ok(self.permit(&inner, true, Some(Transition::HalfOpened)))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Rejected { retry_after: Duration::ZERO });
                }
                inner.probe_in_flight = true;
                tracing::debug!(operation = %self.operation, "Circuit breaker: half-open probe");
                Ok(self.permit(&inner, true, None))
            }
        }
    }

    fn permit(&self, inner: &Inner, probe: bool, transition: Option<Transition>) -> BreakerPermit<'_> {
        BreakerPermit { breaker: self, generation: inner.generation, probe, transition, recorded: false }
    }

    /// Force the breaker back to closed with an empty window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.window.clear();
        inner.opened_at_millis = 0;
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        inner.generation += 1;
        tracing::info!(operation = %self.operation, "Circuit breaker reset → closed");
    }

    fn record(
        &self,
        generation: u64,
        probe: bool,
        failed: bool,
        policy: &CircuitBreakerPolicy,
    ) -> Option<Transition> {
        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::trace!(operation = %self.operation, "stale breaker sample ignored");
            return None;
        }
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => {
                let capacity = policy.request_volume_threshold.max(1) as usize;
                while inner.window.len() >= capacity {
                    inner.window.pop_front();
                }
                inner.window.push_back(failed);

                let samples = inner.window.len();
                let failures = inner.window.iter().filter(|f| **f).count();
                let ratio = failures as f64 / samples as f64;
                if samples >= capacity && failures > 0 && ratio >= policy.failure_ratio {
                    tracing::error!(
                        operation = %self.operation,
                        failures,
                        samples,
                        threshold = policy.failure_ratio,
                        "Circuit breaker → open"
                    );
                    self.open(&mut inner);
                    return Some(Transition::Opened { failures, samples });
                }
                None
            }
            CircuitState::HalfOpen if failed => {
                tracing::warn!(operation = %self.operation, "Circuit breaker → open (probe failed)");
                self.open(&mut inner);
                Some(Transition::Opened { failures: 1, samples: 1 })
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes < policy.success_threshold {
                    return None;
                }
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.half_open_successes = 0;
                inner.generation += 1;
                tracing::info!(operation = %self.operation, "Circuit breaker → closed");
                Some(Transition::Closed)
            }
            CircuitState::Open => None,
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at_millis = self.clock.now_millis();
        inner.window.clear();
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        inner.generation += 1;
    }

    fn release_probe(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.probe_in_flight = false;
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Admission ticket; record the outcome with [`BreakerPermit::record`].
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    transition: Option<Transition>,
    recorded: bool,
}

impl BreakerPermit<'_> {
    /// Transition caused by this admission (open → half-open).
    pub fn transition(&self) -> Option<Transition> {
        self.transition
    }

    /// True when this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the outcome; returns the transition it caused, if any.
    pub fn record(mut self, failed: bool, policy: &CircuitBreakerPolicy) -> Option<Transition> {
        self.recorded = true;
        self.breaker.record(self.generation, self.probe, failed, policy)
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.recorded {
            self.breaker.release_probe(self.generation);
        }
    }
}
