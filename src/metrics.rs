//! Per-operation counters.
//!
//! Counters are plain relaxed atomics updated by the pipeline; [`OperationMetrics::snapshot`]
//! reads them into a [`MetricsSnapshot`] for introspection. A snapshot taken while
//! invocations run is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct OperationMetrics {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
    retries_aborted: AtomicU64,
    timeouts: AtomicU64,
    circuit_rejections: AtomicU64,
    circuit_opened: AtomicU64,
    bulkhead_queued: AtomicU64,
    bulkhead_rejections: AtomicU64,
    fallbacks_applied: AtomicU64,
    fallbacks_failed: AtomicU64,
}

/// Point-in-time copy of an operation's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricsSnapshot {
    pub invocations: u64,
    /// Invocations that returned a value, including fallback results.
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub retries: u64,
    pub retries_exhausted: u64,
    pub retries_aborted: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
    pub circuit_opened: u64,
    pub bulkhead_queued: u64,
    pub bulkhead_rejections: u64,
    pub fallbacks_applied: u64,
    pub fallbacks_failed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn invocation(&self) {
        bump(&self.invocations);
    }

    pub(crate) fn success(&self) {
        bump(&self.successes);
    }

    pub(crate) fn failure(&self) {
        bump(&self.failures);
    }

    pub(crate) fn cancelled(&self) {
        bump(&self.cancellations);
    }

    pub(crate) fn retried(&self, retries: usize) {
        self.retries.fetch_add(retries as u64, Ordering::Relaxed);
    }

    pub(crate) fn retries_exhausted(&self) {
        bump(&self.retries_exhausted);
    }

    pub(crate) fn retries_aborted(&self) {
        bump(&self.retries_aborted);
    }

    pub(crate) fn timeout(&self) {
        bump(&self.timeouts);
    }

    pub(crate) fn circuit_rejected(&self) {
        bump(&self.circuit_rejections);
    }

    pub(crate) fn circuit_opened(&self) {
        bump(&self.circuit_opened);
    }

    pub(crate) fn bulkhead_queued(&self) {
        bump(&self.bulkhead_queued);
    }

    pub(crate) fn bulkhead_rejected(&self) {
        bump(&self.bulkhead_rejections);
    }

    pub(crate) fn fallback_applied(&self) {
        bump(&self.fallbacks_applied);
    }

    pub(crate) fn fallback_failed(&self) {
        bump(&self.fallbacks_failed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            invocations: load(&self.invocations),
            successes: load(&self.successes),
            failures: load(&self.failures),
            cancellations: load(&self.cancellations),
            retries: load(&self.retries),
            retries_exhausted: load(&self.retries_exhausted),
            retries_aborted: load(&self.retries_aborted),
            timeouts: load(&self.timeouts),
            circuit_rejections: load(&self.circuit_rejections),
            circuit_opened: load(&self.circuit_opened),
            bulkhead_queued: load(&self.bulkhead_queued),
            bulkhead_rejections: load(&self.bulkhead_rejections),
            fallbacks_applied: load(&self.fallbacks_applied),
            fallbacks_failed: load(&self.fallbacks_failed),
        }
    }
}
