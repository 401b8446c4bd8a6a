//! Retry executor.
//!
//! Semantics:
//! - `max_retries` counts retries after the initial attempt; `0` means a single attempt.
//! - Only body failures (`FaultError::Inner`) and attempt timeouts are retry candidates;
//!   every other failure (open circuit, cancellation, ...) propagates unchanged.
//! - A candidate whose category is in `abort_on` propagates unchanged, even if it is also
//!   in `retry_on`. A candidate outside `retry_on` propagates unchanged.
//! - Running out of retries, or of the `max_duration` budget, yields
//!   `FaultError::RetryExhausted` carrying the last failure.
//! - The delay before retry `n` is `jitter(backoff.delay(n))`. The wait races the
//!   cancellation token.
//!
//! ```rust
//! use faultline::retry::{RetryExecutor, RetryStop};
//! use faultline::{FaultError, FailureCategory, Categorized, OperationId, RetryPolicy};
//! use faultline::{InstantSleeper, MonotonicClock, NullSink};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl Categorized for Flaky {
//!     fn category(&self) -> FailureCategory { FailureCategory::from_static("Flaky") }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::default().max_retries(2);
//! let executor = RetryExecutor::new(&policy, OperationId::from("demo"), NullSink)
//!     .with_sleeper(Arc::new(InstantSleeper))
//!     .with_clock(Arc::new(MonotonicClock::default()));
//! let (result, report) = executor
//!     .execute(&CancellationToken::new(), |_attempt| async { Err::<(), _>(FaultError::Inner(Flaky)) })
//!     .await;
//! assert_eq!(result.unwrap_err().retry_attempts(), Some(3));
//! assert_eq!(report.stop, RetryStop::MaxRetriesReached);
//! # });
//! ```

use crate::backoff::Backoff;
use crate::category::Categorized;
use crate::clock::{Clock, MonotonicClock};
use crate::error::FaultError;
use crate::jitter::Jitter;
use crate::policy::{OperationId, RetryPolicy};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, FaultEvent, RetryEvent, TelemetrySink};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why the retry loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStop {
    Succeeded,
    /// The failure was not a retry candidate or not in `retry_on`.
    NotRetryable,
    /// The failure matched `abort_on`.
    Aborted,
    MaxRetriesReached,
    MaxDurationReached,
    Cancelled,
}

/// Summary of one retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    /// Retries performed after the initial attempt.
    pub retries: usize,
    pub stop: RetryStop,
}

/// Drives the attempts of one invocation under a [`RetryPolicy`].
pub struct RetryExecutor<'a, S> {
    policy: &'a RetryPolicy,
    operation: OperationId,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl<S> std::fmt::Debug for RetryExecutor<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("operation", &self.operation)
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sink", &"<sink>")
            .finish()
    }
}

impl<'a, S> RetryExecutor<'a, S>
where
    S: TelemetrySink,
{
    /// Executor with the policy's constant/exponential/fibonacci backoff and jitter.
    /// Custom backoffs are supplied with [`RetryExecutor::with_backoff`].
    pub fn new(policy: &'a RetryPolicy, operation: OperationId, sink: S) -> Self {
        Self {
            backoff: Backoff::from_policy(policy, None)
                .unwrap_or_else(|| Backoff::constant(policy.delay.to_duration())),
            jitter: Jitter::bounded(policy.jitter.to_duration()),
            policy,
            operation,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            sink,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Clock for the `max_duration` budget.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `attempt(n)` (n starting at 1) until it succeeds or the policy stops retrying.
    pub async fn execute<T, E, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: Op,
    ) -> (Result<T, FaultError<E>>, RetryReport)
    where
        E: Categorized,
        Op: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, FaultError<E>>>,
    {
        let started = self.clock.now_millis();
        let budget = millis(self.policy.max_duration.to_duration());
        let mut retries = 0usize;

        loop {
            let number = retries + 1;
            let failure = match attempt(number).await {
                Ok(value) => return (Ok(value), RetryReport { retries, stop: RetryStop::Succeeded }),
                Err(failure) => failure,
            };
            let stop = |stop| RetryReport { retries, stop };

            if failure.is_cancelled() {
                return (Err(failure), stop(RetryStop::Cancelled));
            }
            if !(failure.is_inner() || failure.is_timeout()) {
                return (Err(failure), stop(RetryStop::NotRetryable));
            }
            let Some(category) = failure.category() else {
                return (Err(failure), stop(RetryStop::NotRetryable));
            };
            if self.policy.abort_on.contains(&category) {
                tracing::debug!(operation = %self.operation, attempt = number, %category, "retry aborted");
                self.emit(RetryEvent::Aborted { attempt: number, category }).await;
                return (Err(failure), stop(RetryStop::Aborted));
            }
            if !self.policy.retry_on.contains(&category) {
                return (Err(failure), stop(RetryStop::NotRetryable));
            }

            let elapsed = self.clock.now_millis().saturating_sub(started);
            if retries >= self.policy.max_retries as usize {
                return (self.exhausted(number, elapsed, failure).await, stop(RetryStop::MaxRetriesReached));
            }
            let delay = self.jitter.apply(self.backoff.delay(number));
            if budget > 0 && elapsed.saturating_add(millis(delay)) >= budget {
                return (self.exhausted(number, elapsed, failure).await, stop(RetryStop::MaxDurationReached));
            }

            tracing::debug!(
                operation = %self.operation,
                attempt = number,
                delay_ms = millis(delay),
                %category,
                "retrying after failure"
            );
            self.emit(RetryEvent::Attempt { attempt: number, delay }).await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return (Err(FaultError::Cancelled), stop(RetryStop::Cancelled));
                }
                _ = self.sleeper.sleep(delay) => {}
            }
            retries += 1;
        }
    }

    async fn exhausted<T, E>(
        &self,
        attempts: usize,
        elapsed_millis: u64,
        last: FaultError<E>,
    ) -> Result<T, FaultError<E>>
    where
        E: Categorized,
    {
        let total_duration = Duration::from_millis(elapsed_millis);
        tracing::warn!(operation = %self.operation, attempts, ?total_duration, "retries exhausted");
        self.emit(RetryEvent::Exhausted { total_attempts: attempts, total_duration }).await;
        Err(FaultError::retry_exhausted(attempts, last))
    }

    async fn emit(&self, event: RetryEvent) {
        emit_best_effort(self.sink.clone(), FaultEvent::new(self.operation.clone(), event)).await;
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{CategorySet, FailureCategory};
    use crate::clock::ManualClock;
    use crate::policy::{BackoffPolicy, TimeAmount};
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use crate::telemetry::{MemorySink, NullSink, PolicyEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    impl Categorized for TestError {
        fn category(&self) -> FailureCategory {
            FailureCategory::new(self.0)
        }
    }

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        policy.jitter(TimeAmount::ZERO)
    }

    fn executor(policy: &RetryPolicy) -> RetryExecutor<'_, NullSink> {
        RetryExecutor::new(policy, OperationId::from("test"), NullSink)
            .with_sleeper(Arc::new(InstantSleeper))
    }

    async fn run(
        executor: &RetryExecutor<'_, impl TelemetrySink>,
        calls: &Arc<AtomicUsize>,
        outcome: impl Fn(usize) -> Result<u32, FaultError<TestError>>,
    ) -> (Result<u32, FaultError<TestError>>, RetryReport) {
        executor
            .execute(&CancellationToken::new(), |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                let result = outcome(n);
                async move { result }
            })
            .await
    }

    #[tokio::test]
    async fn success_first_attempt() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, report) = run(&executor(&policy), &calls, |_| Ok(7)).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report, RetryReport { retries: 0, stop: RetryStop::Succeeded });
    }

    #[tokio::test]
    async fn success_after_retries() {
        let policy = RetryPolicy::default().max_retries(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, report) = run(&executor(&policy), &calls, |n| {
            if n < 3 {
                Err(FaultError::Inner(TestError("Flaky")))
            } else {
                Ok(n as u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(report.retries, 2);
    }

    #[tokio::test]
    async fn always_failing_body_runs_n_plus_one_times() {
        for n in [0u32, 1, 3] {
            let policy = RetryPolicy::default().max_retries(n);
            let calls = Arc::new(AtomicUsize::new(0));
            let (result, report) =
                run(&executor(&policy), &calls, |_| Err(FaultError::Inner(TestError("Down")))).await;
            assert_eq!(calls.load(Ordering::SeqCst), n as usize + 1);
            let err = result.unwrap_err();
            assert_eq!(err.retry_attempts(), Some(n as usize + 1));
            assert_eq!(err.last_failure().and_then(FaultError::as_inner), Some(&TestError("Down")));
            assert_eq!(report.stop, RetryStop::MaxRetriesReached);
        }
    }

    #[tokio::test]
    async fn abort_on_wins_over_retry_on() {
        let policy = RetryPolicy::default()
            .retry_on(CategorySet::any())
            .abort_on(CategorySet::of(["Fatal"]));
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, report) =
            run(&executor(&policy), &calls, |_| Err(FaultError::Inner(TestError("Fatal")))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().into_inner(), Some(TestError("Fatal")));
        assert_eq!(report.stop, RetryStop::Aborted);
    }

    #[tokio::test]
    async fn failures_outside_retry_on_propagate() {
        let policy = RetryPolicy::default().retry_on(CategorySet::of(["Unavailable"]));
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, report) =
            run(&executor(&policy), &calls, |_| Err(FaultError::Inner(TestError("NotFound")))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_inner());
        assert_eq!(report.stop, RetryStop::NotRetryable);
    }

    #[tokio::test]
    async fn engine_failures_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, _) = run(&executor(&policy), &calls, |_| {
            Err(FaultError::CircuitOpen { retry_after: Duration::from_secs(1) })
        })
        .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_are_retried() {
        let policy = RetryPolicy::default().max_retries(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, _) = run(&executor(&policy), &calls, |_| {
            Err(FaultError::Timeout { elapsed: Duration::from_millis(5), timeout: Duration::from_millis(5) })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.unwrap_err().last_failure().unwrap().is_timeout());
    }

    #[tokio::test]
    async fn backoff_delays_are_applied_in_order() {
        let policy = no_jitter(
            RetryPolicy::default()
                .max_retries(4)
                .delay(TimeAmount::millis(100))
                .backoff(BackoffPolicy::Exponential { factor: 2, max_delay: TimeAmount::millis(500) }),
        );
        let sleeper = TrackingSleeper::new();
        let executor = RetryExecutor::new(&policy, OperationId::from("test"), NullSink)
            .with_sleeper(Arc::new(sleeper.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = run(&executor, &calls, |_| Err(FaultError::Inner(TestError("Down")))).await;
        assert_eq!(
            sleeper.calls(),
            [100, 200, 400, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test]
    async fn jitter_stays_within_bound() {
        let policy = RetryPolicy::default()
            .max_retries(20)
            .delay(TimeAmount::millis(300))
            .jitter(TimeAmount::millis(100));
        let sleeper = TrackingSleeper::new();
        let executor = RetryExecutor::new(&policy, OperationId::from("test"), NullSink)
            .with_sleeper(Arc::new(sleeper.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = run(&executor, &calls, |_| Err(FaultError::Inner(TestError("Down")))).await;
        for delay in sleeper.calls() {
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
    }

    #[derive(Debug)]
    struct SteppingSleeper(ManualClock);

    impl Sleeper for SteppingSleeper {
        fn sleep(&self, duration: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
            self.0.advance(duration);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn max_duration_bounds_the_loop() {
        let policy = no_jitter(
            RetryPolicy::default()
                .max_retries(100)
                .delay(TimeAmount::millis(100))
                .max_duration(TimeAmount::millis(350)),
        );
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(&policy, OperationId::from("test"), NullSink)
            .with_sleeper(Arc::new(SteppingSleeper(clock.clone())))
            .with_clock(Arc::new(clock));
        let calls = Arc::new(AtomicUsize::new(0));
        let (result, report) =
            run(&executor, &calls, |_| Err(FaultError::Inner(TestError("Down")))).await;
        // Retries at 100, 200, 300 ms; the next one would end at 400 >= 350.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err().retry_attempts(), Some(4));
        assert_eq!(report.stop, RetryStop::MaxDurationReached);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = no_jitter(RetryPolicy::default().delay(TimeAmount::seconds(60)).max_duration(TimeAmount::ZERO));
        let executor = RetryExecutor::new(&policy, OperationId::from("test"), NullSink);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let (result, report) = executor
            .execute(&cancel, |_| {
                canceller.cancel();
                async { Err::<(), _>(FaultError::Inner(TestError("Down"))) }
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(report.stop, RetryStop::Cancelled);
    }

    #[tokio::test]
    async fn emits_attempt_and_exhausted_events() {
        let policy = no_jitter(RetryPolicy::default().max_retries(2).delay(TimeAmount::millis(10)));
        let sink = MemorySink::new();
        let executor = RetryExecutor::new(&policy, OperationId::from("test"), sink.clone())
            .with_sleeper(Arc::new(InstantSleeper));
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = run(&executor, &calls, |_| Err(FaultError::Inner(TestError("Down")))).await;

        let events: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            PolicyEvent::Retry(RetryEvent::Attempt { attempt: 1, delay: Duration::from_millis(10) })
        );
        assert!(matches!(
            events[2],
            PolicyEvent::Retry(RetryEvent::Exhausted { total_attempts: 3, .. })
        ));
    }
}
