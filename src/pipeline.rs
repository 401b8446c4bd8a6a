//! Invocation pipeline: the [`FaultTolerance`] engine.
//!
//! Every call of [`FaultTolerance::invoke`] runs the strategies of the operation's resolved
//! policy in a fixed order:
//!
//! ```text
//! resolve
//!   → bulkhead admission (queue or reject)
//!     → circuit breaker admission            (per-invocation sampling)
//!       → retry executor
//!         → [circuit breaker admission]      (per-attempt sampling)
//!           → timeout governor → body
//!         → [circuit breaker records]        (per-attempt sampling)
//!     → circuit breaker records one sample   (per-invocation sampling)
//!   → fallback on terminal failure
//! → bulkhead slot released
//! ```
//!
//! Per-operation state (breaker, bulkhead, counters) is created on first invocation and
//! lives in a sharded map, so operations never contend with each other. Slots, probes and
//! queue places are released by `Drop` on every exit path, including cancellation and
//! dropping the invocation future.
//!
//! ```rust
//! use faultline::prelude::*;
//!
//! #[derive(Debug)]
//! struct Unavailable;
//! impl Categorized for Unavailable {
//!     fn category(&self) -> FailureCategory { FailureCategory::from_static("Unavailable") }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = FaultTolerance::new();
//! engine
//!     .register_policy(
//!         "greeter/hello",
//!         GuardedOperationPolicy::new()
//!             .with_retry(RetryPolicy::default().max_retries(2).jitter(TimeAmount::ZERO))
//!             .with_fallback(FallbackPolicy::new("cached")),
//!     )
//!     .unwrap();
//! engine.register_fallback(
//!     "cached",
//!     fallback_fn(|name: String, _: FaultError<Unavailable>| async move {
//!         Ok::<_, Unavailable>(format!("hello {} (cached)", name))
//!     }),
//! );
//!
//! let greeting = engine
//!     .invoke("greeter/hello", "ada".to_string(), |_name: String, _attempt: Attempt| async {
//!         Err::<String, _>(Unavailable)
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(greeting, "hello ada (cached)");
//! # });
//! ```

use crate::backoff::{Backoff, BackoffStrategy};
use crate::bulkhead::{Admission, Bulkhead, BulkheadPermit};
use crate::category::Categorized;
use crate::circuit_breaker::{counts_as_failure, BreakerPermit, CircuitBreaker, CircuitState, Transition};
use crate::clock::{Clock, MonotonicClock};
use crate::config::parse_overrides;
use crate::error::{FaultError, PolicyError};
use crate::fallback::{self, FallbackHandler, FallbackRegistry};
use crate::metrics::{MetricsSnapshot, OperationMetrics};
use crate::policy::{
    BackoffPolicy, BreakerSampling, BulkheadPolicy, CircuitBreakerPolicy, FallbackPolicy,
    GuardedOperationPolicy, OperationId, PolicyKind,
};
use crate::registry::PolicyRegistry;
use crate::retry::{RetryExecutor, RetryStop};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    emit_best_effort, BulkheadEvent, CircuitBreakerEvent, FallbackEvent, FaultEvent, NullSink,
    PolicyEvent, RequestOutcome, TelemetrySink, TimeoutEvent,
};
use crate::timeout::TimeoutGovernor;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Context handed to the body for each attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    number: usize,
    cancellation: CancellationToken,
}

impl Attempt {
    /// 1 for the initial attempt, 2 for the first retry, ...
    pub fn number(&self) -> usize {
        self.number
    }

    /// Cancelled when the attempt times out or the caller cancels the invocation.
    ///
    /// Bodies that hand work to other tasks should pass this along and check it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Dashboard view of one registered operation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub policy: GuardedOperationPolicy,
    /// `Closed` until the operation is first invoked.
    pub circuit_state: CircuitState,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
struct OperationState {
    breaker: CircuitBreaker,
    bulkhead: Mutex<Option<Arc<Bulkhead>>>,
    metrics: OperationMetrics,
}

/// One invocation's borrowed context.
struct Invocation<'a, I, F> {
    id: &'a OperationId,
    policy: &'a GuardedOperationPolicy,
    state: &'a OperationState,
    input: &'a I,
    body: &'a F,
    cancel: &'a CancellationToken,
}

/// Fault-tolerance engine: registered policies plus the per-operation state that
/// enforces them.
pub struct FaultTolerance<S = NullSink> {
    registry: PolicyRegistry,
    states: DashMap<OperationId, Arc<OperationState>>,
    fallbacks: FallbackRegistry,
    backoffs: DashMap<String, Arc<dyn BackoffStrategy>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl<S> fmt::Debug for FaultTolerance<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultTolerance")
            .field("registry", &self.registry)
            .field("active_operations", &self.states.len())
            .field("fallbacks", &self.fallbacks)
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .finish_non_exhaustive()
    }
}

impl FaultTolerance<NullSink> {
    /// Engine with tokio timers, a monotonic clock and no telemetry.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FaultToleranceBuilder<NullSink> {
        FaultToleranceBuilder::new()
    }
}

impl Default for FaultTolerance<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`FaultTolerance`].
pub struct FaultToleranceBuilder<S> {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl FaultToleranceBuilder<NullSink> {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
        }
    }
}

impl Default for FaultToleranceBuilder<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> FaultToleranceBuilder<S> {
    /// Clock for breaker delays and retry budgets.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper for retry backoff.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Telemetry sink receiving every policy event.
    pub fn sink<S2>(self, sink: S2) -> FaultToleranceBuilder<S2>
    where
        S2: TelemetrySink,
    {
        FaultToleranceBuilder { clock: self.clock, sleeper: self.sleeper, sink }
    }

    pub fn build(self) -> FaultTolerance<S> {
        FaultTolerance {
            registry: PolicyRegistry::new(),
            states: DashMap::new(),
            fallbacks: FallbackRegistry::new(),
            backoffs: DashMap::new(),
            clock: self.clock,
            sleeper: self.sleeper,
            sink: self.sink,
        }
    }
}

impl<S> FaultTolerance<S>
where
    S: TelemetrySink,
{
    /// Register (or replace) the declared policy of an operation.
    pub fn register_policy(
        &self,
        operation: impl Into<OperationId>,
        policy: GuardedOperationPolicy,
    ) -> Result<(), PolicyError> {
        self.registry.register(operation, policy).map(|_| ())
    }

    /// Override one field of one declared strategy; see [`PolicyRegistry::override_field`].
    pub fn override_policy_field(
        &self,
        operation: &str,
        kind: PolicyKind,
        field: &str,
        value: &str,
    ) -> Result<(), PolicyError> {
        self.registry.override_field(operation, kind, field, value).map(|_| ())
    }

    /// Apply `operationId/Kind/field=value` lines.
    ///
    /// The whole text is parsed before anything is applied. Lines are then applied in
    /// order; the first rejected line stops the batch and earlier lines stay applied.
    /// Returns the number of overrides applied.
    pub fn apply_overrides(&self, text: &str) -> Result<usize, PolicyError> {
        let overrides = parse_overrides(text)?;
        for (key, value) in &overrides {
            self.registry.override_field(key.operation.as_str(), key.kind, &key.field, value)?;
        }
        Ok(overrides.len())
    }

    /// Registered operations sorted by id.
    pub fn list_operations(&self) -> Vec<OperationSnapshot> {
        self.registry
            .operations()
            .into_iter()
            .map(|(id, policy)| {
                let state = self.states.get(&id).map(|state| state.value().clone());
                OperationSnapshot {
                    circuit_state: state
                        .as_ref()
                        .map_or(CircuitState::Closed, |state| state.breaker.state()),
                    metrics: state.map(|state| state.metrics.snapshot()).unwrap_or_default(),
                    policy: (*policy).clone(),
                    id,
                }
            })
            .collect()
    }

    /// Register the fallback handler `name`, for one `(input, output, error)` type triple.
    pub fn register_fallback<I, T, E, H>(&self, name: impl Into<String>, handler: H)
    where
        H: FallbackHandler<I, T, E> + 'static,
        I: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.fallbacks.register(name, handler);
    }

    /// Register the backoff strategy named by `BackoffPolicy::Custom`.
    pub fn register_backoff(&self, name: impl Into<String>, strategy: impl BackoffStrategy + 'static) {
        self.backoffs.insert(name.into(), Arc::new(strategy));
    }

    /// Force an operation's breaker back to closed.
    pub fn reset_circuit_breaker(&self, operation: &str) -> Result<(), PolicyError> {
        self.registry.resolve(operation)?;
        if let Some(state) = self.states.get(operation) {
            state.breaker.reset();
        }
        Ok(())
    }

    /// Current breaker state; `None` for unknown operations.
    pub fn circuit_state(&self, operation: &str) -> Option<CircuitState> {
        self.registry.resolve(operation).ok()?;
        Some(self.states.get(operation).map_or(CircuitState::Closed, |s| s.breaker.state()))
    }

    pub fn metrics(&self, operation: &str) -> Option<MetricsSnapshot> {
        self.registry.resolve(operation).ok()?;
        Some(self.states.get(operation).map(|s| s.metrics.snapshot()).unwrap_or_default())
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Invoke `body` under the operation's policy.
    ///
    /// `body` is called once per attempt with a clone of `input`; the original input goes
    /// to the fallback handler.
    pub async fn invoke<I, T, E, F, Fut>(
        &self,
        operation: &str,
        input: I,
        body: F,
    ) -> Result<T, FaultError<E>>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        E: Categorized + Send + 'static,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_with_cancel(operation, input, body, &CancellationToken::new()).await
    }

    /// [`FaultTolerance::invoke`] that also stops when `cancel` fires.
    ///
    /// Cancellation interrupts bulkhead queueing, backoff sleeps and running attempts. A
    /// cancelled invocation returns [`FaultError::Cancelled`], skips the fallback and leaves
    /// no circuit breaker sample.
    pub async fn invoke_with_cancel<I, T, E, F, Fut>(
        &self,
        operation: &str,
        input: I,
        body: F,
        cancel: &CancellationToken,
    ) -> Result<T, FaultError<E>>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        E: Categorized + Send + 'static,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let (id, policy) = match self.registry.resolve(operation) {
            Ok(policy) => (OperationId::from(operation), policy),
            Err(_) => {
                tracing::debug!(operation, "invocation of unregistered operation");
                return Err(FaultError::UnknownOperation { operation: OperationId::from(operation) });
            }
        };
        let state = self.state(&id);
        state.metrics.invocation();

        let result = self.run(&id, &policy, &state, input, &body, cancel).await;

        let duration = started.elapsed();
        let outcome = match &result {
            Ok(_) => {
                state.metrics.success();
                RequestOutcome::Success { duration }
            }
            Err(FaultError::Cancelled) => {
                state.metrics.cancelled();
                RequestOutcome::Cancelled { duration }
            }
            Err(_) => {
                state.metrics.failure();
                RequestOutcome::Failure { duration }
            }
        };
        self.emit(&id, outcome).await;
        result
    }

    fn state(&self, id: &OperationId) -> Arc<OperationState> {
        if let Some(state) = self.states.get(id) {
            return state.value().clone();
        }
        self.states
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(OperationState {
                    breaker: CircuitBreaker::new(id.clone(), self.clock.clone()),
                    bulkhead: Mutex::new(None),
                    metrics: OperationMetrics::new(),
                })
            })
            .value()
            .clone()
    }

    async fn run<I, T, E, F, Fut>(
        &self,
        id: &OperationId,
        policy: &GuardedOperationPolicy,
        state: &OperationState,
        input: I,
        body: &F,
        cancel: &CancellationToken,
    ) -> Result<T, FaultError<E>>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        E: Categorized + Send + 'static,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (slot, result) = match &policy.bulkhead {
            Some(bulkhead) => match self.admit(id, state, bulkhead, cancel).await {
                Ok(slot) => (Some(slot), None),
                Err(rejected) => (None, Some(Err(rejected))),
            },
            None => (None, None),
        };
        let result = match result {
            Some(rejected) => rejected,
            None => {
                let invocation = Invocation { id, policy, state, input: &input, body, cancel };
                self.guarded(&invocation).await
            }
        };

        let result = match (result, &policy.fallback) {
            (Err(failure), Some(fallback)) => {
                self.fallback(id, state, fallback, input, failure).await
            }
            (result, _) => result,
        };
        drop(slot);
        result
    }

    async fn admit<E>(
        &self,
        id: &OperationId,
        state: &OperationState,
        policy: &BulkheadPolicy,
        cancel: &CancellationToken,
    ) -> Result<BulkheadPermit, FaultError<E>> {
        let bulkhead = self.bulkhead(id, state, policy);
        let permit = match bulkhead.try_admit() {
            Admission::Admitted(permit) => permit,
            Admission::Queued(ticket) => {
                state.metrics.bulkhead_queued();
                let waiting = bulkhead.waiting();
                tracing::debug!(operation = %id, waiting, "bulkhead full, queueing");
                self.emit(
                    id,
                    BulkheadEvent::Queued {
                        waiting,
                        queue_size: policy.waiting_queue_size as usize,
                    },
                )
                .await;
                ticket.wait(cancel).await.ok_or(FaultError::Cancelled)?
            }
            Admission::Full { in_flight, max, waiting } => {
                state.metrics.bulkhead_rejected();
                tracing::debug!(operation = %id, in_flight, max, waiting, "bulkhead rejected");
                self.emit(
                    id,
                    BulkheadEvent::Rejected { active_count: in_flight, max_concurrency: max, waiting },
                )
                .await;
                return Err(FaultError::BulkheadFull { in_flight, max, waiting });
            }
        };
        self.emit(
            id,
            BulkheadEvent::Acquired {
                active_count: bulkhead.in_flight(),
                max_concurrency: bulkhead.max_concurrent(),
            },
        )
        .await;
        Ok(permit)
    }

    /// The operation's bulkhead, rebuilt when its policy changed.
    fn bulkhead(&self, id: &OperationId, state: &OperationState, policy: &BulkheadPolicy) -> Arc<Bulkhead> {
        let mut current = state.bulkhead.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(bulkhead) if bulkhead.policy() == policy => bulkhead.clone(),
            previous => {
                if previous.is_some() {
                    tracing::debug!(operation = %id, ?policy, "bulkhead policy changed, rebuilding");
                }
                let bulkhead = Arc::new(Bulkhead::new(policy.clone()));
                *current = Some(bulkhead.clone());
                bulkhead
            }
        }
    }

    /// Breaker (per invocation) around the retry loop.
    async fn guarded<I, T, E, F, Fut>(&self, inv: &Invocation<'_, I, F>) -> Result<T, FaultError<E>>
    where
        I: Clone,
        E: Categorized,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = inv
            .policy
            .circuit_breaker
            .as_ref()
            .filter(|breaker| breaker.sampling == BreakerSampling::PerInvocation);
        let Some(breaker) = breaker else {
            return self.attempts(inv).await;
        };

        let permit = self.admit_breaker(inv, breaker).await?;
        let result = self.attempts(inv).await;
        let sample = sample_of(breaker, &result);
        self.record(inv, permit, breaker, sample).await;
        result
    }

    /// Retry loop, or a single attempt without a retry policy.
    async fn attempts<I, T, E, F, Fut>(&self, inv: &Invocation<'_, I, F>) -> Result<T, FaultError<E>>
    where
        I: Clone,
        E: Categorized,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(retry) = &inv.policy.retry else {
            return self.attempt(inv, 1).await;
        };

        let mut executor = RetryExecutor::new(retry, inv.id.clone(), self.sink.clone())
            .with_sleeper(self.sleeper.clone())
            .with_clock(self.clock.clone());
        if let BackoffPolicy::Custom { name } = &retry.backoff {
            let strategy = self.backoffs.get(name).map(|entry| entry.value().clone());
            let Some(backoff) = Backoff::from_policy(retry, strategy) else {
                return Err(FaultError::Misconfigured {
                    operation: inv.id.clone(),
                    reason: format!("backoff strategy '{}' is not registered", name),
                });
            };
            executor = executor.with_backoff(backoff);
        }

        let (result, report) = executor.execute(inv.cancel, move |number| self.attempt(inv, number)).await;
        let metrics = &inv.state.metrics;
        metrics.retried(report.retries);
        match report.stop {
            RetryStop::Aborted => metrics.retries_aborted(),
            RetryStop::MaxRetriesReached | RetryStop::MaxDurationReached => metrics.retries_exhausted(),
            RetryStop::Succeeded | RetryStop::NotRetryable | RetryStop::Cancelled => {}
        }
        result
    }

    /// One attempt: breaker (per attempt) around the timeout governor around the body.
    async fn attempt<I, T, E, F, Fut>(
        &self,
        inv: &Invocation<'_, I, F>,
        number: usize,
    ) -> Result<T, FaultError<E>>
    where
        I: Clone,
        E: Categorized,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = inv
            .policy
            .circuit_breaker
            .as_ref()
            .filter(|breaker| breaker.sampling == BreakerSampling::PerAttempt);
        let Some(breaker) = breaker else {
            return self.call(inv, number).await;
        };

        let permit = self.admit_breaker(inv, breaker).await?;
        let result = self.call(inv, number).await;
        let sample = sample_of(breaker, &result);
        self.record(inv, permit, breaker, sample).await;
        result
    }

    async fn call<I, T, E, F, Fut>(&self, inv: &Invocation<'_, I, F>, number: usize) -> Result<T, FaultError<E>>
    where
        I: Clone,
        F: Fn(I, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = inv.cancel.child_token();
        let attempt = Attempt { number, cancellation: token.clone() };
        let body = async { (inv.body)(inv.input.clone(), attempt).await.map_err(FaultError::Inner) };
        let timed = async {
            match &inv.policy.timeout {
                Some(timeout) => {
                    TimeoutGovernor::new(timeout.duration.to_duration()).execute(&token, body).await
                }
                None => body.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = inv.cancel.cancelled() => Err(FaultError::Cancelled),
            result = timed => result,
        };
        let timed_out = match &result {
            Err(FaultError::Timeout { timeout, .. }) => Some(*timeout),
            _ => None,
        };
        if let Some(timeout) = timed_out {
            inv.state.metrics.timeout();
            tracing::debug!(operation = %inv.id, attempt = number, ?timeout, "attempt timed out");
            self.emit(inv.id, TimeoutEvent::Occurred { attempt: number, timeout }).await;
        }
        result
    }

    async fn admit_breaker<'a, I, F, E>(
        &self,
        inv: &Invocation<'a, I, F>,
        policy: &CircuitBreakerPolicy,
    ) -> Result<BreakerPermit<'a>, FaultError<E>> {
        match inv.state.breaker.try_acquire(policy) {
            Ok(permit) => {
                self.transition(inv, permit.transition()).await;
                Ok(permit)
            }
            Err(rejected) => {
                inv.state.metrics.circuit_rejected();
                self.emit(inv.id, CircuitBreakerEvent::Rejected { retry_after: rejected.retry_after })
                    .await;
                Err(FaultError::CircuitOpen { retry_after: rejected.retry_after })
            }
        }
    }

    /// Record one sample; without one the permit is released unrecorded.
    async fn record<I, F>(
        &self,
        inv: &Invocation<'_, I, F>,
        permit: BreakerPermit<'_>,
        policy: &CircuitBreakerPolicy,
        sample: Option<bool>,
    ) {
        let Some(failed) = sample else {
            return;
        };
        let transition = permit.record(failed, policy);
        self.transition(inv, transition).await;
    }

    async fn transition<I, F>(&self, inv: &Invocation<'_, I, F>, transition: Option<Transition>) {
        let event = match transition {
            None => return,
            Some(Transition::Opened { failures, samples }) => {
                inv.state.metrics.circuit_opened();
                CircuitBreakerEvent::Opened { failures, samples }
            }
            Some(Transition::HalfOpened) => CircuitBreakerEvent::HalfOpen,
            Some(Transition::Closed) => CircuitBreakerEvent::Closed,
        };
        self.emit(inv.id, event).await;
    }

    async fn fallback<I, T, E>(
        &self,
        id: &OperationId,
        state: &OperationState,
        policy: &FallbackPolicy,
        input: I,
        failure: FaultError<E>,
    ) -> Result<T, FaultError<E>>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: Categorized + Send + 'static,
    {
        let category = match failure.category() {
            Some(category) if fallback::applies(policy, Some(&category)) => category,
            _ => return Err(failure),
        };
        let Some(handler) = self.fallbacks.lookup::<I, T, E>(&policy.handler) else {
            tracing::error!(operation = %id, handler = %policy.handler, "fallback handler missing");
            return Err(FaultError::Misconfigured {
                operation: id.clone(),
                reason: format!(
                    "fallback handler '{}' is not registered for this operation's types",
                    policy.handler
                ),
            });
        };

        let handler_name = policy.handler.clone();
        match handler.handle(input, failure).await {
            Ok(value) => {
                state.metrics.fallback_applied();
                tracing::debug!(operation = %id, handler = %handler_name, %category, "fallback applied");
                self.emit(id, FallbackEvent::Applied { handler: handler_name, category }).await;
                Ok(value)
            }
            Err(error) => {
                state.metrics.fallback_failed();
                tracing::warn!(operation = %id, handler = %handler_name, %category, "fallback failed");
                self.emit(id, FallbackEvent::Failed { handler: handler_name, category }).await;
                Err(FaultError::Inner(error))
            }
        }
    }

    async fn emit(&self, id: &OperationId, event: impl Into<PolicyEvent>) {
        emit_best_effort(self.sink.clone(), FaultEvent::new(id.clone(), event)).await;
    }
}

/// Breaker sample of an outcome: `Some(failed)`, or `None` for cancelled outcomes.
fn sample_of<T, E>(policy: &CircuitBreakerPolicy, result: &Result<T, FaultError<E>>) -> Option<bool>
where
    E: Categorized,
{
    match result {
        Ok(_) => Some(false),
        Err(FaultError::Cancelled) => None,
        Err(failure) => Some(counts_as_failure(policy, failure.category().as_ref())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::FailureCategory;
    use crate::policy::{RetryPolicy, TimeAmount, TimeoutPolicy};
    use crate::sleeper::InstantSleeper;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl Categorized for TestError {
        fn category(&self) -> FailureCategory {
            FailureCategory::new(self.0)
        }
    }

    fn engine() -> FaultTolerance<MemorySink> {
        FaultTolerance::builder().sleeper(Arc::new(InstantSleeper)).sink(MemorySink::new()).build()
    }

    #[tokio::test]
    async fn unknown_operation_is_reported() {
        let engine = engine();
        let result = engine.invoke("missing", (), |_: (), _: Attempt| async { Ok::<_, TestError>(1) }).await;
        assert!(matches!(result, Err(FaultError::UnknownOperation { .. })));
    }

    #[tokio::test]
    async fn empty_policy_runs_the_body_once() {
        let engine = engine();
        engine.register_policy("plain", GuardedOperationPolicy::new()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = engine
            .invoke("plain", 20, |input: u32, attempt: Attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, TestError>(input + attempt.number() as u32) }
            })
            .await;
        assert_eq!(result.unwrap(), 21);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics("plain").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn attempts_are_numbered() {
        let engine = engine();
        engine
            .register_policy(
                "numbered",
                GuardedOperationPolicy::new()
                    .with_retry(RetryPolicy::default().max_retries(2).jitter(TimeAmount::ZERO)),
            )
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ = engine
            .invoke("numbered", (), |_: (), attempt: Attempt| {
                seen.lock().unwrap().push(attempt.number());
                async { Err::<(), _>(TestError("Down")) }
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_custom_backoff_is_misconfigured() {
        let engine = engine();
        engine
            .register_policy(
                "custom",
                GuardedOperationPolicy::new()
                    .with_retry(RetryPolicy::default().backoff(BackoffPolicy::custom("linear"))),
            )
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = engine
            .invoke("custom", (), |_: (), _: Attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, TestError>(()) }
            })
            .await;
        assert!(matches!(result, Err(FaultError::Misconfigured { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registered_custom_backoff_is_used() {
        #[derive(Debug)]
        struct Linear;
        impl BackoffStrategy for Linear {
            fn delay(&self, attempt: usize) -> Duration {
                Duration::from_millis(10 * attempt as u64)
            }
        }

        let sleeper = crate::sleeper::TrackingSleeper::new();
        let engine = FaultTolerance::builder().sleeper(Arc::new(sleeper.clone())).build();
        engine.register_backoff("linear", Linear);
        engine
            .register_policy(
                "custom",
                GuardedOperationPolicy::new().with_retry(
                    RetryPolicy::default()
                        .max_retries(3)
                        .jitter(TimeAmount::ZERO)
                        .backoff(BackoffPolicy::custom("linear")),
                ),
            )
            .unwrap();
        let _ = engine.invoke("custom", (), |_: (), _: Attempt| async { Err::<(), _>(TestError("Down")) }).await;
        assert_eq!(sleeper.calls(), [10, 20, 30].map(Duration::from_millis).to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_token_is_cancelled_on_timeout() {
        let engine = engine();
        engine
            .register_policy(
                "slow",
                GuardedOperationPolicy::new().with_timeout(TimeoutPolicy::new(TimeAmount::millis(50))),
            )
            .unwrap();
        let token = Arc::new(Mutex::new(None));
        let result = engine
            .invoke("slow", (), |_: (), attempt: Attempt| {
                *token.lock().unwrap() = Some(attempt.cancellation().clone());
                async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, TestError>(())
                }
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert!(token.lock().unwrap().as_ref().unwrap().is_cancelled());
        assert_eq!(engine.metrics("slow").unwrap().timeouts, 1);
    }

    #[tokio::test]
    async fn emits_request_outcome_last() {
        let sink = MemorySink::new();
        let engine = FaultTolerance::builder().sink(sink.clone()).build();
        engine.register_policy("op", GuardedOperationPolicy::new()).unwrap();
        engine.invoke("op", (), |_: (), _: Attempt| async { Ok::<_, TestError>(()) }).await.unwrap();
        let events = sink.events_for("op");
        assert!(matches!(
            events.last().map(|e| &e.event),
            Some(PolicyEvent::Request(RequestOutcome::Success { .. }))
        ));
    }

    #[tokio::test]
    async fn snapshots_are_sorted_and_closed_before_first_call() {
        let engine = engine();
        engine.register_policy("b", GuardedOperationPolicy::new()).unwrap();
        engine.register_policy("a", GuardedOperationPolicy::new()).unwrap();
        let snapshots = engine.list_operations();
        let ids: Vec<_> = snapshots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(snapshots.iter().all(|s| s.circuit_state == CircuitState::Closed));
        assert!(snapshots.iter().all(|s| s.metrics == MetricsSnapshot::default()));
    }
}
