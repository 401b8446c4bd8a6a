//! Declarative policy model.
//!
//! A [`GuardedOperationPolicy`] is an immutable value describing which fault-tolerance
//! strategies guard an operation and with which parameters. Defaults mirror the
//! annotation defaults of the declarative fault-tolerance model this crate implements
//! (e.g. 3 retries, 1 s timeout, 20-call breaker window at 50 % failures).
//!
//! Every parameter also has a textual field name (`maxRetries`, `delayUnit`, …) so it
//! can be overridden at runtime through [`crate::PolicyRegistry::override_field`] and
//! rendered for dashboards with [`GuardedOperationPolicy::parameters`].
//!
//! ```
//! use faultline::policy::{GuardedOperationPolicy, RetryPolicy, TimeAmount, TimeoutPolicy};
//!
//! let policy = GuardedOperationPolicy::new()
//!     .with_retry(RetryPolicy::default().max_retries(5).delay(TimeAmount::millis(100)))
//!     .with_timeout(TimeoutPolicy::new(TimeAmount::millis(250)));
//! assert!(policy.validate().is_ok());
//! ```

use crate::category::CategorySet;
use crate::error::PolicyError;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable identifier of a guarded operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OperationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for OperationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Time unit of a [`TimeAmount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimeUnit {
    Nanos,
    Micros,
    Millis,
    Seconds,
    Minutes,
    Hours,
    HalfDays,
    Days,
}

impl TimeUnit {
    fn nanos(self) -> u128 {
        match self {
            TimeUnit::Nanos => 1,
            TimeUnit::Micros => 1_000,
            TimeUnit::Millis => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60 * 1_000_000_000,
            TimeUnit::Hours => 3_600 * 1_000_000_000,
            TimeUnit::HalfDays => 12 * 3_600 * 1_000_000_000,
            TimeUnit::Days => 24 * 3_600 * 1_000_000_000,
        }
    }

    /// Canonical upper-case name (`MILLIS`, `SECONDS`, …).
    pub fn name(self) -> &'static str {
        match self {
            TimeUnit::Nanos => "NANOS",
            TimeUnit::Micros => "MICROS",
            TimeUnit::Millis => "MILLIS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
            TimeUnit::HalfDays => "HALF_DAYS",
            TimeUnit::Days => "DAYS",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    /// Accepts canonical names in any case plus the usual short forms (`ms`, `s`, …).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NANOS" | "NS" => Ok(TimeUnit::Nanos),
            "MICROS" | "US" => Ok(TimeUnit::Micros),
            "MILLIS" | "MS" => Ok(TimeUnit::Millis),
            "SECONDS" | "S" => Ok(TimeUnit::Seconds),
            "MINUTES" | "MIN" => Ok(TimeUnit::Minutes),
            "HOURS" | "H" => Ok(TimeUnit::Hours),
            "HALF_DAYS" => Ok(TimeUnit::HalfDays),
            "DAYS" | "D" => Ok(TimeUnit::Days),
            _ => Err(format!("unknown time unit '{}'", raw.trim())),
        }
    }
}

/// A duration expressed as value + unit, the way policies declare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeAmount {
    pub value: u64,
    pub unit: TimeUnit,
}

impl TimeAmount {
    pub const ZERO: TimeAmount = TimeAmount::millis(0);

    pub const fn new(value: u64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    pub const fn millis(value: u64) -> Self {
        Self::new(value, TimeUnit::Millis)
    }

    pub const fn seconds(value: u64) -> Self {
        Self::new(value, TimeUnit::Seconds)
    }

    /// Convert to a `Duration`, saturating at `u64::MAX` nanoseconds.
    pub fn to_duration(self) -> Duration {
        let nanos = u128::from(self.value).saturating_mul(self.unit.nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub fn is_zero(self) -> bool {
        self.value == 0
    }
}

impl From<Duration> for TimeAmount {
    fn from(duration: Duration) -> Self {
        let nanos = duration.as_nanos();
        if nanos % 1_000_000 == 0 {
            TimeAmount::millis(u64::try_from(nanos / 1_000_000).unwrap_or(u64::MAX))
        } else {
            TimeAmount::new(u64::try_from(nanos).unwrap_or(u64::MAX), TimeUnit::Nanos)
        }
    }
}

impl fmt::Display for TimeAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// The five strategy kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PolicyKind {
    Retry,
    Timeout,
    CircuitBreaker,
    Bulkhead,
    Fallback,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 5] = [
        PolicyKind::Retry,
        PolicyKind::Timeout,
        PolicyKind::CircuitBreaker,
        PolicyKind::Bulkhead,
        PolicyKind::Fallback,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Retry => "Retry",
            PolicyKind::Timeout => "Timeout",
            PolicyKind::CircuitBreaker => "CircuitBreaker",
            PolicyKind::Bulkhead => "Bulkhead",
            PolicyKind::Fallback => "Fallback",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = PolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        PolicyKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| PolicyError::UnknownKind(raw.trim().to_string()))
    }
}

/// Delay progression between retries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BackoffPolicy {
    /// Constant `delay` between attempts.
    None,
    /// `delay * factor^(n-1)`, capped at `max_delay`.
    Exponential { factor: u32, max_delay: TimeAmount },
    /// `delay * (1, 2, 3, 5, 8, ...)`, capped at `max_delay`.
    Fibonacci { max_delay: TimeAmount },
    /// A strategy registered on the engine under `name`.
    Custom { name: String },
}

impl BackoffPolicy {
    pub fn exponential() -> Self {
        BackoffPolicy::Exponential { factor: 2, max_delay: TimeAmount::new(1, TimeUnit::Minutes) }
    }

    pub fn fibonacci() -> Self {
        BackoffPolicy::Fibonacci { max_delay: TimeAmount::new(1, TimeUnit::Minutes) }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        BackoffPolicy::Custom { name: name.into() }
    }

    fn label(&self) -> String {
        match self {
            BackoffPolicy::None => "none".into(),
            BackoffPolicy::Exponential { .. } => "exponential".into(),
            BackoffPolicy::Fibonacci { .. } => "fibonacci".into(),
            BackoffPolicy::Custom { name } => format!("custom:{}", name),
        }
    }

    fn parse(raw: &str) -> Result<Self, PolicyError> {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "none" | "constant" => Ok(BackoffPolicy::None),
            "exponential" => Ok(BackoffPolicy::exponential()),
            "fibonacci" => Ok(BackoffPolicy::fibonacci()),
            _ => match raw.strip_prefix("custom:") {
                Some(name) if !name.trim().is_empty() => Ok(BackoffPolicy::custom(name.trim())),
                _ => Err(invalid(
                    PolicyKind::Retry,
                    "backoff",
                    format!("expected none, exponential, fibonacci or custom:<name>, got '{}'", raw),
                )),
            },
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::None
    }
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RetryPolicy {
    /// Retries after the initial attempt; 0 means a single attempt.
    pub max_retries: u32,
    pub delay: TimeAmount,
    /// Budget for the whole retry loop; zero disables the budget.
    pub max_duration: TimeAmount,
    /// Bound of the uniform random offset added to each delay; zero disables jitter.
    pub jitter: TimeAmount,
    pub retry_on: CategorySet,
    /// Wins over `retry_on`.
    pub abort_on: CategorySet,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: TimeAmount::millis(0),
            max_duration: TimeAmount::millis(180_000),
            jitter: TimeAmount::millis(200),
            retry_on: CategorySet::any(),
            abort_on: CategorySet::none(),
            backoff: BackoffPolicy::None,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn delay(mut self, delay: impl Into<TimeAmount>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn max_duration(mut self, max_duration: impl Into<TimeAmount>) -> Self {
        self.max_duration = max_duration.into();
        self
    }

    pub fn jitter(mut self, jitter: impl Into<TimeAmount>) -> Self {
        self.jitter = jitter.into();
        self
    }

    pub fn retry_on(mut self, categories: CategorySet) -> Self {
        self.retry_on = categories;
        self
    }

    pub fn abort_on(mut self, categories: CategorySet) -> Self {
        self.abort_on = categories;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let kind = PolicyKind::Retry;
        if !self.max_duration.is_zero()
            && self.max_duration.to_duration() <= self.delay.to_duration()
        {
            return Err(invalid(kind, "maxDuration", "must be greater than delay"));
        }
        match &self.backoff {
            BackoffPolicy::Exponential { factor, .. } if *factor == 0 => {
                Err(invalid(kind, "factor", "must be at least 1"))
            }
            BackoffPolicy::Custom { name } if name.trim().is_empty() => {
                Err(invalid(kind, "backoff", "custom backoff needs a name"))
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, field: &str, raw: &str) -> Result<(), PolicyError> {
        let kind = PolicyKind::Retry;
        match field {
            "maxRetries" => self.max_retries = parse_value(kind, "maxRetries", raw)?,
            "delay" => self.delay.value = parse_value(kind, "delay", raw)?,
            "delayUnit" => self.delay.unit = parse_unit(kind, "delayUnit", raw)?,
            "maxDuration" => self.max_duration.value = parse_value(kind, "maxDuration", raw)?,
            "durationUnit" => self.max_duration.unit = parse_unit(kind, "durationUnit", raw)?,
            "jitter" => self.jitter.value = parse_value(kind, "jitter", raw)?,
            "jitterDelayUnit" => self.jitter.unit = parse_unit(kind, "jitterDelayUnit", raw)?,
            "retryOn" => self.retry_on = parse_categories(raw),
            "abortOn" => self.abort_on = parse_categories(raw),
            "backoff" => {
                let backoff = BackoffPolicy::parse(raw)?;
                // Naming the declared kind again keeps its factor and max delay.
                if std::mem::discriminant(&backoff) != std::mem::discriminant(&self.backoff)
                    || matches!(backoff, BackoffPolicy::Custom { .. })
                {
                    self.backoff = backoff;
                }
            }
            "factor" => match &mut self.backoff {
                BackoffPolicy::Exponential { factor, .. } => {
                    *factor = parse_value(kind, "factor", raw)?
                }
                _ => return Err(invalid(kind, "factor", "requires exponential backoff")),
            },
            "maxDelay" => match &mut self.backoff {
                BackoffPolicy::Exponential { max_delay, .. }
                | BackoffPolicy::Fibonacci { max_delay } => {
                    max_delay.value = parse_value(kind, "maxDelay", raw)?
                }
                _ => return Err(invalid(kind, "maxDelay", "requires exponential or fibonacci backoff")),
            },
            "maxDelayUnit" => match &mut self.backoff {
                BackoffPolicy::Exponential { max_delay, .. }
                | BackoffPolicy::Fibonacci { max_delay } => {
                    max_delay.unit = parse_unit(kind, "maxDelayUnit", raw)?
                }
                _ => {
                    return Err(invalid(
                        kind,
                        "maxDelayUnit",
                        "requires exponential or fibonacci backoff",
                    ))
                }
            },
            other => return Err(PolicyError::UnknownField { kind, field: other.to_string() }),
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("maxRetries", self.max_retries.to_string()),
            ("delay", self.delay.value.to_string()),
            ("delayUnit", self.delay.unit.to_string()),
            ("maxDuration", self.max_duration.value.to_string()),
            ("durationUnit", self.max_duration.unit.to_string()),
            ("jitter", self.jitter.value.to_string()),
            ("jitterDelayUnit", self.jitter.unit.to_string()),
            ("retryOn", self.retry_on.to_string()),
            ("abortOn", self.abort_on.to_string()),
            ("backoff", self.backoff.label()),
        ];
        match &self.backoff {
            BackoffPolicy::Exponential { factor, max_delay } => {
                params.push(("factor", factor.to_string()));
                params.push(("maxDelay", max_delay.value.to_string()));
                params.push(("maxDelayUnit", max_delay.unit.to_string()));
            }
            BackoffPolicy::Fibonacci { max_delay } => {
                params.push(("maxDelay", max_delay.value.to_string()));
                params.push(("maxDelayUnit", max_delay.unit.to_string()));
            }
            BackoffPolicy::None | BackoffPolicy::Custom { .. } => {}
        }
        params
    }
}

/// Per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeoutPolicy {
    pub duration: TimeAmount,
}

impl TimeoutPolicy {
    pub fn new(duration: impl Into<TimeAmount>) -> Self {
        Self { duration: duration.into() }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.duration.to_duration().is_zero() {
            return Err(invalid(PolicyKind::Timeout, "value", "must be greater than zero"));
        }
        Ok(())
    }

    fn apply(&mut self, field: &str, raw: &str) -> Result<(), PolicyError> {
        let kind = PolicyKind::Timeout;
        match field {
            "value" => self.duration.value = parse_value(kind, "value", raw)?,
            "unit" => self.duration.unit = parse_unit(kind, "unit", raw)?,
            other => return Err(PolicyError::UnknownField { kind, field: other.to_string() }),
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![("value", self.duration.value.to_string()), ("unit", self.duration.unit.to_string())]
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(TimeAmount::millis(1_000))
    }
}

/// How retries and the circuit breaker interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BreakerSampling {
    /// One admission check and one sample per invocation, covering all of its retries.
    #[default]
    PerInvocation,
    /// Every attempt is admitted and sampled individually.
    PerAttempt,
}

impl BreakerSampling {
    fn label(self) -> &'static str {
        match self {
            BreakerSampling::PerInvocation => "invocation",
            BreakerSampling::PerAttempt => "attempt",
        }
    }
}

/// Circuit breaker policy.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CircuitBreakerPolicy {
    /// How long the breaker stays open before probing.
    pub delay: TimeAmount,
    /// Rolling window size and minimum samples before the ratio is evaluated.
    pub request_volume_threshold: u32,
    pub failure_ratio: f64,
    /// Consecutive successful probes needed to close from half-open.
    pub success_threshold: u32,
    pub fail_on: CategorySet,
    pub skip_on: CategorySet,
    pub sampling: BreakerSampling,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            delay: TimeAmount::millis(5_000),
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            success_threshold: 1,
            fail_on: CategorySet::any(),
            skip_on: CategorySet::none(),
            sampling: BreakerSampling::PerInvocation,
        }
    }
}

impl CircuitBreakerPolicy {
    pub fn delay(mut self, delay: impl Into<TimeAmount>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn request_volume_threshold(mut self, threshold: u32) -> Self {
        self.request_volume_threshold = threshold;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn fail_on(mut self, categories: CategorySet) -> Self {
        self.fail_on = categories;
        self
    }

    pub fn skip_on(mut self, categories: CategorySet) -> Self {
        self.skip_on = categories;
        self
    }

    pub fn sampling(mut self, sampling: BreakerSampling) -> Self {
        self.sampling = sampling;
        self
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let kind = PolicyKind::CircuitBreaker;
        if self.request_volume_threshold == 0 {
            return Err(invalid(kind, "requestVolumeThreshold", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(invalid(kind, "failureRatio", "must be within [0, 1]"));
        }
        if self.success_threshold == 0 {
            return Err(invalid(kind, "successThreshold", "must be at least 1"));
        }
        Ok(())
    }

    fn apply(&mut self, field: &str, raw: &str) -> Result<(), PolicyError> {
        let kind = PolicyKind::CircuitBreaker;
        match field {
            "delay" => self.delay.value = parse_value(kind, "delay", raw)?,
            "delayUnit" => self.delay.unit = parse_unit(kind, "delayUnit", raw)?,
            "requestVolumeThreshold" => {
                self.request_volume_threshold = parse_value(kind, "requestVolumeThreshold", raw)?
            }
            "failureRatio" => self.failure_ratio = parse_value(kind, "failureRatio", raw)?,
            "successThreshold" => {
                self.success_threshold = parse_value(kind, "successThreshold", raw)?
            }
            "failOn" => self.fail_on = parse_categories(raw),
            "skipOn" => self.skip_on = parse_categories(raw),
            "sampling" => {
                self.sampling = match raw.trim().to_ascii_lowercase().as_str() {
                    "invocation" => BreakerSampling::PerInvocation,
                    "attempt" => BreakerSampling::PerAttempt,
                    _ => {
                        return Err(invalid(kind, "sampling", "expected 'invocation' or 'attempt'"))
                    }
                }
            }
            other => return Err(PolicyError::UnknownField { kind, field: other.to_string() }),
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("delay", self.delay.value.to_string()),
            ("delayUnit", self.delay.unit.to_string()),
            ("requestVolumeThreshold", self.request_volume_threshold.to_string()),
            ("failureRatio", self.failure_ratio.to_string()),
            ("successThreshold", self.success_threshold.to_string()),
            ("failOn", self.fail_on.to_string()),
            ("skipOn", self.skip_on.to_string()),
            ("sampling", self.sampling.label().to_string()),
        ]
    }
}

/// Bulkhead policy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BulkheadPolicy {
    pub max_concurrent: u32,
    /// Callers allowed to wait for a slot; 0 rejects as soon as every slot is busy.
    pub waiting_queue_size: u32,
}

impl Default for BulkheadPolicy {
    fn default() -> Self {
        Self { max_concurrent: 10, waiting_queue_size: 10 }
    }
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: u32, waiting_queue_size: u32) -> Self {
        Self { max_concurrent, waiting_queue_size }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.max_concurrent == 0 {
            return Err(invalid(PolicyKind::Bulkhead, "value", "must be at least 1"));
        }
        Ok(())
    }

    fn apply(&mut self, field: &str, raw: &str) -> Result<(), PolicyError> {
        let kind = PolicyKind::Bulkhead;
        match field {
            "value" => self.max_concurrent = parse_value(kind, "value", raw)?,
            "waitingTaskQueue" => {
                self.waiting_queue_size = parse_value(kind, "waitingTaskQueue", raw)?
            }
            other => return Err(PolicyError::UnknownField { kind, field: other.to_string() }),
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("value", self.max_concurrent.to_string()),
            ("waitingTaskQueue", self.waiting_queue_size.to_string()),
        ]
    }
}

/// Fallback policy; `handler` names a handler registered on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FallbackPolicy {
    pub handler: String,
    /// Empty means every category.
    pub apply_on: CategorySet,
    pub skip_on: CategorySet,
}

impl FallbackPolicy {
    pub fn new(handler: impl Into<String>) -> Self {
        Self { handler: handler.into(), apply_on: CategorySet::any(), skip_on: CategorySet::none() }
    }

    pub fn apply_on(mut self, categories: CategorySet) -> Self {
        self.apply_on = categories;
        self
    }

    pub fn skip_on(mut self, categories: CategorySet) -> Self {
        self.skip_on = categories;
        self
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.handler.trim().is_empty() {
            return Err(invalid(PolicyKind::Fallback, "fallbackMethod", "must not be empty"));
        }
        Ok(())
    }

    fn apply(&mut self, field: &str, raw: &str) -> Result<(), PolicyError> {
        let kind = PolicyKind::Fallback;
        match field {
            "fallbackMethod" => self.handler = raw.trim().to_string(),
            "applyOn" => self.apply_on = parse_categories(raw),
            "skipOn" => self.skip_on = parse_categories(raw),
            other => return Err(PolicyError::UnknownField { kind, field: other.to_string() }),
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("fallbackMethod", self.handler.clone()),
            ("applyOn", self.apply_on.to_string()),
            ("skipOn", self.skip_on.to_string()),
        ]
    }
}

/// Resolved set of strategies guarding one operation.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GuardedOperationPolicy {
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<TimeoutPolicy>,
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    pub bulkhead: Option<BulkheadPolicy>,
    pub fallback: Option<FallbackPolicy>,
}

impl GuardedOperationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: BulkheadPolicy) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Check every declared sub-policy's invariants.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if let Some(p) = &self.retry {
            p.validate()?;
        }
        if let Some(p) = &self.timeout {
            p.validate()?;
        }
        if let Some(p) = &self.circuit_breaker {
            p.validate()?;
        }
        if let Some(p) = &self.bulkhead {
            p.validate()?;
        }
        if let Some(p) = &self.fallback {
            p.validate()?;
        }
        Ok(())
    }

    pub fn declares(&self, kind: PolicyKind) -> bool {
        match kind {
            PolicyKind::Retry => self.retry.is_some(),
            PolicyKind::Timeout => self.timeout.is_some(),
            PolicyKind::CircuitBreaker => self.circuit_breaker.is_some(),
            PolicyKind::Bulkhead => self.bulkhead.is_some(),
            PolicyKind::Fallback => self.fallback.is_some(),
        }
    }

    /// Declared strategy kinds in pipeline order.
    pub fn strategies(&self) -> Vec<PolicyKind> {
        PolicyKind::ALL.into_iter().filter(|kind| self.declares(*kind)).collect()
    }

    /// Current parameters of one strategy as `(fieldName, value)` pairs; empty if the
    /// strategy is not declared.
    pub fn parameters(&self, kind: PolicyKind) -> Vec<(&'static str, String)> {
        match kind {
            PolicyKind::Retry => self.retry.as_ref().map(RetryPolicy::parameters),
            PolicyKind::Timeout => self.timeout.as_ref().map(TimeoutPolicy::parameters),
            PolicyKind::CircuitBreaker => {
                self.circuit_breaker.as_ref().map(CircuitBreakerPolicy::parameters)
            }
            PolicyKind::Bulkhead => self.bulkhead.as_ref().map(BulkheadPolicy::parameters),
            PolicyKind::Fallback => self.fallback.as_ref().map(FallbackPolicy::parameters),
        }
        .unwrap_or_default()
    }

    /// Apply one textual field override in place. `enabled=false` removes the strategy.
    pub(crate) fn apply_field(
        &mut self,
        operation: &OperationId,
        kind: PolicyKind,
        field: &str,
        raw: &str,
    ) -> Result<(), PolicyError> {
        if !self.declares(kind) {
            return Err(PolicyError::NotDeclared { operation: operation.clone(), kind });
        }
        if field == "enabled" {
            let enabled: bool = parse_value(kind, "enabled", raw)?;
            if !enabled {
                self.remove(kind);
            }
            return Ok(());
        }
        match kind {
            PolicyKind::Retry => self.retry.as_mut().map(|p| p.apply(field, raw)),
            PolicyKind::Timeout => self.timeout.as_mut().map(|p| p.apply(field, raw)),
            PolicyKind::CircuitBreaker => {
                self.circuit_breaker.as_mut().map(|p| p.apply(field, raw))
            }
            PolicyKind::Bulkhead => self.bulkhead.as_mut().map(|p| p.apply(field, raw)),
            PolicyKind::Fallback => self.fallback.as_mut().map(|p| p.apply(field, raw)),
        }
        .unwrap_or(Ok(()))
    }

    fn remove(&mut self, kind: PolicyKind) {
        match kind {
            PolicyKind::Retry => self.retry = None,
            PolicyKind::Timeout => self.timeout = None,
            PolicyKind::CircuitBreaker => self.circuit_breaker = None,
            PolicyKind::Bulkhead => self.bulkhead = None,
            PolicyKind::Fallback => self.fallback = None,
        }
    }
}

fn invalid(kind: PolicyKind, field: &'static str, reason: impl Into<String>) -> PolicyError {
    PolicyError::InvalidField { kind, field, reason: reason.into() }
}

fn parse_value<T>(kind: PolicyKind, field: &'static str, raw: &str) -> Result<T, PolicyError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(kind, field, format!("'{}': {}", raw.trim(), e)))
}

fn parse_unit(kind: PolicyKind, field: &'static str, raw: &str) -> Result<TimeUnit, PolicyError> {
    raw.parse().map_err(|reason: String| invalid(kind, field, reason))
}

fn parse_categories(raw: &str) -> CategorySet {
    match raw.parse() {
        Ok(set) => set,
        Err(never) => match never {},
    }
}
