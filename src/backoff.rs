//! Backoff strategies for the retry executor.
//!
//! Constant, exponential (configurable factor) and Fibonacci progressions with optional caps,
//! plus named custom strategies. Attempt semantics: attempt index `0` is the initial call (no
//! delay) and retries start at `attempt = 1`.
//!
//! ```rust
//! use std::time::Duration;
//! use faultline::Backoff;
//!
//! let backoff = Backoff::fibonacci(Duration::from_millis(100))
//!     .with_max(Duration::from_millis(600))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(3), Duration::from_millis(300));
//! assert_eq!(backoff.delay(4), Duration::from_millis(500));
//! assert_eq!(backoff.delay(5), Duration::from_millis(600)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use crate::policy::{BackoffPolicy, RetryPolicy};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxNotSupported,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
    FactorNotSupported,
    FactorMustBePositive,
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxNotSupported => {
                write!(f, "with_max is only valid for exponential or fibonacci backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::FactorNotSupported => {
                write!(f, "with_factor is only valid for exponential backoff")
            }
            BackoffError::FactorMustBePositive => write!(f, "factor must be at least 1"),
        }
    }
}

impl std::error::Error for BackoffError {}

/// Trait implemented by all backoff strategies, including custom ones registered by name.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: usize) -> Duration;
}

fn scaled(base: Duration, multiplier: u128, max: Option<Duration>) -> Duration {
    let nanos = base.as_nanos().saturating_mul(multiplier);
    let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
    max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
}

#[derive(Debug, Clone)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, factor: u32, max: Option<Duration> },
    Fibonacci { base: Duration, max: Option<Duration> },
    Custom(Arc<dyn BackoffStrategy>),
}

impl BackoffStrategy for BackoffKind {
    fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            BackoffKind::Constant { delay } => (*delay).min(MAX_BACKOFF),
            BackoffKind::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                scaled(*base, u128::from(*factor).saturating_pow(exponent), *max)
            }
            BackoffKind::Fibonacci { base, max } => {
                // 1, 2, 3, 5, 8, ... ; u128 saturates long before 256 steps.
                let (mut current, mut next) = (1u128, 2u128);
                for _ in 1..attempt.min(256) {
                    let following = current.saturating_add(next);
                    current = next;
                    next = following;
                }
                scaled(*base, current, *max)
            }
            BackoffKind::Custom(strategy) => strategy.delay(attempt).min(MAX_BACKOFF),
        }
    }
}

/// Backoff strategy used by the retry executor.
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Exponential backoff doubling from `base`; see [`Backoff::with_factor`].
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, factor: 2, max: None } }
    }

    /// `base` scaled by 1, 2, 3, 5, 8, ...
    pub fn fibonacci(base: Duration) -> Self {
        Self { kind: BackoffKind::Fibonacci { base, max: None } }
    }

    /// Delegate to a user strategy.
    pub fn custom(strategy: Arc<dyn BackoffStrategy>) -> Self {
        Self { kind: BackoffKind::Custom(strategy) }
    }

    /// Build the backoff a retry policy describes. `custom` supplies the strategy for
    /// `BackoffPolicy::Custom`; `None` is returned if it is needed and missing.
    pub fn from_policy(
        retry: &RetryPolicy,
        custom: Option<Arc<dyn BackoffStrategy>>,
    ) -> Option<Self> {
        let base = retry.delay.to_duration();
        let kind = match &retry.backoff {
            BackoffPolicy::None => BackoffKind::Constant { delay: base },
            BackoffPolicy::Exponential { factor, max_delay } => BackoffKind::Exponential {
                base,
                factor: *factor,
                max: Some(max_delay.to_duration()),
            },
            BackoffPolicy::Fibonacci { max_delay } => {
                BackoffKind::Fibonacci { base, max: Some(max_delay.to_duration()) }
            }
            BackoffPolicy::Custom { .. } => BackoffKind::Custom(custom?),
        };
        Some(Self { kind })
    }

    /// Set the growth factor of an exponential backoff.
    pub fn with_factor(mut self, factor: u32) -> Result<Self, BackoffError> {
        if factor == 0 {
            return Err(BackoffError::FactorMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { factor: existing, .. } => {
                *existing = factor;
                Ok(self)
            }
            _ => Err(BackoffError::FactorNotSupported),
        }
    }

    /// Cap an exponential or fibonacci backoff.
    /// Returns an error on other strategies, if `max` is zero, or if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing, .. }
            | BackoffKind::Fibonacci { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } | BackoffKind::Custom(_) => {
                Err(BackoffError::MaxNotSupported)
            }
        }
    }

    /// Delay before retry `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.kind.delay(attempt)
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: usize) -> Duration {
        self.kind.delay(attempt)
    }
}
