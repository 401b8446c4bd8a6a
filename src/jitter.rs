//! Jitter applied to retry delays to avoid synchronized retries.
//!
//! A bounded jitter adds a uniform random offset in `[-bound, +bound]` to each delay; the
//! result never goes below zero. Nanosecond precision, saturating on huge durations.
//!
//! ```rust
//! use faultline::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::bounded(Duration::from_millis(200));
//! let delay = jitter.apply(Duration::from_secs(1));
//! assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Uniform offset in `[-bound, +bound]`
    Bounded(Duration),
}

impl Jitter {
    /// Bounded jitter; a zero bound is the same as [`Jitter::None`].
    pub fn bounded(bound: Duration) -> Self {
        if bound.is_zero() {
            Jitter::None
        } else {
            Jitter::Bounded(bound)
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Bounded(bound) => {
                let bound = bound.as_nanos();
                if bound == 0 {
                    return delay;
                }
                let offset = rng.random_range(0..=bound.saturating_mul(2));
                // delay + (offset - bound), clamped at zero
                from_nanos_saturated(delay.as_nanos().saturating_add(offset).saturating_sub(bound))
            }
        }
    }
}

fn from_nanos_saturated(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    match u64::try_from(nanos / NANOS_PER_SEC) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}
