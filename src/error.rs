//! Error types for guarded invocations and policy configuration.
use crate::category::{Categorized, FailureCategory};
use crate::policy::{OperationId, PolicyKind};
use std::fmt;
use std::time::Duration;

/// Terminal outcome of a failed guarded invocation.
#[derive(Debug, Clone)]
pub enum FaultError<E> {
    /// An attempt exceeded its timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker rejected the call.
    CircuitOpen { retry_after: Duration },
    /// The bulkhead had no free slot and no room in its waiting queue.
    BulkheadFull { in_flight: usize, max: usize, waiting: usize },
    /// Retries were exhausted; `last` is the failure of the final attempt.
    RetryExhausted { attempts: usize, last: Box<FaultError<E>> },
    /// No policy is registered under this identifier.
    UnknownOperation { operation: OperationId },
    /// The caller's cancellation signal fired.
    Cancelled,
    /// The resolved policy references something the engine cannot provide.
    Misconfigured { operation: OperationId, reason: String },
    /// The guarded body (or the fallback handler) failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for FaultError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { retry_after } => {
                write!(f, "circuit breaker open (retry after {:?})", retry_after)
            }
            Self::BulkheadFull { in_flight, max, waiting } => write!(
                f,
                "bulkhead rejected request ({} in-flight, max {}, {} waiting)",
                in_flight, max, waiting
            ),
            Self::RetryExhausted { attempts, last } => {
                write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
            }
            Self::UnknownOperation { operation } => {
                write!(f, "no fault-tolerance policy registered for '{}'", operation)
            }
            Self::Cancelled => write!(f, "invocation cancelled"),
            Self::Misconfigured { operation, reason } => {
                write!(f, "operation '{}' is misconfigured: {}", operation, reason)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FaultError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last, .. } => Some(&**last),
            _ => None,
        }
    }
}

impl<E> FaultError<E> {
    pub(crate) fn retry_exhausted(attempts: usize, last: FaultError<E>) -> Self {
        // Keep the innermost cause when a nested retry already exhausted.
        let last = match last {
            FaultError::RetryExhausted { last, .. } => *last,
            other => other,
        };
        FaultError::RetryExhausted { attempts, last: Box::new(last) }
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to bulkhead rejection
    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if the invocation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The failure of the final attempt for `RetryExhausted`.
    pub fn last_failure(&self) -> Option<&FaultError<E>> {
        match self {
            Self::RetryExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// The body error behind this failure, looking through `RetryExhausted`.
    pub fn root_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last, .. } => last.root_inner(),
            _ => None,
        }
    }

    /// Access timeout details if this is a timeout error.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Access bulkhead capacity info as (in_flight, max, waiting).
    pub fn bulkhead_capacity(&self) -> Option<(usize, usize, usize)> {
        match self {
            Self::BulkheadFull { in_flight, max, waiting } => Some((*in_flight, *max, *waiting)),
            _ => None,
        }
    }

    /// Number of attempts made before retries were exhausted.
    pub fn retry_attempts(&self) -> Option<usize> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl<E: Categorized> FaultError<E> {
    /// Category used by `retry_on`, `fail_on`, `apply_on` and friends.
    ///
    /// `RetryExhausted` classifies as its last failure. Cancellation, unknown operations
    /// and misconfiguration have no category: they are never retried, sampled or handed
    /// to a fallback.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::Timeout { .. } => Some(FailureCategory::TIMEOUT),
            Self::CircuitOpen { .. } => Some(FailureCategory::CIRCUIT_OPEN),
            Self::BulkheadFull { .. } => Some(FailureCategory::BULKHEAD_FULL),
            Self::RetryExhausted { last, .. } => last.category(),
            Self::Inner(e) => Some(e.category()),
            Self::UnknownOperation { .. } | Self::Cancelled | Self::Misconfigured { .. } => None,
        }
    }
}

/// Errors raised while registering, overriding or resolving policies.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// No policy registered under this identifier.
    #[error("no fault-tolerance policy registered for '{0}'")]
    UnknownOperation(OperationId),
    /// Policy kind name not recognised.
    #[error("unknown policy kind '{0}'")]
    UnknownKind(String),
    /// Field name not recognised for the kind.
    #[error("unknown field '{field}' for {kind}")]
    UnknownField { kind: PolicyKind, field: String },
    /// A field value failed to parse or violates the policy's invariants.
    #[error("invalid {kind}/{field}: {reason}")]
    InvalidField { kind: PolicyKind, field: &'static str, reason: String },
    /// Override targets a policy kind the operation does not declare.
    #[error("operation '{operation}' does not declare a {kind} policy")]
    NotDeclared { operation: OperationId, kind: PolicyKind },
    /// A configuration key or line could not be parsed.
    #[error("malformed override '{0}': expected <operation>/<Kind>/<field>=<value>")]
    MalformedOverride(String),
}
