//! Fallback dispatcher: substitute a result when the guarded path fails.
//!
//! Handlers are registered by name on the engine and referenced from a
//! [`FallbackPolicy`](crate::FallbackPolicy). A handler receives the original input and the
//! terminal failure and either produces a substitute value or fails with its own error,
//! which is returned as [`FaultError::Inner`]; fallbacks are never chained.
//!
//! ```rust
//! use faultline::fallback::{fallback_fn, FallbackRegistry};
//! use faultline::FaultError;
//!
//! let registry = FallbackRegistry::new();
//! registry.register(
//!     "cached-greeting",
//!     fallback_fn(|name: String, _failure: FaultError<std::io::Error>| async move {
//!         Ok::<_, std::io::Error>(format!("hello {} (cached)", name))
//!     }),
//! );
//! assert!(registry.contains("cached-greeting"));
//! ```

use crate::category::FailureCategory;
use crate::error::FaultError;
use crate::policy::FallbackPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Produces a substitute result for a failed invocation.
#[async_trait]
pub trait FallbackHandler<I, T, E>: Send + Sync
where
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    async fn handle(&self, input: I, failure: FaultError<E>) -> Result<T, E>;
}

/// Adapter returned by [`fallback_fn`].
#[derive(Clone)]
pub struct FnFallback<F> {
    f: F,
}

impl<F> fmt::Debug for FnFallback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFallback").finish_non_exhaustive()
    }
}

/// Build a [`FallbackHandler`] from an async closure.
pub fn fallback_fn<F>(f: F) -> FnFallback<F> {
    FnFallback { f }
}

#[async_trait]
impl<F, Fut, I, T, E> FallbackHandler<I, T, E> for FnFallback<F>
where
    F: Fn(I, FaultError<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    async fn handle(&self, input: I, failure: FaultError<E>) -> Result<T, E> {
        (self.f)(input, failure).await
    }
}

/// Whether a failure with `category` is handed to the fallback under `policy`.
///
/// Failures without a category (cancellation, misconfiguration) never are.
pub fn applies(policy: &FallbackPolicy, category: Option<&FailureCategory>) -> bool {
    match category {
        None => false,
        Some(category) if policy.skip_on.contains(category) => false,
        Some(category) => policy.apply_on.is_empty() || policy.apply_on.contains(category),
    }
}

/// Named, type-erased fallback handlers.
///
/// Each name maps to one handler for one `(input, output, error)` type triple; a lookup
/// with different types finds nothing.
#[derive(Default)]
pub struct FallbackRegistry {
    handlers: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("FallbackRegistry").field("handlers", &names).finish()
    }
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler called `name`.
    pub fn register<I, T, E, H>(&self, name: impl Into<String>, handler: H)
    where
        H: FallbackHandler<I, T, E> + 'static,
        I: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let name = name.into();
        let handler: Arc<dyn FallbackHandler<I, T, E>> = Arc::new(handler);
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(handler = %name, "replacing fallback handler");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// The handler called `name`, if one is registered for exactly these types.
    pub fn lookup<I, T, E>(&self, name: &str) -> Option<Arc<dyn FallbackHandler<I, T, E>>>
    where
        I: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let entry = self.handlers.get(name)?;
        entry.value().downcast_ref::<Arc<dyn FallbackHandler<I, T, E>>>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{Categorized, CategorySet};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl Categorized for TestError {
        fn category(&self) -> FailureCategory {
            FailureCategory::new(self.0.clone())
        }
    }

    fn failure(category: &str) -> FailureCategory {
        FailureCategory::new(category)
    }

    #[test]
    fn applies_to_any_category_by_default() {
        let policy = FallbackPolicy::new("h");
        assert!(applies(&policy, Some(&failure("ServiceFailure"))));
        assert!(applies(&policy, Some(&FailureCategory::TIMEOUT)));
        assert!(!applies(&policy, None));
    }

    #[test]
    fn skip_on_wins_over_apply_on() {
        let policy = FallbackPolicy::new("h")
            .apply_on(CategorySet::of(["ServiceFailure"]))
            .skip_on(CategorySet::of(["ServiceFailure"]));
        assert!(!applies(&policy, Some(&failure("ServiceFailure"))));
    }

    #[test]
    fn explicit_apply_on_filters() {
        let policy = FallbackPolicy::new("h").apply_on(CategorySet::of(["ServiceFailure"]));
        assert!(applies(&policy, Some(&failure("ServiceFailure"))));
        assert!(!applies(&policy, Some(&FailureCategory::BULKHEAD_FULL)));
    }

    #[test]
    fn empty_apply_on_means_every_category() {
        let policy = FallbackPolicy::new("h").apply_on(CategorySet::none());
        assert!(applies(&policy, Some(&failure("Anything"))));
    }

    #[tokio::test]
    async fn registered_handler_receives_input_and_failure() {
        let registry = FallbackRegistry::new();
        registry.register(
            "echo",
            fallback_fn(|input: u32, failure: FaultError<TestError>| async move {
                Ok::<_, TestError>(format!("{}:{}", input, failure.is_timeout()))
            }),
        );

        let handler = registry.lookup::<u32, String, TestError>("echo").expect("registered");
        let result = handler
            .handle(7, FaultError::Timeout { elapsed: Default::default(), timeout: Default::default() })
            .await;
        assert_eq!(result.unwrap(), "7:true");
    }

    #[test]
    fn lookup_with_other_types_finds_nothing() {
        let registry = FallbackRegistry::new();
        registry.register(
            "typed",
            fallback_fn(|_: u32, _: FaultError<TestError>| async { Ok::<u32, TestError>(1) }),
        );
        assert!(registry.lookup::<u32, String, TestError>("typed").is_none());
        assert!(registry.lookup::<u32, u32, TestError>("missing").is_none());
        assert!(registry.lookup::<u32, u32, TestError>("typed").is_some());
    }
}
