//! Tower integration: guard any `tower::Service` as a named operation.
//!
//! Each request is one invocation of the operation; the wrapped service is called once
//! per attempt with a clone of the request.
//!
//! ```rust
//! use faultline::prelude::*;
//! use std::sync::Arc;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! #[derive(Debug)]
//! struct Down;
//! impl Categorized for Down {
//!     fn category(&self) -> FailureCategory { FailureCategory::from_static("Down") }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = Arc::new(FaultTolerance::new());
//! engine
//!     .register_policy("echo", GuardedOperationPolicy::new().with_timeout(TimeoutPolicy::default()))
//!     .unwrap();
//!
//! let service = ServiceBuilder::new()
//!     .layer(FaultToleranceLayer::new(engine, "echo"))
//!     .service(service_fn(|req: String| async move { Ok::<_, Down>(req) }));
//! assert_eq!(service.oneshot("hi".to_string()).await.unwrap(), "hi");
//! # });
//! ```

use crate::category::Categorized;
use crate::error::FaultError;
use crate::pipeline::{Attempt, FaultTolerance};
use crate::policy::OperationId;
use crate::telemetry::{NullSink, TelemetrySink};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Layer that routes requests through a [`FaultTolerance`] engine.
pub struct FaultToleranceLayer<S = NullSink> {
    engine: Arc<FaultTolerance<S>>,
    operation: OperationId,
}

impl<S> FaultToleranceLayer<S> {
    pub fn new(engine: Arc<FaultTolerance<S>>, operation: impl Into<OperationId>) -> Self {
        Self { engine, operation: operation.into() }
    }

    pub fn operation(&self) -> &OperationId {
        &self.operation
    }
}

impl<S> Clone for FaultToleranceLayer<S> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), operation: self.operation.clone() }
    }
}

impl<S> fmt::Debug for FaultToleranceLayer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultToleranceLayer").field("operation", &self.operation).finish()
    }
}

impl<Svc, S> Layer<Svc> for FaultToleranceLayer<S> {
    type Service = FaultToleranceService<Svc, S>;

    fn layer(&self, inner: Svc) -> Self::Service {
        FaultToleranceService { inner, layer: self.clone() }
    }
}

/// Service produced by [`FaultToleranceLayer`].
pub struct FaultToleranceService<Svc, S = NullSink> {
    inner: Svc,
    layer: FaultToleranceLayer<S>,
}

impl<Svc: Clone, S> Clone for FaultToleranceService<Svc, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<Svc: fmt::Debug, S> fmt::Debug for FaultToleranceService<Svc, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultToleranceService")
            .field("inner", &self.inner)
            .field("operation", &self.layer.operation)
            .finish()
    }
}

impl<Svc, S, Request> Service<Request> for FaultToleranceService<Svc, S>
where
    Request: Clone + Send + Sync + 'static,
    Svc: Service<Request> + Clone + Send + Sync + 'static,
    Svc::Response: Send + 'static,
    Svc::Error: Categorized + Send + 'static,
    Svc::Future: Send + 'static,
    S: TelemetrySink,
{
    type Response = Svc::Response;
    type Error = FaultError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(FaultError::Inner)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let inner = self.inner.clone();
        let layer = self.layer.clone();
        Box::pin(async move {
            layer
                .engine
                .invoke(layer.operation.as_str(), req, |req: Request, _attempt: Attempt| {
                    inner.clone().oneshot(req)
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::FailureCategory;
    use crate::policy::{GuardedOperationPolicy, RetryPolicy, TimeAmount};
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceBuilder};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl Categorized for TestError {
        fn category(&self) -> FailureCategory {
            FailureCategory::new(self.0)
        }
    }

    fn engine() -> Arc<FaultTolerance> {
        let engine = FaultTolerance::builder().sleeper(Arc::new(InstantSleeper)).build();
        engine
            .register_policy(
                "svc",
                GuardedOperationPolicy::new()
                    .with_retry(RetryPolicy::default().max_retries(2).jitter(TimeAmount::ZERO)),
            )
            .unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn retries_the_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let service = ServiceBuilder::new().layer(FaultToleranceLayer::new(engine(), "svc")).service(
            service_fn(move |req: u32| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError("Flaky"))
                    } else {
                        Ok(req * 2)
                    }
                }
            }),
        );

        assert_eq!(service.oneshot(21).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_exhaustion() {
        let service = FaultToleranceLayer::new(engine(), "svc")
            .layer(service_fn(|_: ()| async { Err::<(), _>(TestError("Down")) }));
        let err = service.oneshot(()).await.unwrap_err();
        assert_eq!(err.retry_attempts(), Some(3));
    }

    #[tokio::test]
    async fn unknown_operation_is_an_error() {
        let service = FaultToleranceLayer::new(engine(), "other")
            .layer(service_fn(|_: ()| async { Ok::<_, TestError>(()) }));
        assert!(matches!(
            service.oneshot(()).await,
            Err(FaultError::UnknownOperation { .. })
        ));
    }
}
