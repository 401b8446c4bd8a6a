//! Timeout governor: bounds the wall time of one attempt.
//!
//! On expiry the governor cancels the attempt's `CancellationToken`, drops the in-flight
//! future and reports [`FaultError::Timeout`] straight away. Only one outcome is ever
//! delivered: whichever of completion and deadline is observed first.
//!
//! # Limitation
//!
//! Dropping the future stops everything that runs *inside* it at its next suspension
//! point. Work the body moved elsewhere (a `spawn`ed task, `spawn_blocking`, a thread) is
//! not stopped; it only sees the cancelled token and must check it to stop early.
//! Timeout enforcement for such work is best-effort and its resources are not reclaimed
//! by the governor.

use crate::error::FaultError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutGovernor {
    duration: Duration,
}

impl TimeoutGovernor {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `attempt` against the deadline, cancelling `token` if it expires.
    pub async fn execute<T, E, Fut>(
        &self,
        token: &CancellationToken,
        attempt: Fut,
    ) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, attempt).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(FaultError::Timeout { elapsed: start.elapsed(), timeout: self.duration })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let governor = TimeoutGovernor::new(Duration::from_millis(100));
        let token = CancellationToken::new();
        let result = governor
            .execute(&token, async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, FaultError<TestError>>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_timeout_at_the_deadline() {
        let governor = TimeoutGovernor::new(Duration::from_millis(250));
        let token = CancellationToken::new();
        let started = Instant::now();
        let result = governor
            .execute(&token, async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, FaultError<TestError>>(42)
            })
            .await;

        let (elapsed, timeout) = result.unwrap_err().timeout_details().expect("timeout");
        assert_eq!(timeout, Duration::from_millis(250));
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn detached_work_observes_the_token() {
        let governor = TimeoutGovernor::new(Duration::from_millis(50));
        let token = CancellationToken::new();
        let stopped_early = Arc::new(AtomicUsize::new(0));

        let detached = {
            let token = token.clone();
            let stopped_early = stopped_early.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => { stopped_early.fetch_add(1, Ordering::SeqCst); }
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
            })
        };

        let result = governor
            .execute(&token, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), FaultError<TestError>>(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        detached.await.unwrap();
        assert_eq!(stopped_early.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn propagates_attempt_errors() {
        let governor = TimeoutGovernor::new(Duration::from_secs(1));
        let result = governor
            .execute(&CancellationToken::new(), async {
                Err::<(), _>(FaultError::Inner(TestError("operation failed".to_string())))
            })
            .await;
        match result.unwrap_err() {
            FaultError::Inner(e) => assert_eq!(e.0, "operation failed"),
            e => panic!("Expected Inner error, got {:?}", e),
        }
    }
}
