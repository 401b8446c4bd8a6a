#![allow(dead_code)]

use faultline::{
    Categorized, FailureCategory, FaultTolerance, InstantSleeper, ManualClock, MemorySink,
};
use std::sync::Arc;

/// Body error whose category is its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error: {}", self.0)
    }
}

impl std::error::Error for TestError {}

impl Categorized for TestError {
    fn category(&self) -> FailureCategory {
        FailureCategory::new(self.0)
    }
}

/// Engine with instant backoff, a hand-driven clock and an in-memory sink.
pub fn test_engine() -> (FaultTolerance<MemorySink>, ManualClock, MemorySink) {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = FaultTolerance::builder()
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(InstantSleeper))
        .sink(sink.clone())
        .build();
    (engine, clock, sink)
}
