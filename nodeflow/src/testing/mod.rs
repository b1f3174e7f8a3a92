//! Testing utilities for nodeflow graphs.
//!
//! This module provides:
//! - Mock handlers that record, fail or stall
//! - An in-process worker over the in-memory broker
//! - A polling helper for asynchronous assertions

mod fixtures;
mod mocks;

pub use fixtures::TestWorker;
pub use mocks::{FailingHandler, FlakyHandler, RecordedCall, RecordingHandler, SlowHandler};

use std::time::Duration;

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_until() {
        let polls = AtomicUsize::new(0);
        assert!(wait_until(Duration::from_secs(1), || polls.fetch_add(1, Ordering::SeqCst) >= 3).await);
        assert!(!wait_until(Duration::from_millis(20), || false).await);
    }
}
