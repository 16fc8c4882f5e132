//! Caller-supplied deadlines
//!
//! Every storage call and connector call made on behalf of a request runs
//! under the request's deadline. When it passes, the call is abandoned and
//! the caller must treat the outcome as unknown.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Returned when a wrapped operation did not finish before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Absolute point in time by which an operation must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Drive `fut` to completion unless the deadline passes first.
    pub async fn run<F: Future>(self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        tokio::time::timeout_at(self.0, fut)
            .await
            .map_err(|_| DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_returns_output_before_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let out = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                42
            })
            .await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn run_fails_once_deadline_passes() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let out = deadline
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(DeadlineExceeded));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let deadline = Deadline::after(Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(20));
        assert!(!deadline.is_expired());
    }
}
