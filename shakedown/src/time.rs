//! Time provider abstraction.
//!
//! Retry delays and verification polling go through [`TimeProvider`] so tests
//! can run them under tokio's paused clock without real waiting.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Provider trait for time operations.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic elapsed time since the provider was created.
    fn now(&self) -> Duration;

    /// Wall-clock time, used to timestamp signals.
    fn wall_clock(&self) -> SystemTime;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn wall_clock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Fractional unix seconds, the form `docker logs --since` accepts.
pub(crate) fn unix_seconds(at: SystemTime) -> String {
    let since_epoch = at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    format!("{}.{:09}", since_epoch.as_secs(), since_epoch.subsec_nanos())
}

/// Deadline helper shared by the polling loops.
///
/// Built on tokio's clock so it follows paused time in tests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
}

impl Deadline {
    pub(crate) fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_seconds_format() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(unix_seconds(at), "1.500000000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_paused_clock() {
        let time = TokioTimeProvider::new();
        time.sleep(Duration::from_secs(3)).await;
        assert!(time.now() >= Duration::from_secs(3));
    }
}
