//! Bounded backoff for redelivery.
//!
//! [`RetryPolicy`] describes the delay schedule; [`RetryScheduler`] drives an
//! attempt function until it succeeds or the attempt budget is spent.
//!
//! # Delay schedule
//!
//! The first attempt is never delayed. Attempt `i >= 1` waits
//! `min(max_delay, min_delay + i * delay_increment)` before running, so the
//! schedule is monotonically non-decreasing and capped:
//!
//! ```text
//! min=0, max=2s, increment=500ms
//! attempt:   0     1      2       3       4       5       6 ...
//! wait:      0ms   500ms  1000ms  1500ms  2000ms  2000ms  2000ms
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::ConfigError;
use crate::stability::AttemptOutcome;
use crate::time::TimeProvider;

/// Bounded backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    delay_increment: Duration,
}

impl Default for RetryPolicy {
    /// The broker default: 10 attempts, 0..2s in 500ms steps.
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: Duration::ZERO,
            max_delay: Duration::from_secs(2),
            delay_increment: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Create a validated policy.
    ///
    /// Fails when `max_attempts` is zero or `max_delay < min_delay`.
    pub fn new(
        max_attempts: u32,
        min_delay: Duration,
        max_delay: Duration,
        delay_increment: Duration,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1".into(),
            ));
        }
        if max_delay < min_delay {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "max_delay {max_delay:?} is below min_delay {min_delay:?}"
            )));
        }
        Ok(Self {
            max_attempts,
            min_delay,
            max_delay,
            delay_increment,
        })
    }

    /// A single attempt: any failure is terminal.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Same schedule with a different attempt budget (at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Same schedule without any waiting, for in-memory runs.
    pub fn immediate(mut self) -> Self {
        self.min_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self.delay_increment = Duration::ZERO;
        self
    }

    /// Total number of delivery attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Lower delay bound.
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Upper delay bound.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Step added per attempt.
    pub fn delay_increment(&self) -> Duration {
        self.delay_increment
    }

    /// Wait before attempt `attempt_index` (zero-based).
    pub fn delay_before(&self, attempt_index: u32) -> Duration {
        if attempt_index == 0 {
            return Duration::ZERO;
        }
        let grown = self
            .delay_increment
            .checked_mul(attempt_index)
            .and_then(|step| self.min_delay.checked_add(step))
            .unwrap_or(self.max_delay);
        grown.min(self.max_delay)
    }

    /// The wait before each attempt, for every attempt the policy allows.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|i| self.delay_before(i))
    }
}

/// What happened while driving one message through its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    /// Terminal outcome: the first success, or the last failure.
    pub outcome: AttemptOutcome,
    /// Number of attempts actually made.
    pub attempts: u32,
    /// Wait applied before each attempt, in order.
    pub waits: Vec<Duration>,
}

impl RetryReport {
    /// Whether the terminal outcome is a success.
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }

    /// Total time spent waiting between attempts.
    pub fn total_wait(&self) -> Duration {
        self.waits.iter().sum()
    }
}

/// Drives attempts under a [`RetryPolicy`].
///
/// Holds only the read-only policy and a time provider. All per-message
/// state lives on the stack of [`run`](Self::run), so one scheduler can serve
/// any number of concurrent messages.
#[derive(Debug, Clone)]
pub struct RetryScheduler<T: TimeProvider> {
    policy: RetryPolicy,
    time: T,
}

impl<T: TimeProvider> RetryScheduler<T> {
    /// Create a scheduler for `policy`.
    pub fn new(policy: RetryPolicy, time: T) -> Self {
        Self { policy, time }
    }

    /// The policy this scheduler applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait before the next attempt.
    pub fn next_delay(&self, attempt_index: u32) -> Duration {
        self.policy.delay_before(attempt_index)
    }

    /// Run `attempt` until it succeeds or `max_attempts` is reached.
    ///
    /// `attempt` receives the zero-based attempt index.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> RetryReport
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let mut waits = Vec::new();
        let mut index = 0;

        loop {
            let wait = self.next_delay(index);
            self.time.sleep(wait).await;
            waits.push(wait);

            let outcome = attempt(index).await;
            index += 1;

            let terminal = match &outcome {
                AttemptOutcome::Succeeded => true,
                AttemptOutcome::Failed(cause) if index >= self.policy.max_attempts => {
                    tracing::debug!(attempts = index, %cause, "retry budget exhausted");
                    true
                }
                AttemptOutcome::Failed(cause) => {
                    tracing::debug!(attempt = index - 1, %cause, "attempt failed, will retry");
                    false
                }
            };

            if terminal {
                return RetryReport {
                    outcome,
                    attempts: index,
                    waits,
                };
            }
        }
    }
}
