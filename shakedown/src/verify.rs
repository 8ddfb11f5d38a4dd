//! Polling verification of terminal outcomes.
//!
//! The verifier records a [`SignalCursor`] before a scenario publishes
//! anything, then re-reads the signal source from that cursor on every poll
//! until one of the expected strings shows up or the timeout elapses.

use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::error::{SignalError, VerificationError};
use crate::signals::{SignalSource, FAILURE_MARKER, SUCCESS_MARKER};
use crate::stability::StabilityInstruction;
use crate::time::{Deadline, TimeProvider, TokioTimeProvider};

/// Which terminal result a scenario expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutcome {
    /// Only success is valid.
    Success,
    /// Only failure is valid.
    Failure,
    /// Either result is valid; used for probabilistic instructions.
    Either,
}

impl ExpectedOutcome {
    /// The expectation implied by an instruction.
    pub fn for_instruction(instruction: StabilityInstruction) -> Self {
        match instruction {
            StabilityInstruction::Functional => ExpectedOutcome::Success,
            StabilityInstruction::Failing => ExpectedOutcome::Failure,
            StabilityInstruction::Flaky => ExpectedOutcome::Either,
        }
    }

    /// The set of log strings that satisfy this expectation.
    pub fn outcome_set(&self) -> ExpectedOutcomeSet {
        match self {
            ExpectedOutcome::Success => ExpectedOutcomeSet::new(vec![SUCCESS_MARKER]),
            ExpectedOutcome::Failure => ExpectedOutcomeSet::new(vec![FAILURE_MARKER]),
            ExpectedOutcome::Either => ExpectedOutcomeSet::new(vec![SUCCESS_MARKER, FAILURE_MARKER]),
        }
    }
}

/// Valid terminal-log strings for one expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOutcomeSet {
    members: Vec<&'static str>,
}

impl ExpectedOutcomeSet {
    /// A set of literal strings.
    pub fn new(members: Vec<&'static str>) -> Self {
        Self { members }
    }

    /// The members of the set.
    pub fn members(&self) -> &[&'static str] {
        &self.members
    }

    /// The earliest member occurring in `text`, with the line containing it.
    pub fn find_in<'t>(&self, text: &'t str) -> Option<(&'static str, &'t str)> {
        text.lines().find_map(|line| {
            self.members
                .iter()
                .find(|m| line.contains(*m))
                .map(|m| (*m, line))
        })
    }

    /// Whether any member occurs in `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.members.iter().any(|m| text.contains(m))
    }
}

impl From<ExpectedOutcome> for ExpectedOutcomeSet {
    fn from(outcome: ExpectedOutcome) -> Self {
        outcome.outcome_set()
    }
}

/// Baseline recorded before a scenario runs.
///
/// `since` bounds the query; `offset` skips text that was already present at
/// that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalCursor {
    /// Query start time.
    pub since: SystemTime,
    /// Byte length of the text already present at `since`.
    pub offset: usize,
}

impl SignalCursor {
    /// The part of a fresh read that lies past the baseline.
    pub fn slice<'t>(&self, text: &'t str) -> &'t str {
        text.get(self.offset..).unwrap_or("")
    }
}

/// Result of one verification wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// Whether an expected string appeared.
    pub matched: bool,
    /// The expected string that matched.
    pub matched_marker: Option<&'static str>,
    /// The line containing the match.
    pub matched_text: Option<String>,
    /// Signal text past the cursor on the last poll.
    pub observed: String,
    /// Members of the expected set, for diagnostics.
    pub expected: Vec<&'static str>,
    /// Time spent waiting.
    pub waited: Duration,
}

impl VerificationResult {
    /// Whether `needle` occurs anywhere in the observed text.
    pub fn observed_contains(&self, needle: &str) -> bool {
        self.observed.contains(needle)
    }

    /// Turn an unmatched result into a [`VerificationError::Timeout`].
    pub fn into_result(self) -> Result<Self, VerificationError> {
        if self.matched {
            Ok(self)
        } else {
            Err(VerificationError::Timeout {
                expected: self.expected,
                observed: self.observed,
                waited: self.waited,
            })
        }
    }
}

/// Polls a [`SignalSource`] until an expected outcome shows up.
#[derive(Debug, Clone)]
pub struct OutcomeVerifier<T: TimeProvider = TokioTimeProvider> {
    timeout: Duration,
    poll_interval: Duration,
    time: T,
}

impl Default for OutcomeVerifier<TokioTimeProvider> {
    fn default() -> Self {
        Self::new(TokioTimeProvider::new())
    }
}

impl<T: TimeProvider> OutcomeVerifier<T> {
    /// Verifier with a 10 s timeout polling every 100 ms.
    pub fn new(time: T) -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            time,
        }
    }

    /// Set the overall wait budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between polls. Zero is raised to one millisecond.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// The wait budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a baseline on `source` at the current instant.
    pub async fn mark<S>(&self, source: &S) -> Result<SignalCursor, SignalError>
    where
        S: SignalSource + ?Sized,
    {
        let since = self.time.wall_clock();
        let offset = source.signals_since(since).await?.len();
        Ok(SignalCursor { since, offset })
    }

    /// Wait until any member of `expected` appears past `cursor`.
    ///
    /// Returns `matched == false` on timeout; use
    /// [`VerificationResult::into_result`] to turn that into an error.
    pub async fn await_outcome<S>(
        &self,
        source: &S,
        cursor: &SignalCursor,
        expected: &ExpectedOutcomeSet,
    ) -> Result<VerificationResult, VerificationError>
    where
        S: SignalSource + ?Sized,
    {
        self.await_outcome_with_cancel(source, cursor, expected, &CancellationToken::new())
            .await
    }

    /// [`await_outcome`](Self::await_outcome) that also stops on `cancel`.
    pub async fn await_outcome_with_cancel<S>(
        &self,
        source: &S,
        cursor: &SignalCursor,
        expected: &ExpectedOutcomeSet,
        cancel: &CancellationToken,
    ) -> Result<VerificationResult, VerificationError>
    where
        S: SignalSource + ?Sized,
    {
        let started = self.time.now();
        let deadline = Deadline::after(self.timeout);
        let mut observed;

        loop {
            let text = source.signals_since(cursor.since).await?;
            observed = cursor.slice(&text).to_string();

            if let Some((marker, line)) = expected.find_in(&observed) {
                tracing::debug!(marker, "expected outcome observed");
                let matched_text = Some(line.to_string());
                return Ok(VerificationResult {
                    matched: true,
                    matched_marker: Some(marker),
                    matched_text,
                    observed,
                    expected: expected.members().to_vec(),
                    waited: self.time.now().saturating_sub(started),
                });
            }

            if deadline.is_expired() {
                break;
            }

            let pause = self.poll_interval.min(deadline.remaining());
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(VerificationError::Cancelled { observed });
                }
                _ = self.time.sleep(pause) => {}
            }
        }

        tracing::warn!(
            expected = ?expected.members(),
            timeout = ?self.timeout,
            "expected outcome not observed"
        );
        Ok(VerificationResult {
            matched: false,
            matched_marker: None,
            matched_text: None,
            observed,
            expected: expected.members().to_vec(),
            waited: self.time.now().saturating_sub(started),
        })
    }
}
