//! Stability instructions and the per-attempt decision policy.
//!
//! A message carries a [`StabilityInstruction`] in its headers. For every
//! delivery attempt, [`StabilityPolicy::decide`] turns the instruction plus one
//! draw of entropy into an [`AttemptOutcome`].
//!
//! # Header mapping
//!
//! Conversion from the header value is total: the three variant names map to
//! their variants (case-insensitively), and every other value, including a
//! missing header, maps to [`StabilityInstruction::Functional`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::random::RandomProvider;

/// Per-message directive controlling simulated consumer behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StabilityInstruction {
    /// Every attempt succeeds.
    #[default]
    Functional,

    /// Each attempt succeeds or fails with probability one half.
    Flaky,

    /// Every attempt fails.
    Failing,
}

impl StabilityInstruction {
    /// All instructions, in declaration order.
    pub const ALL: [StabilityInstruction; 3] = [
        StabilityInstruction::Functional,
        StabilityInstruction::Flaky,
        StabilityInstruction::Failing,
    ];

    /// Map an optional header value to an instruction.
    ///
    /// Unknown or missing values map to `Functional`.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("flaky") => StabilityInstruction::Flaky,
            Some(v) if v.eq_ignore_ascii_case("failing") => StabilityInstruction::Failing,
            _ => StabilityInstruction::Functional,
        }
    }

    /// The header value for this instruction.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            StabilityInstruction::Functional => "Functional",
            StabilityInstruction::Flaky => "Flaky",
            StabilityInstruction::Failing => "Failing",
        }
    }
}

impl fmt::Display for StabilityInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header_value())
    }
}

/// Result of one processing attempt. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt succeeded.
    Succeeded,

    /// The attempt failed.
    Failed(String),
}

impl AttemptOutcome {
    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }
}

/// Pure decision function over an instruction and an entropy source.
#[derive(Debug, Clone, Copy)]
pub struct StabilityPolicy {
    flaky_failure_probability: f64,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            flaky_failure_probability: 0.5,
        }
    }
}

impl StabilityPolicy {
    /// Policy with the standard one-half failure probability for Flaky.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the failure probability used for Flaky, clamped to `[0, 1]`.
    pub fn with_flaky_failure_probability(mut self, probability: f64) -> Self {
        self.flaky_failure_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Decide the outcome of one attempt.
    ///
    /// Draws entropy only for `Flaky`.
    pub fn decide<R: RandomProvider>(
        &self,
        instruction: StabilityInstruction,
        random: &R,
    ) -> AttemptOutcome {
        match instruction {
            StabilityInstruction::Functional => AttemptOutcome::Succeeded,
            StabilityInstruction::Failing => {
                AttemptOutcome::Failed("instruction is Failing".to_string())
            }
            StabilityInstruction::Flaky => {
                if random.random_bool(self.flaky_failure_probability) {
                    AttemptOutcome::Failed("flaky draw failed".to_string())
                } else {
                    AttemptOutcome::Succeeded
                }
            }
        }
    }
}
