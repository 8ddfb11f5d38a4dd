//! Error types for the shakedown harness.
//!
//! Each concern owns its error enum. [`ShakedownError`] unifies them for
//! callers that drive a whole scenario and only want a single `?` target.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a container runtime backend.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A runtime command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Spawning or talking to the runtime failed at the OS level.
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The referenced resource does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Resource kind (network, image, container).
        kind: &'static str,
        /// Resource identifier.
        id: String,
    },

    /// Runtime output could not be interpreted.
    #[error("could not parse {what}: {raw:?}")]
    Unparseable {
        /// What was being parsed.
        what: &'static str,
        /// The raw text.
        raw: String,
    },

    /// A failure injected by a test double.
    #[error("injected failure during {operation}")]
    Injected {
        /// Operation that was made to fail.
        operation: String,
    },
}

/// Errors raised by fixture lifecycles.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// A derived property was read before the fixture was running.
    #[error("{fixture} has not yet been initialized")]
    NotInitialized {
        /// Fixture name.
        fixture: String,
    },

    /// The readiness condition did not hold within the startup budget.
    #[error("{fixture} did not become ready within {timeout:?}")]
    StartupTimeout {
        /// Fixture name.
        fixture: String,
        /// The startup budget that elapsed.
        timeout: Duration,
        /// Tail of the container output at the time of the timeout.
        last_logs: String,
    },

    /// Building an image failed.
    #[error("image build for {image} failed: {reason}")]
    Build {
        /// Image tag that was being built.
        image: String,
        /// Underlying reason.
        reason: String,
    },

    /// The fixture was already disposed and cannot be initialized again.
    #[error("{fixture} has been disposed")]
    Disposed {
        /// Fixture name.
        fixture: String,
    },

    /// One or more fixtures failed to clean up.
    #[error("cleanup failed for {} fixture(s): {}", failures.len(), failures.join("; "))]
    Cleanup {
        /// One line per failed disposal.
        failures: Vec<String>,
    },

    /// The runtime backend reported an error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// The intentional failure produced under a Flaky or Failing instruction.
///
/// This is expected control flow for redelivery, not a defect. It is a
/// distinct type so callers can match on it instead of on message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("simulated processing failure for message {message_id} (attempt {attempt})")]
pub struct SimulatedFailure {
    /// Identifier of the failed message.
    pub message_id: String,
    /// Zero-based delivery attempt.
    pub attempt: u32,
}

/// Errors returned by a message consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// Deliberate failure requested by the stability instruction.
    #[error(transparent)]
    Simulated(#[from] SimulatedFailure),

    /// The message could not be processed at all.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Why the message was rejected.
        reason: String,
    },
}

impl ProcessingError {
    /// True when this error is the deliberate fault-injection marker.
    pub fn is_simulated(&self) -> bool {
        matches!(self, ProcessingError::Simulated(_))
    }
}

/// Errors raised while reading a signal source.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The source is backed by a fixture that is not usable.
    #[error(transparent)]
    Fixture(#[from] FixtureError),

    /// The source is backed by a runtime that failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors raised by outcome verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// None of the expected strings appeared before the timeout.
    #[error("expected any of {expected:?} within {waited:?}; observed:\n{observed}")]
    Timeout {
        /// The expected strings.
        expected: Vec<&'static str>,
        /// Signal text seen on the last poll.
        observed: String,
        /// How long the verifier waited.
        waited: Duration,
    },

    /// The wait was cancelled before a match or timeout.
    #[error("verification cancelled; observed:\n{observed}")]
    Cancelled {
        /// Signal text seen on the last poll.
        observed: String,
    },

    /// The signal source failed.
    #[error("signal source failed: {0}")]
    Signal(#[from] SignalError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Retry policy bounds are inconsistent.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level error for scenario drivers.
#[derive(Debug, Error)]
pub enum ShakedownError {
    /// Configuration error.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Fixture lifecycle error.
    #[error("fixture: {0}")]
    Fixture(#[from] FixtureError),

    /// Runtime backend error.
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),

    /// Message processing error that escaped the retry limit.
    #[error("processing: {0}")]
    Processing(#[from] ProcessingError),

    /// Outcome verification error.
    #[error("verification: {0}")]
    Verification(#[from] VerificationError),
}
