//! Observable outcome signals.
//!
//! The consumer emits exactly one [`Observation`] per attempt into an
//! [`ObservationSink`]. Verification reads signals back through a
//! [`SignalSource`], which is either the in-memory [`SignalLog`] or a
//! container's log stream.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SignalError;

/// Prefix of the success observation line.
pub const SUCCESS_MARKER: &str = "Payment succeeded";

/// Prefix of the failure observation line.
pub const FAILURE_MARKER: &str = "Payment failed";

/// Outcome recorded by an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedOutcome {
    /// The attempt succeeded.
    Succeeded,
    /// The attempt failed.
    Failed,
}

impl ObservedOutcome {
    /// The log prefix for this outcome.
    pub fn marker(&self) -> &'static str {
        match self {
            ObservedOutcome::Succeeded => SUCCESS_MARKER,
            ObservedOutcome::Failed => FAILURE_MARKER,
        }
    }
}

/// One emitted signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Message the attempt processed.
    pub message_id: String,
    /// Zero-based delivery attempt.
    pub attempt: u32,
    /// What happened.
    pub outcome: ObservedOutcome,
    /// Human-readable payload summary.
    pub payload_summary: String,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.outcome.marker(), self.payload_summary)
    }
}

/// Destination for observations.
pub trait ObservationSink: Send + Sync {
    /// Record one observation.
    fn record(&self, observation: Observation);
}

/// Queryable signal text.
///
/// Must tolerate repeated, cheap calls while the underlying text grows.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// All signal text produced at or after `since`.
    async fn signals_since(&self, since: SystemTime) -> Result<String, SignalError>;
}

#[async_trait]
impl<S: SignalSource + ?Sized> SignalSource for Arc<S> {
    async fn signals_since(&self, since: SystemTime) -> Result<String, SignalError> {
        (**self).signals_since(since).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    at: SystemTime,
    observation: Observation,
}

/// In-memory append-only signal record.
///
/// Cloning yields another handle to the same record.
#[derive(Debug, Clone, Default)]
pub struct SignalLog {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl SignalLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every observation so far.
    pub fn observations(&self) -> Vec<Observation> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.observation.clone())
            .collect()
    }

    /// Observations for one message, in attempt order.
    pub fn for_message(&self, message_id: &str) -> Vec<Observation> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.observation.message_id == message_id)
            .map(|e| e.observation.clone())
            .collect()
    }

    /// Number of observations with the given outcome.
    pub fn count(&self, outcome: ObservedOutcome) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.observation.outcome == outcome)
            .count()
    }

    /// Total number of observations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Rendered log text since `since`, one observation per line.
    pub fn text_since(&self, since: SystemTime) -> String {
        let entries = self.entries.lock();
        let mut text = String::new();
        for entry in entries.iter().filter(|e| e.at >= since) {
            text.push_str(&entry.observation.to_string());
            text.push('\n');
        }
        text
    }
}

impl ObservationSink for SignalLog {
    fn record(&self, observation: Observation) {
        self.entries.lock().push(Entry {
            at: SystemTime::now(),
            observation,
        });
    }
}

#[async_trait]
impl SignalSource for SignalLog {
    async fn signals_since(&self, since: SystemTime) -> Result<String, SignalError> {
        Ok(self.text_since(since))
    }
}
