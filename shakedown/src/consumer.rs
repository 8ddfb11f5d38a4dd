//! Fault-injecting message consumer.
//!
//! The consumer is invoked once per delivery attempt by the surrounding
//! redelivery middleware. It never loops on its own: a failure is signalled
//! back to the caller as [`ProcessingError::Simulated`] and the middleware
//! decides whether to redeliver.
//!
//! Each call emits exactly one observation, both as a tracing event and into
//! the configured [`ObservationSink`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ProcessingError, SimulatedFailure};
use crate::message::{Message, Payment};
use crate::random::RandomProvider;
use crate::signals::{Observation, ObservationSink, ObservedOutcome};
use crate::stability::{AttemptOutcome, StabilityInstruction, StabilityPolicy};

/// One delivery of a message to a consumer.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    /// The delivered message.
    pub message: &'a Message,
    /// Zero-based attempt index for this message.
    pub attempt: u32,
}

/// A consumer that processes one delivery at a time.
#[async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    /// Process one delivery. An error asks the caller to redeliver.
    async fn consume(&self, delivery: Delivery<'_>) -> Result<(), ProcessingError>;
}

/// Response of the direct request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResponse {
    /// 200 on success, 500 on simulated failure.
    pub status: u16,
    /// Payload summary on success.
    pub body: Option<String>,
}

impl DirectResponse {
    /// Whether the status is a success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Consumer that fails on purpose according to the message's instruction.
pub struct FaultInjectingConsumer<R: RandomProvider> {
    policy: StabilityPolicy,
    random: R,
    sink: Arc<dyn ObservationSink>,
}

impl<R: RandomProvider> FaultInjectingConsumer<R> {
    /// Create a consumer drawing from `random` and reporting into `sink`.
    pub fn new(random: R, sink: Arc<dyn ObservationSink>) -> Self {
        Self {
            policy: StabilityPolicy::default(),
            random,
            sink,
        }
    }

    /// Replace the stability policy.
    pub fn with_policy(mut self, policy: StabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Decide, observe and report one attempt.
    pub fn process(
        &self,
        message_id: &str,
        payment: &Payment,
        instruction: StabilityInstruction,
        attempt: u32,
    ) -> AttemptOutcome {
        let outcome = self.policy.decide(instruction, &self.random);
        let payload_summary = payment.summary();

        let observed = match &outcome {
            AttemptOutcome::Succeeded => {
                tracing::info!(
                    message_id,
                    attempt,
                    %instruction,
                    "{}: {}",
                    ObservedOutcome::Succeeded.marker(),
                    payload_summary
                );
                ObservedOutcome::Succeeded
            }
            AttemptOutcome::Failed(cause) => {
                tracing::error!(
                    message_id,
                    attempt,
                    %instruction,
                    %cause,
                    "{}: {}",
                    ObservedOutcome::Failed.marker(),
                    payload_summary
                );
                ObservedOutcome::Failed
            }
        };

        self.sink.record(Observation {
            message_id: message_id.to_string(),
            attempt,
            outcome: observed,
            payload_summary,
        });

        outcome
    }

    /// Direct request path: reports failure as a status instead of an error.
    pub fn handle_direct(
        &self,
        payment: &Payment,
        instruction: StabilityInstruction,
    ) -> DirectResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self.process(&request_id, payment, instruction, 0) {
            AttemptOutcome::Succeeded => DirectResponse {
                status: 200,
                body: Some(payment.summary()),
            },
            AttemptOutcome::Failed(_) => DirectResponse {
                status: 500,
                body: None,
            },
        }
    }
}

#[async_trait]
impl<R: RandomProvider> MessageConsumer for FaultInjectingConsumer<R> {
    async fn consume(&self, delivery: Delivery<'_>) -> Result<(), ProcessingError> {
        let message = delivery.message;
        let instruction = message.instruction();

        match self.process(&message.id, &message.payload, instruction, delivery.attempt) {
            AttemptOutcome::Succeeded => Ok(()),
            AttemptOutcome::Failed(_) => Err(SimulatedFailure {
                message_id: message.id.clone(),
                attempt: delivery.attempt,
            }
            .into()),
        }
    }
}
