//! # Shakedown
//!
//! Resilience testing for a producer / broker / consumer messaging pipeline.
//!
//! A fault-injecting consumer fails message processing on instruction
//! (always, never, or at random), a bounded backoff policy redelivers failed
//! messages, and a verifier polls the consumer's output for the outcome the
//! instruction implies. The same scenario runs on four topologies, from fully
//! in-memory to fully containerized, with fixtures that bring up an isolated
//! network and its services and tear them down again.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  presets: broker / server / client fixtures, Topology       │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  environment                 │  verify                      │
//! │  • CompositeEnvironment      │  • ExpectedOutcome(Set)      │
//! │  • settings handshake        │  • OutcomeVerifier           │
//! ├──────────────────────────────┤  • SignalCursor              │
//! │  fixture                     ├──────────────────────────────┤
//! │  • Network / Image /         │  bus + consumer              │
//! │    ContainerFixture          │  • InMemoryBus (redelivery)  │
//! ├──────────────────────────────┤  • FaultInjectingConsumer    │
//! │  runtime                     ├──────────────────────────────┤
//! │  • DockerCliRuntime          │  stability / retry / signals │
//! │  • InMemoryRuntime           │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  random / time providers, config, error                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use shakedown::prelude::*;
//!
//! let log = Arc::new(SignalLog::new());
//! let consumer = FaultInjectingConsumer::new(ThreadRandomProvider::new(), log.clone());
//! let bus = InMemoryBus::new(consumer, RetryPolicy::default(), TokioTimeProvider::new());
//!
//! let verifier = OutcomeVerifier::default();
//! let cursor = verifier.mark(&log).await?;
//! let message = Message::new(Payment::generate(&ThreadRandomProvider::new()))
//!     .with_instruction(StabilityInstruction::Flaky);
//! bus.publish(message);
//!
//! verifier
//!     .await_outcome(&log, &cursor, &ExpectedOutcome::Either.outcome_set())
//!     .await?
//!     .into_result()?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod bus;
pub mod config;
pub mod consumer;
pub mod environment;
pub mod error;
pub mod fixture;
pub mod message;
pub mod prelude;
pub mod presets;
pub mod random;
pub mod retry;
pub mod runtime;
pub mod signals;
pub mod stability;
pub mod time;
pub mod verify;

pub use bus::{ConsumedRecord, DeliveryReport, InMemoryBus};
pub use config::{
    BrokerOptions, FixtureTimeouts, HarnessConfig, RetryConfig, ServiceSettings, SourceLayout,
    VerifyOptions,
};
pub use consumer::{Delivery, DirectResponse, FaultInjectingConsumer, MessageConsumer};
pub use environment::{
    settings_handshake, CompositeEnvironment, EnvironmentBuilder, EnvironmentHandle,
    InProcessService, SettingsPublisher, SettingsSubscriber,
};
pub use error::{
    ConfigError, FixtureError, ProcessingError, RuntimeError, ShakedownError, SignalError,
    SimulatedFailure, VerificationError,
};
pub use fixture::{
    ContainerFixture, ContainerSpec, Fixture, FixtureState, ImageFixture, ImageSource, ImageSpec,
    NetworkFixture, NetworkHandle, ReadinessCondition,
};
pub use message::{Message, Payment, STABILITY_HEADER};
pub use presets::{Topology, TopologyEnvironment};
pub use random::{RandomProvider, SeededRandomProvider, ThreadRandomProvider};
pub use retry::{RetryPolicy, RetryReport, RetryScheduler};
pub use runtime::{ContainerRuntime, DockerCliRuntime, InMemoryRuntime};
pub use signals::{
    Observation, ObservationSink, ObservedOutcome, SignalLog, SignalSource, FAILURE_MARKER,
    SUCCESS_MARKER,
};
pub use stability::{AttemptOutcome, StabilityInstruction, StabilityPolicy};
pub use time::{TimeProvider, TokioTimeProvider};
pub use verify::{
    ExpectedOutcome, ExpectedOutcomeSet, OutcomeVerifier, SignalCursor, VerificationResult,
};
