//! Common imports for writing resilience scenarios.

pub use crate::bus::{ConsumedRecord, DeliveryReport, InMemoryBus};
pub use crate::config::{HarnessConfig, ServiceSettings};
pub use crate::consumer::{FaultInjectingConsumer, MessageConsumer};
pub use crate::environment::{CompositeEnvironment, InProcessService};
pub use crate::error::{FixtureError, ProcessingError, ShakedownError, VerificationError};
pub use crate::fixture::{ContainerFixture, ContainerSpec, Fixture, ImageSource, ReadinessCondition};
pub use crate::message::{Message, Payment};
pub use crate::presets::{environment_for, Topology};
pub use crate::random::{RandomProvider, SeededRandomProvider, ThreadRandomProvider};
pub use crate::retry::RetryPolicy;
pub use crate::runtime::{ContainerRuntime, DockerCliRuntime, InMemoryRuntime};
pub use crate::signals::{ObservedOutcome, SignalLog, SignalSource};
pub use crate::stability::StabilityInstruction;
pub use crate::time::{TimeProvider, TokioTimeProvider};
pub use crate::verify::{ExpectedOutcome, OutcomeVerifier};

pub use std::sync::Arc;
pub use std::time::Duration;

/// Result with the crate-level error.
pub type Result<T> = std::result::Result<T, ShakedownError>;
