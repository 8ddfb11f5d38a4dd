//! Managed lifecycles for networks, images and containers.
//!
//! A fixture owns exactly one external resource and exposes explicit
//! initialize / dispose steps. Fixtures compose: a [`ContainerFixture`] may
//! run an image produced by an [`ImageFixture`], and every container in one
//! environment attaches to the same [`NetworkFixture`] through its
//! [`NetworkHandle`].
//!
//! Disposal is idempotent everywhere: a second dispose, or a dispose of a
//! fixture that was never initialized, is a no-op.

use async_trait::async_trait;

use crate::error::{FixtureError, RuntimeError};
use crate::runtime::NetworkId;

mod container;
mod image;
mod network;

pub use container::{ContainerFixture, ContainerSpec, ImageSource, ReadinessCondition};
pub use image::{ImageFixture, ImageSpec};
pub use network::NetworkFixture;

/// Identity of a created network, shared by every container attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkHandle {
    /// Runtime identifier.
    pub id: NetworkId,
    /// Network name.
    pub name: String,
}

/// Container fixture lifecycle.
///
/// ```text
/// Uninitialized → ImageReady → Starting → Running → Disposed
///       │              │           │
///       └──────────────┴───────────┴──► Disposed (failure or early dispose)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    /// Nothing created yet.
    Uninitialized,
    /// Image built or resolved, no container yet.
    ImageReady,
    /// Container created, waiting for readiness.
    Starting,
    /// Readiness satisfied.
    Running,
    /// Torn down. Terminal.
    Disposed,
}

impl FixtureState {
    /// Check if transition to `next` is valid.
    pub fn can_transition_to(&self, next: FixtureState) -> bool {
        use FixtureState::*;
        matches!(
            (self, next),
            (Uninitialized, ImageReady)
                | (ImageReady, Starting)
                | (Starting, Running)
                | (Uninitialized | ImageReady | Starting | Running, Disposed)
        )
    }

    /// Whether derived properties may be read.
    pub fn is_running(&self) -> bool {
        matches!(self, FixtureState::Running)
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FixtureState::Disposed)
    }
}

/// Capability shared by everything a composite environment manages.
#[async_trait]
pub trait Fixture: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Bring the resource up on `network`.
    async fn initialize(&self, network: &NetworkHandle) -> Result<(), FixtureError>;

    /// Tear the resource down. Idempotent.
    async fn dispose(&self) -> Result<(), FixtureError>;
}

/// Map "already gone" to success during teardown.
pub(crate) fn ignore_missing(result: Result<(), RuntimeError>) -> Result<(), FixtureError> {
    match result {
        Ok(()) | Err(RuntimeError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
