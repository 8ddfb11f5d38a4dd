//! Container runtime abstraction.
//!
//! Fixtures never talk to a container engine directly. They go through
//! [`ContainerRuntime`], which has two implementations:
//!
//! - [`DockerCliRuntime`]: drives a real daemon through the `docker` CLI
//! - [`InMemoryRuntime`]: deterministic double with scripted logs, failure
//!   injection and an operation journal
//!
//! Every resource created through one runtime instance carries the
//! [`SESSION_LABEL`] with that instance's session id, so
//! [`ContainerRuntime::list_active`] can report exactly what this session
//! still owns.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::RuntimeError;

mod docker;
mod memory;

pub use docker::DockerCliRuntime;
pub use memory::{InMemoryRuntime, RuntimeEvent, RuntimeOperation};

/// Label attached to every resource created by a runtime session.
pub const SESSION_LABEL: &str = "shakedown.session";

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            /// The raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

resource_id!(
    /// Identifier of a network.
    NetworkId
);
resource_id!(
    /// Identifier (tag) of an image.
    ImageId
);
resource_id!(
    /// Identifier of a container.
    ContainerId
);

/// Request to build an image from a source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Tag given to the built image.
    pub tag: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Build descriptor, relative to `context` or absolute.
    pub dockerfile: PathBuf,
}

/// Request to start one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    /// Container name.
    pub name: String,
    /// Image tag to run.
    pub image: String,
    /// Network to attach to.
    pub network: Option<NetworkId>,
    /// Hostname, also registered as a network alias.
    pub hostname: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Container ports published on random host ports.
    pub exposed_ports: Vec<u16>,
}

/// Output captured from a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ContainerLogs {
    /// Both streams concatenated, stdout first.
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len());
        text.push_str(&self.stdout);
        text.push_str(&self.stderr);
        text
    }

    /// The last `lines` lines of the combined output.
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Resources a session still owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveResources {
    /// Live networks.
    pub networks: Vec<NetworkId>,
    /// Live images.
    pub images: Vec<ImageId>,
    /// Live containers, running or stopped.
    pub containers: Vec<ContainerId>,
}

impl ActiveResources {
    /// True when nothing is left.
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.images.is_empty() && self.containers.is_empty()
    }
}

/// Operations fixtures need from a container engine.
///
/// Removal of a resource that no longer exists fails with
/// [`RuntimeError::NotFound`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Session id stamped on every resource.
    fn session(&self) -> &str;

    /// Host name under which published ports are reachable.
    fn host(&self) -> &str;

    /// Create a network.
    async fn create_network(&self, name: &str) -> Result<NetworkId, RuntimeError>;

    /// Remove a network.
    async fn remove_network(&self, id: &NetworkId) -> Result<(), RuntimeError>;

    /// Build an image.
    async fn build_image(&self, request: &BuildRequest) -> Result<ImageId, RuntimeError>;

    /// Remove an image.
    async fn remove_image(&self, id: &ImageId) -> Result<(), RuntimeError>;

    /// Create and start a container.
    async fn start_container(&self, request: &ContainerRequest)
        -> Result<ContainerId, RuntimeError>;

    /// Host port bound to `container_port`.
    async fn mapped_port(&self, id: &ContainerId, container_port: u16)
        -> Result<u16, RuntimeError>;

    /// Container output, optionally only from `since` onwards.
    async fn logs(
        &self,
        id: &ContainerId,
        since: Option<SystemTime>,
    ) -> Result<ContainerLogs, RuntimeError>;

    /// Stop and remove a container.
    async fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Everything this session created and has not removed.
    async fn list_active(&self) -> Result<ActiveResources, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_combined_and_tail() {
        let logs = ContainerLogs {
            stdout: "a\nb\n".into(),
            stderr: "c\nd\n".into(),
        };
        assert_eq!(logs.combined(), "a\nb\nc\nd\n");
        assert_eq!(logs.tail(2), "c\nd");
        assert_eq!(logs.tail(10), "a\nb\nc\nd");
    }

    #[test]
    fn test_active_resources_empty() {
        let mut active = ActiveResources::default();
        assert!(active.is_empty());
        active.images.push(ImageId("server-1".into()));
        assert!(!active.is_empty());
    }
}
