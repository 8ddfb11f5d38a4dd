//! Isolated network shared by one environment.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{ignore_missing, NetworkHandle};
use crate::error::FixtureError;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone)]
enum NetworkState {
    Uninitialized,
    Created(NetworkHandle),
    Disposed,
}

/// One uniquely named network.
pub struct NetworkFixture {
    name: String,
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<NetworkState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl NetworkFixture {
    /// A network named `{prefix}-{uuid}`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prefix: &str) -> Self {
        Self {
            name: format!("{prefix}-{}", uuid::Uuid::new_v4()),
            runtime,
            state: Mutex::new(NetworkState::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// The generated network name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the network, or return the existing handle.
    pub async fn create(&self) -> Result<NetworkHandle, FixtureError> {
        let _guard = self.lifecycle.lock().await;

        let current = self.state.lock().clone();
        match current {
            NetworkState::Created(handle) => return Ok(handle),
            NetworkState::Disposed => {
                return Err(FixtureError::Disposed {
                    fixture: self.name.clone(),
                })
            }
            NetworkState::Uninitialized => {}
        }

        let id = self.runtime.create_network(&self.name).await?;
        let handle = NetworkHandle {
            id,
            name: self.name.clone(),
        };
        tracing::info!(network = %self.name, id = %handle.id, "network created");
        *self.state.lock() = NetworkState::Created(handle.clone());
        Ok(handle)
    }

    /// The handle of the created network.
    pub fn handle(&self) -> Result<NetworkHandle, FixtureError> {
        match &*self.state.lock() {
            NetworkState::Created(handle) => Ok(handle.clone()),
            _ => Err(FixtureError::NotInitialized {
                fixture: self.name.clone(),
            }),
        }
    }

    /// Whether the network currently exists.
    pub fn is_created(&self) -> bool {
        matches!(&*self.state.lock(), NetworkState::Created(_))
    }

    /// Remove the network. A no-op when never created or already disposed.
    pub async fn dispose(&self) -> Result<(), FixtureError> {
        let _guard = self.lifecycle.lock().await;

        let previous = std::mem::replace(&mut *self.state.lock(), NetworkState::Disposed);
        match previous {
            NetworkState::Created(handle) => {
                if let Err(err) = ignore_missing(self.runtime.remove_network(&handle.id).await) {
                    *self.state.lock() = NetworkState::Created(handle);
                    return Err(err);
                }
                tracing::info!(network = %self.name, "network removed");
                Ok(())
            }
            NetworkState::Uninitialized | NetworkState::Disposed => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{InMemoryRuntime, RuntimeEvent, RuntimeOperation};

    fn fixture(runtime: &InMemoryRuntime) -> NetworkFixture {
        NetworkFixture::new(Arc::new(runtime.clone()), "shakedown")
    }

    #[test]
    fn test_names_are_unique_per_instance() {
        let runtime = InMemoryRuntime::new();
        let a = fixture(&runtime);
        let b = fixture(&runtime);
        assert!(a.name().starts_with("shakedown-"));
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn test_handle_before_create_is_not_initialized() {
        let runtime = InMemoryRuntime::new();
        let network = fixture(&runtime);
        assert!(matches!(
            network.handle(),
            Err(FixtureError::NotInitialized { .. })
        ));

        let created = network.create().await.unwrap();
        assert_eq!(network.handle().unwrap(), created);
        assert_eq!(network.create().await.unwrap(), created);
        assert_eq!(runtime.journal().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let runtime = InMemoryRuntime::new();
        let never_created = fixture(&runtime);
        never_created.dispose().await.unwrap();
        never_created.dispose().await.unwrap();

        let network = fixture(&runtime);
        network.create().await.unwrap();
        network.dispose().await.unwrap();
        network.dispose().await.unwrap();

        assert!(!network.is_created());
        assert!(runtime.list_active().await.unwrap().is_empty());
        assert_eq!(
            runtime.journal(),
            vec![
                RuntimeEvent::NetworkCreated(network.name().to_string()),
                RuntimeEvent::NetworkRemoved(network.name().to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_after_dispose_is_rejected() {
        let runtime = InMemoryRuntime::new();
        let network = fixture(&runtime);
        network.dispose().await.unwrap();
        assert!(matches!(
            network.create().await,
            Err(FixtureError::Disposed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_create_surfaces_runtime_error() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_on(RuntimeOperation::CreateNetwork, "shakedown");
        let network = fixture(&runtime);
        assert!(matches!(
            network.create().await,
            Err(FixtureError::Runtime(_))
        ));
        assert!(!network.is_created());
    }
}
