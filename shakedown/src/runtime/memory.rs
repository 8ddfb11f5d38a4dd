//! Deterministic in-memory [`ContainerRuntime`] for testing.
//!
//! Containers do not run anything. Their log output is whatever was scripted
//! for their image plus whatever tests append. Every successful operation is
//! written to a journal so tests can assert ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ActiveResources, BuildRequest, ContainerId, ContainerLogs, ContainerRequest,
    ContainerRuntime, ImageId, NetworkId,
};
use crate::error::RuntimeError;

/// Runtime operations that can be delayed or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOperation {
    /// `create_network`
    CreateNetwork,
    /// `remove_network`
    RemoveNetwork,
    /// `build_image`
    BuildImage,
    /// `remove_image`
    RemoveImage,
    /// `start_container`
    StartContainer,
    /// `remove_container`
    RemoveContainer,
}

/// Journal entry for one successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A network was created.
    NetworkCreated(String),
    /// A network was removed.
    NetworkRemoved(String),
    /// An image was built.
    ImageBuilt(String),
    /// An image was removed.
    ImageRemoved(String),
    /// A container was started.
    ContainerStarted {
        /// Container name.
        name: String,
        /// Image tag.
        image: String,
    },
    /// A container was removed.
    ContainerRemoved(String),
}

#[derive(Debug)]
struct ContainerState {
    name: String,
    env: BTreeMap<String, String>,
    ports: BTreeMap<u16, u16>,
    logs: Vec<(SystemTime, String)>,
    stderr: Vec<(SystemTime, String)>,
}

#[derive(Debug, Default)]
struct State {
    networks: BTreeMap<NetworkId, String>,
    images: BTreeSet<ImageId>,
    containers: BTreeMap<ContainerId, ContainerState>,
    next_id: u64,
    next_port: u16,
    journal: Vec<RuntimeEvent>,
    failures: Vec<(RuntimeOperation, String)>,
    delays: HashMap<RuntimeOperation, Duration>,
    scripted_logs: Vec<(String, Vec<String>)>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn check(&self, operation: RuntimeOperation, subject: &str) -> Result<(), RuntimeError> {
        let injected = self
            .failures
            .iter()
            .any(|(op, pattern)| *op == operation && subject.contains(pattern.as_str()));
        if injected {
            return Err(RuntimeError::Injected {
                operation: format!("{operation:?} {subject}"),
            });
        }
        Ok(())
    }

    fn container_by_name(&mut self, name: &str) -> Option<&mut ContainerState> {
        self.containers.values_mut().find(|c| c.name == name)
    }
}

/// In-memory runtime double.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct InMemoryRuntime {
    session: String,
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    /// Create an empty runtime. Host ports are handed out from 49152.
    pub fn new() -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            state: Arc::new(Mutex::new(State {
                next_port: 49152,
                ..State::default()
            })),
        }
    }

    /// Emit `lines` on startup for every container whose image tag contains
    /// `image_pattern`.
    pub fn script_startup_logs<I, S>(&self, image_pattern: impl Into<String>, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().scripted_logs.push((
            image_pattern.into(),
            lines.into_iter().map(Into::into).collect(),
        ));
    }

    /// Make `operation` fail for subjects containing `pattern`.
    pub fn fail_on(&self, operation: RuntimeOperation, pattern: impl Into<String>) {
        self.state.lock().failures.push((operation, pattern.into()));
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make `operation` take `delay` before completing.
    pub fn delay(&self, operation: RuntimeOperation, delay: Duration) {
        self.state.lock().delays.insert(operation, delay);
    }

    /// Append a log line to the container called `name`.
    pub fn append_log(&self, name: &str, line: impl Into<String>) -> Result<(), RuntimeError> {
        self.with_container(name, |c| c.logs.push((SystemTime::now(), line.into())))
    }

    /// Append a line to the standard error of the container called `name`.
    pub fn append_stderr(&self, name: &str, line: impl Into<String>) -> Result<(), RuntimeError> {
        self.with_container(name, |c| c.stderr.push((SystemTime::now(), line.into())))
    }

    fn with_container(
        &self,
        name: &str,
        f: impl FnOnce(&mut ContainerState),
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let container = state
            .container_by_name(name)
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "container",
                id: name.to_string(),
            })?;
        f(container);
        Ok(())
    }

    /// Environment the container called `name` was started with.
    pub fn env_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .container_by_name(name)
            .map(|c| c.env.clone())
    }

    /// Every successful operation so far, in order.
    pub fn journal(&self) -> Vec<RuntimeEvent> {
        self.state.lock().journal.clone()
    }

    async fn pause(&self, operation: RuntimeOperation) {
        let delay = self.state.lock().delays.get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn session(&self) -> &str {
        &self.session
    }

    fn host(&self) -> &str {
        "localhost"
    }

    async fn create_network(&self, name: &str) -> Result<NetworkId, RuntimeError> {
        self.pause(RuntimeOperation::CreateNetwork).await;
        let mut state = self.state.lock();
        state.check(RuntimeOperation::CreateNetwork, name)?;

        let id = NetworkId(state.next_id("net"));
        state.networks.insert(id.clone(), name.to_string());
        state.journal.push(RuntimeEvent::NetworkCreated(name.to_string()));
        Ok(id)
    }

    async fn remove_network(&self, id: &NetworkId) -> Result<(), RuntimeError> {
        self.pause(RuntimeOperation::RemoveNetwork).await;
        let mut state = self.state.lock();
        let name = state
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "network",
                id: id.to_string(),
            })?;
        state.check(RuntimeOperation::RemoveNetwork, &name)?;

        state.networks.remove(id);
        state.journal.push(RuntimeEvent::NetworkRemoved(name));
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<ImageId, RuntimeError> {
        self.pause(RuntimeOperation::BuildImage).await;
        let mut state = self.state.lock();
        state.check(RuntimeOperation::BuildImage, &request.tag)?;

        let id = ImageId(request.tag.clone());
        state.images.insert(id.clone());
        state.journal.push(RuntimeEvent::ImageBuilt(request.tag.clone()));
        Ok(id)
    }

    async fn remove_image(&self, id: &ImageId) -> Result<(), RuntimeError> {
        self.pause(RuntimeOperation::RemoveImage).await;
        let mut state = self.state.lock();
        if !state.images.contains(id) {
            return Err(RuntimeError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        state.check(RuntimeOperation::RemoveImage, id.as_str())?;

        state.images.remove(id);
        state.journal.push(RuntimeEvent::ImageRemoved(id.to_string()));
        Ok(())
    }

    async fn start_container(
        &self,
        request: &ContainerRequest,
    ) -> Result<ContainerId, RuntimeError> {
        self.pause(RuntimeOperation::StartContainer).await;
        let mut state = self.state.lock();
        state.check(RuntimeOperation::StartContainer, &request.name)?;

        if let Some(network) = &request.network {
            if !state.networks.contains_key(network) {
                return Err(RuntimeError::NotFound {
                    kind: "network",
                    id: network.to_string(),
                });
            }
        }
        if state.containers.values().any(|c| c.name == request.name) {
            return Err(RuntimeError::CommandFailed {
                command: format!("start {}", request.name),
                stderr: format!("container name {} is already in use", request.name),
            });
        }

        let mut ports = BTreeMap::new();
        for port in &request.exposed_ports {
            let host_port = state.next_port;
            state.next_port = state.next_port.wrapping_add(1).max(49152);
            ports.insert(*port, host_port);
        }

        let started = SystemTime::now();
        let logs = state
            .scripted_logs
            .iter()
            .filter(|(pattern, _)| request.image.contains(pattern.as_str()))
            .flat_map(|(_, lines)| lines.iter().map(|l| (started, l.clone())))
            .collect();

        let id = ContainerId(state.next_id("ctr"));
        state.containers.insert(
            id.clone(),
            ContainerState {
                name: request.name.clone(),
                env: request.env.clone(),
                ports,
                logs,
                stderr: Vec::new(),
            },
        );
        state.journal.push(RuntimeEvent::ContainerStarted {
            name: request.name.clone(),
            image: request.image.clone(),
        });
        Ok(id)
    }

    async fn mapped_port(
        &self,
        id: &ContainerId,
        container_port: u16,
    ) -> Result<u16, RuntimeError> {
        let state = self.state.lock();
        let container = state.containers.get(id).ok_or_else(|| RuntimeError::NotFound {
            kind: "container",
            id: id.to_string(),
        })?;
        container
            .ports
            .get(&container_port)
            .copied()
            .ok_or_else(|| RuntimeError::Unparseable {
                what: "port binding",
                raw: format!("{container_port}/tcp is not published"),
            })
    }

    async fn logs(
        &self,
        id: &ContainerId,
        since: Option<SystemTime>,
    ) -> Result<ContainerLogs, RuntimeError> {
        let state = self.state.lock();
        let container = state.containers.get(id).ok_or_else(|| RuntimeError::NotFound {
            kind: "container",
            id: id.to_string(),
        })?;

        let render = |lines: &[(SystemTime, String)]| {
            let mut text = String::new();
            for (at, line) in lines {
                if since.is_some_and(|since| *at < since) {
                    continue;
                }
                text.push_str(line);
                text.push('\n');
            }
            text
        };
        Ok(ContainerLogs {
            stdout: render(&container.logs),
            stderr: render(&container.stderr),
        })
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.pause(RuntimeOperation::RemoveContainer).await;
        let mut state = self.state.lock();
        let name = state
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::NotFound {
                kind: "container",
                id: id.to_string(),
            })?;
        state.check(RuntimeOperation::RemoveContainer, &name)?;

        state.containers.remove(id);
        state.journal.push(RuntimeEvent::ContainerRemoved(name));
        Ok(())
    }

    async fn list_active(&self) -> Result<ActiveResources, RuntimeError> {
        let state = self.state.lock();
        Ok(ActiveResources {
            networks: state.networks.keys().cloned().collect(),
            images: state.images.iter().cloned().collect(),
            containers: state.containers.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, image: &str, network: &NetworkId) -> ContainerRequest {
        ContainerRequest {
            name: name.into(),
            image: image.into(),
            network: Some(network.clone()),
            exposed_ports: vec![5672, 15672],
            ..ContainerRequest::default()
        }
    }

    #[tokio::test]
    async fn test_ports_are_allocated_per_container() {
        let runtime = InMemoryRuntime::new();
        let net = runtime.create_network("n").await.unwrap();
        let a = runtime.start_container(&request("a", "img", &net)).await.unwrap();
        let b = runtime.start_container(&request("b", "img", &net)).await.unwrap();

        assert_eq!(runtime.mapped_port(&a, 5672).await.unwrap(), 49152);
        assert_eq!(runtime.mapped_port(&a, 15672).await.unwrap(), 49153);
        assert_eq!(runtime.mapped_port(&b, 5672).await.unwrap(), 49154);
        assert!(runtime.mapped_port(&a, 8080).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_and_appended_logs() {
        let runtime = InMemoryRuntime::new();
        runtime.script_startup_logs("server", ["Starting", "Bus started: rabbitmq://RabbitMQ/"]);
        let net = runtime.create_network("n").await.unwrap();
        let id = runtime
            .start_container(&request("srv", "server-1234", &net))
            .await
            .unwrap();
        runtime.append_log("srv", "Payment succeeded: {}").unwrap();
        runtime.append_stderr("srv", "warn: DataProtection[35]").unwrap();

        let logs = runtime.logs(&id, None).await.unwrap();
        assert!(logs.stdout.contains("Bus started"));
        assert!(logs.stdout.ends_with("Payment succeeded: {}\n"));
        assert_eq!(logs.stderr, "warn: DataProtection[35]\n");
    }

    #[tokio::test]
    async fn test_injected_failures_and_not_found() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_on(RuntimeOperation::CreateNetwork, "doomed");

        assert!(matches!(
            runtime.create_network("doomed-net").await,
            Err(RuntimeError::Injected { .. })
        ));
        assert!(matches!(
            runtime.remove_network(&NetworkId("missing".into())).await,
            Err(RuntimeError::NotFound { kind: "network", .. })
        ));

        runtime.clear_failures();
        assert!(runtime.create_network("doomed-net").await.is_ok());
    }

    #[tokio::test]
    async fn test_journal_and_active_resources() {
        let runtime = InMemoryRuntime::new();
        let net = runtime.create_network("n").await.unwrap();
        let image = runtime
            .build_image(&BuildRequest {
                tag: "server-1".into(),
                context: ".".into(),
                dockerfile: "Server/Dockerfile".into(),
            })
            .await
            .unwrap();
        let ctr = runtime
            .start_container(&request("srv", "server-1", &net))
            .await
            .unwrap();
        assert!(!runtime.list_active().await.unwrap().is_empty());

        runtime.remove_container(&ctr).await.unwrap();
        runtime.remove_image(&image).await.unwrap();
        runtime.remove_network(&net).await.unwrap();

        assert!(runtime.list_active().await.unwrap().is_empty());
        assert_eq!(
            runtime.journal(),
            vec![
                RuntimeEvent::NetworkCreated("n".into()),
                RuntimeEvent::ImageBuilt("server-1".into()),
                RuntimeEvent::ContainerStarted {
                    name: "srv".into(),
                    image: "server-1".into()
                },
                RuntimeEvent::ContainerRemoved("srv".into()),
                RuntimeEvent::ImageRemoved("server-1".into()),
                RuntimeEvent::NetworkRemoved("n".into()),
            ]
        );
    }
}
