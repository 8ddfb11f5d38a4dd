//! One container attached to an environment's network.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use super::{ignore_missing, Fixture, FixtureState, ImageFixture, NetworkHandle};
use crate::error::{FixtureError, RuntimeError, SignalError};
use crate::runtime::{ContainerId, ContainerLogs, ContainerRequest, ContainerRuntime};
use crate::signals::SignalSource;
use crate::time::{Deadline, TimeProvider, TokioTimeProvider};

/// Number of log lines attached to a startup timeout.
const TIMEOUT_LOG_LINES: usize = 50;

/// Where the container image comes from.
#[derive(Clone)]
pub enum ImageSource {
    /// A pre-existing tag, pulled by the runtime if needed.
    Tag(String),
    /// An image built by this fixture before starting and removed after it.
    Build(Arc<ImageFixture>),
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            ImageSource::Build(image) => f.debug_tuple("Build").field(&image.tag()).finish(),
        }
    }
}

/// Predicate deciding when a started container is usable.
#[derive(Debug, Clone)]
pub enum ReadinessCondition {
    /// Ready as soon as it is started.
    None,
    /// Ready once the combined output matches the pattern.
    LogMatches(Regex),
    /// Ready once the published port accepts TCP connections.
    ///
    /// Each connection attempt is bounded by the remaining startup budget.
    TcpPort(u16),
}

/// Declarative description of a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image to run.
    pub image: ImageSource,
    /// Hostname on the shared network.
    pub hostname: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Ports published on random host ports.
    pub exposed_ports: Vec<u16>,
    /// Readiness predicate.
    pub readiness: ReadinessCondition,
    /// Budget for readiness.
    pub startup_timeout: Duration,
    /// Delay between readiness checks.
    pub poll_interval: Duration,
}

impl ContainerSpec {
    /// A spec with no ports, no env, immediate readiness and a 60 s budget.
    pub fn new(name: impl Into<String>, image: ImageSource) -> Self {
        Self {
            name: name.into(),
            image,
            hostname: None,
            env: BTreeMap::new(),
            exposed_ports: Vec::new(),
            readiness: ReadinessCondition::None,
            startup_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Set the hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add environment variables.
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Publish a container port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.exposed_ports.push(port);
        self
    }

    /// Set the readiness predicate.
    pub fn with_readiness(mut self, readiness: ReadinessCondition) -> Self {
        self.readiness = readiness;
        self
    }

    /// Set the readiness budget.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the readiness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct Running {
    container: ContainerId,
    ports: BTreeMap<u16, u16>,
    hostname: String,
}

#[derive(Debug, Clone)]
enum Inner {
    Uninitialized,
    ImageReady(String),
    Starting(ContainerId),
    Running(Running),
    Disposed,
}

impl Inner {
    fn phase(&self) -> FixtureState {
        match self {
            Inner::Uninitialized => FixtureState::Uninitialized,
            Inner::ImageReady(_) => FixtureState::ImageReady,
            Inner::Starting(_) => FixtureState::Starting,
            Inner::Running(_) => FixtureState::Running,
            Inner::Disposed => FixtureState::Disposed,
        }
    }

    fn container(&self) -> Option<&ContainerId> {
        match self {
            Inner::Starting(id) => Some(id),
            Inner::Running(running) => Some(&running.container),
            _ => None,
        }
    }
}

/// Whether `address` accepts a TCP connection within `budget`.
async fn accepts_connections(address: &str, budget: Duration) -> bool {
    matches!(
        tokio::time::timeout(budget, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// A container with a readiness-gated start and idempotent teardown.
pub struct ContainerFixture<T: TimeProvider = TokioTimeProvider> {
    spec: ContainerSpec,
    runtime: Arc<dyn ContainerRuntime>,
    time: T,
    state: Mutex<Inner>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ContainerFixture {
    /// Create an uninitialized fixture.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, spec: ContainerSpec) -> Self {
        Self::with_time(runtime, spec, TokioTimeProvider::new())
    }
}

impl<T: TimeProvider> ContainerFixture<T> {
    /// Create an uninitialized fixture that paces readiness polls with `time`.
    pub fn with_time(runtime: Arc<dyn ContainerRuntime>, spec: ContainerSpec, time: T) -> Self {
        Self {
            spec,
            runtime,
            time,
            state: Mutex::new(Inner::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// The declarative spec.
    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> FixtureState {
        self.state.lock().phase()
    }

    /// Host under which published ports are reachable.
    pub fn host(&self) -> &str {
        self.runtime.host()
    }

    fn not_initialized(&self) -> FixtureError {
        FixtureError::NotInitialized {
            fixture: self.spec.name.clone(),
        }
    }

    fn running(&self) -> Result<Running, FixtureError> {
        match &*self.state.lock() {
            Inner::Running(running) => Ok(running.clone()),
            _ => Err(self.not_initialized()),
        }
    }

    /// Host port bound to `container_port`.
    pub fn mapped_port(&self, container_port: u16) -> Result<u16, FixtureError> {
        let running = self.running()?;
        running.ports.get(&container_port).copied().ok_or_else(|| {
            RuntimeError::NotFound {
                kind: "published port",
                id: container_port.to_string(),
            }
            .into()
        })
    }

    /// Hostname on the shared network.
    pub fn hostname(&self) -> Result<String, FixtureError> {
        self.running().map(|running| running.hostname)
    }

    /// Runtime identifier of the running container.
    pub fn container_id(&self) -> Result<ContainerId, FixtureError> {
        self.running().map(|running| running.container)
    }

    /// Output of the container, once it exists.
    pub async fn logs(&self, since: Option<SystemTime>) -> Result<ContainerLogs, FixtureError> {
        let container = self
            .state
            .lock()
            .container()
            .cloned()
            .ok_or_else(|| self.not_initialized())?;
        Ok(self.runtime.logs(&container, since).await?)
    }

    async fn resolve_image(&self) -> Result<String, FixtureError> {
        match &self.spec.image {
            ImageSource::Tag(tag) => Ok(tag.clone()),
            ImageSource::Build(image) => Ok(image.build().await?.0),
        }
    }

    async fn is_ready(
        &self,
        container: &ContainerId,
        deadline: &Deadline,
    ) -> Result<bool, FixtureError> {
        match &self.spec.readiness {
            ReadinessCondition::None => Ok(true),
            ReadinessCondition::LogMatches(pattern) => {
                let logs = self.runtime.logs(container, None).await?;
                Ok(pattern.is_match(&logs.combined()))
            }
            ReadinessCondition::TcpPort(port) => {
                let host_port = self.runtime.mapped_port(container, *port).await?;
                let address = format!("{}:{host_port}", self.runtime.host());
                Ok(accepts_connections(&address, deadline.remaining()).await)
            }
        }
    }

    async fn wait_ready(&self, container: &ContainerId) -> Result<(), FixtureError> {
        let deadline = Deadline::after(self.spec.startup_timeout);
        loop {
            if self.is_ready(container, &deadline).await? {
                return Ok(());
            }
            if deadline.is_expired() {
                let last_logs = self
                    .runtime
                    .logs(container, None)
                    .await
                    .map(|logs| logs.tail(TIMEOUT_LOG_LINES))
                    .unwrap_or_default();
                tracing::error!(
                    fixture = %self.spec.name,
                    timeout = ?self.spec.startup_timeout,
                    "container did not become ready"
                );
                return Err(FixtureError::StartupTimeout {
                    fixture: self.spec.name.clone(),
                    timeout: self.spec.startup_timeout,
                    last_logs,
                });
            }
            self.time
                .sleep(self.spec.poll_interval.min(deadline.remaining()))
                .await;
        }
    }

    async fn start(&self, network: &NetworkHandle) -> Result<(), FixtureError> {
        let current = self.state.lock().clone();
        let image = match current {
            Inner::Running(_) => return Ok(()),
            Inner::Disposed => {
                return Err(FixtureError::Disposed {
                    fixture: self.spec.name.clone(),
                })
            }
            Inner::Starting(stale) => {
                ignore_missing(self.runtime.remove_container(&stale).await)?;
                self.resolve_image().await?
            }
            Inner::ImageReady(image) => image,
            Inner::Uninitialized => self.resolve_image().await?,
        };
        *self.state.lock() = Inner::ImageReady(image.clone());

        let request = ContainerRequest {
            name: self.spec.name.clone(),
            image,
            network: Some(network.id.clone()),
            hostname: self.spec.hostname.clone(),
            env: self.spec.env.clone(),
            exposed_ports: self.spec.exposed_ports.clone(),
        };
        let container = self.runtime.start_container(&request).await?;
        *self.state.lock() = Inner::Starting(container.clone());

        self.wait_ready(&container).await?;

        let mut ports = BTreeMap::new();
        for port in &self.spec.exposed_ports {
            ports.insert(*port, self.runtime.mapped_port(&container, *port).await?);
        }
        let hostname = self
            .spec
            .hostname
            .clone()
            .unwrap_or_else(|| self.spec.name.clone());

        tracing::info!(fixture = %self.spec.name, %container, ?ports, "container running");
        *self.state.lock() = Inner::Running(Running {
            container,
            ports,
            hostname,
        });
        Ok(())
    }

    async fn teardown(&self) -> Result<(), FixtureError> {
        let previous = std::mem::replace(&mut *self.state.lock(), Inner::Disposed);
        if let Some(container) = previous.container() {
            if let Err(err) = ignore_missing(self.runtime.remove_container(container).await) {
                *self.state.lock() = previous;
                return Err(err);
            }
            tracing::info!(fixture = %self.spec.name, "container removed");
        }

        if let ImageSource::Build(image) = &self.spec.image {
            image.dispose_image().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: TimeProvider> Fixture for ContainerFixture<T> {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn initialize(&self, network: &NetworkHandle) -> Result<(), FixtureError> {
        let _guard = self.lifecycle.lock().await;
        self.start(network).await
    }

    /// Removes the container, then any image this fixture built.
    async fn dispose(&self) -> Result<(), FixtureError> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await
    }
}

/// Signals are the container's standard output only.
#[async_trait]
impl<T: TimeProvider> SignalSource for ContainerFixture<T> {
    async fn signals_since(&self, since: SystemTime) -> Result<String, SignalError> {
        let logs = self.logs(Some(since)).await?;
        Ok(logs.stdout)
    }
}
