//! Ready-made fixtures and topologies for the producer / broker / consumer
//! pipeline.
//!
//! | Topology       | Broker    | Server (consumer) | Client (producer) |
//! |----------------|-----------|-------------------|-------------------|
//! | `InMemory`     | in-memory | in-process        | in-process        |
//! | `HybridServer` | container | in-process        | container         |
//! | `HybridClient` | container | container         | in-process        |
//! | `EndToEnd`     | container | container         | container         |

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::config::{HarnessConfig, ServiceSettings};
use crate::environment::{CompositeEnvironment, InProcessService};
use crate::error::FixtureError;
use crate::fixture::{
    ContainerFixture, ContainerSpec, ImageFixture, ImageSource, ImageSpec, ReadinessCondition,
};
use crate::runtime::ContainerRuntime;

/// Log line the broker prints once it accepts connections.
pub const BROKER_READY_PATTERN: &str = "Server startup complete";

/// Log line the server prints once its bus is connected.
pub const SERVER_READY_PATTERN: &str = ".*Bus started.*";

/// Port the client listens on inside its container.
pub const CLIENT_HTTP_PORT: u16 = 8080;

fn log_readiness(pattern: &str) -> Result<ReadinessCondition, FixtureError> {
    Regex::new(pattern)
        .map(ReadinessCondition::LogMatches)
        .map_err(|err| FixtureError::Build {
            image: pattern.to_string(),
            reason: format!("invalid readiness pattern: {err}"),
        })
}

/// The message broker container, named `{prefix}-rabbitmq-{uuid}`.
pub fn broker_fixture(
    runtime: Arc<dyn ContainerRuntime>,
    config: &HarnessConfig,
) -> Result<ContainerFixture, FixtureError> {
    let broker = &config.broker;
    let name = format!("{}-rabbitmq-{}", config.network_prefix, uuid::Uuid::new_v4());
    let spec = ContainerSpec::new(name, ImageSource::Tag(broker.image.clone()))
        .with_hostname(broker.hostname.clone())
        .with_port(broker.amqp_port)
        .with_port(broker.management_port)
        .with_env("RABBITMQ_DEFAULT_USER", broker.username.clone())
        .with_env("RABBITMQ_DEFAULT_PASS", broker.password.clone())
        .with_readiness(log_readiness(BROKER_READY_PATTERN)?)
        .with_startup_timeout(config.fixtures.startup())
        .with_poll_interval(config.fixtures.readiness_poll());
    Ok(ContainerFixture::new(runtime, spec))
}

fn service_spec(config: &HarnessConfig, image: Arc<ImageFixture>, project: &str) -> ContainerSpec {
    let settings = ServiceSettings::on_network(&config.broker, config.retry.max_attempts);
    let name = format!("{}-{}", config.network_prefix, image.tag());
    ContainerSpec::new(name, ImageSource::Build(image))
        .with_hostname(project)
        .with_envs(settings.to_env())
        .with_startup_timeout(config.fixtures.startup())
        .with_poll_interval(config.fixtures.readiness_poll())
}

fn source_image(
    runtime: &Arc<dyn ContainerRuntime>,
    config: &HarnessConfig,
    project: &str,
    dockerfile: &Path,
) -> Arc<ImageFixture> {
    Arc::new(ImageFixture::new(
        runtime.clone(),
        ImageSpec {
            project: project.to_string(),
            context: config.sources.root.clone(),
            dockerfile: dockerfile.to_path_buf(),
        },
    ))
}

/// The consumer service, built from source, ready once its bus has started.
pub fn server_fixture(
    runtime: Arc<dyn ContainerRuntime>,
    config: &HarnessConfig,
) -> Result<ContainerFixture, FixtureError> {
    let image = source_image(&runtime, config, "Server", &config.sources.server_dockerfile);
    let spec = service_spec(config, image, "Server")
        .with_readiness(log_readiness(SERVER_READY_PATTERN)?);
    Ok(ContainerFixture::new(runtime, spec))
}

/// The producer service, built from source, publishing its HTTP port.
pub fn client_fixture(runtime: Arc<dyn ContainerRuntime>, config: &HarnessConfig) -> ContainerFixture {
    let image = source_image(&runtime, config, "Client", &config.sources.client_dockerfile);
    let spec = service_spec(config, image, "Client").with_port(CLIENT_HTTP_PORT);
    ContainerFixture::new(runtime, spec)
}

/// Settings an in-process service needs to reach a running broker fixture.
pub fn broker_settings(
    broker: &ContainerFixture,
    config: &HarnessConfig,
    retries: u32,
) -> Result<ServiceSettings, FixtureError> {
    let port = broker.mapped_port(config.broker.amqp_port)?;
    Ok(ServiceSettings::from_host(
        &config.broker,
        broker.host(),
        port,
        retries,
    ))
}

/// Where each half of the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Everything in-process over an in-memory bus.
    InMemory,
    /// In-process server; broker and client in containers.
    HybridServer,
    /// In-process client; broker and server in containers.
    HybridClient,
    /// Broker, server and client in containers.
    EndToEnd,
}

impl Topology {
    /// All topologies.
    pub const ALL: [Topology; 4] = [
        Topology::InMemory,
        Topology::HybridServer,
        Topology::HybridClient,
        Topology::EndToEnd,
    ];

    /// Whether a container runtime is needed.
    pub fn needs_containers(&self) -> bool {
        !matches!(self, Topology::InMemory)
    }

    /// Whether the consumer runs in a container.
    pub fn containerized_server(&self) -> bool {
        matches!(self, Topology::HybridClient | Topology::EndToEnd)
    }

    /// Whether the producer runs in a container.
    pub fn containerized_client(&self) -> bool {
        matches!(self, Topology::HybridServer | Topology::EndToEnd)
    }

    /// Name of the half that runs in-process next to containers, if any.
    pub fn in_process_service(&self) -> Option<&'static str> {
        match self {
            Topology::HybridServer => Some("Server"),
            Topology::HybridClient => Some("Client"),
            Topology::InMemory | Topology::EndToEnd => None,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::InMemory => "in-memory",
            Topology::HybridServer => "hybrid-server",
            Topology::HybridClient => "hybrid-client",
            Topology::EndToEnd => "end-to-end",
        };
        f.write_str(name)
    }
}

/// An environment for one topology plus handles to its parts.
pub struct TopologyEnvironment {
    /// The composite environment to initialize and dispose.
    pub environment: CompositeEnvironment,
    /// The broker container.
    pub broker: Arc<ContainerFixture>,
    /// The consumer container, when containerized.
    pub server: Option<Arc<ContainerFixture>>,
    /// The producer container, when containerized.
    pub client: Option<Arc<ContainerFixture>>,
    /// The in-process half, configured once the broker is running.
    pub in_process: Option<InProcessService>,
}

impl TopologyEnvironment {
    /// The container whose output carries the consumer's signals.
    pub fn signal_container(&self) -> Option<Arc<ContainerFixture>> {
        self.server.clone()
    }
}

/// Build the environment for `topology`.
///
/// Returns `None` for [`Topology::InMemory`], which needs no containers.
pub fn environment_for(
    topology: Topology,
    runtime: Arc<dyn ContainerRuntime>,
    config: &HarnessConfig,
) -> Result<Option<TopologyEnvironment>, FixtureError> {
    if !topology.needs_containers() {
        return Ok(None);
    }

    let broker = Arc::new(broker_fixture(runtime.clone(), config)?);
    let mut builder = CompositeEnvironment::builder(runtime.clone())
        .with_network_prefix(config.network_prefix.clone())
        .with_fixture(broker.clone());

    let server = if topology.containerized_server() {
        let server = Arc::new(server_fixture(runtime.clone(), config)?);
        builder = builder.with_fixture(server.clone());
        Some(server)
    } else {
        None
    };

    let client = if topology.containerized_client() {
        let client = Arc::new(client_fixture(runtime.clone(), config));
        builder = builder.with_fixture(client.clone());
        Some(client)
    } else {
        None
    };

    let in_process = match topology.in_process_service() {
        Some(name) => {
            let (service, publisher) = InProcessService::new(name);
            let resolved_broker = broker.clone();
            let config = config.clone();
            builder = builder.inject(publisher, move || {
                broker_settings(&resolved_broker, &config, config.retry.max_attempts)
            });
            Some(service)
        }
        None => None,
    };

    tracing::debug!(%topology, "environment assembled");
    Ok(Some(TopologyEnvironment {
        environment: builder.build(),
        broker,
        server,
        client,
        in_process,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;
    use crate::runtime::{InMemoryRuntime, RuntimeEvent};

    fn scripted_runtime() -> InMemoryRuntime {
        let runtime = InMemoryRuntime::new();
        runtime.script_startup_logs("rabbitmq", ["Server startup complete; 4 plugins started."]);
        runtime.script_startup_logs("server-", ["Bus started: rabbitmq://RabbitMQ/"]);
        runtime
    }

    #[test]
    fn test_topology_layout() {
        assert!(!Topology::InMemory.needs_containers());
        assert!(Topology::HybridServer.containerized_client());
        assert!(!Topology::HybridServer.containerized_server());
        assert!(Topology::HybridClient.containerized_server());
        assert!(!Topology::HybridClient.containerized_client());
        assert_eq!(Topology::EndToEnd.in_process_service(), None);
        assert_eq!(Topology::HybridClient.to_string(), "hybrid-client");
    }

    #[test]
    fn test_broker_fixture_follows_config() {
        let config = HarnessConfig::default().with_network_prefix("ci");
        let fixture = broker_fixture(Arc::new(InMemoryRuntime::new()), &config).unwrap();
        let spec = fixture.spec();
        assert!(spec.name.starts_with("ci-rabbitmq-"));
        assert_eq!(spec.hostname.as_deref(), Some("RabbitMQ"));
        assert_eq!(spec.exposed_ports, vec![5672, 15672]);
        assert_eq!(spec.env["RABBITMQ_DEFAULT_USER"], "guest");
    }

    #[tokio::test]
    async fn test_server_container_gets_network_settings() {
        let runtime = scripted_runtime();
        let config = HarnessConfig::default();
        let env = environment_for(Topology::HybridClient, Arc::new(runtime.clone()), &config)
            .unwrap()
            .unwrap();
        let server = env.server.clone().unwrap();

        env.environment.initialize().await.unwrap();

        let vars = runtime.env_of(server.name()).unwrap();
        assert_eq!(vars["RabbitMq__Host"], "RabbitMQ");
        assert_eq!(vars["RabbitMq__Port"], "5672");
        assert_eq!(vars["RabbitMq__Retries"], "10");
        assert_eq!(server.hostname().unwrap(), "Server");

        let client = env.in_process.as_ref().unwrap();
        assert_eq!(client.name(), "Client");
        let settings = client.settings().await.unwrap();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, env.broker.mapped_port(5672).unwrap());

        env.environment.dispose().await.unwrap();
        assert!(runtime.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_has_no_in_process_half() {
        let runtime = scripted_runtime();
        let env = environment_for(
            Topology::EndToEnd,
            Arc::new(runtime.clone()),
            &HarnessConfig::default(),
        )
        .unwrap()
        .unwrap();
        assert!(env.in_process.is_none());

        let handle = env.environment.initialize().await.unwrap();
        assert_eq!(handle.fixtures.len(), 3);
        assert!(env.client.as_ref().unwrap().mapped_port(CLIENT_HTTP_PORT).is_ok());

        let built = runtime
            .journal()
            .into_iter()
            .filter(|e| matches!(e, RuntimeEvent::ImageBuilt(_)))
            .count();
        assert_eq!(built, 2);
        env.environment.dispose().await.unwrap();
    }

    #[test]
    fn test_in_memory_needs_no_environment() {
        let env = environment_for(
            Topology::InMemory,
            Arc::new(InMemoryRuntime::new()),
            &HarnessConfig::default(),
        )
        .unwrap();
        assert!(env.is_none());
    }
}
