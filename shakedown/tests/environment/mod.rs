//! Shared helpers for environment tests.

use std::sync::Arc;

use regex::Regex;
use shakedown::fixture::{
    ContainerFixture, ContainerSpec, ImageFixture, ImageSource, ImageSpec, ReadinessCondition,
};
use shakedown::runtime::{ContainerRuntime, InMemoryRuntime};

mod lifecycle;
mod topologies;

/// Runtime with the startup lines the broker and server presets wait for.
pub fn scripted_runtime() -> InMemoryRuntime {
    let runtime = InMemoryRuntime::new();
    runtime.script_startup_logs("rabbitmq", ["Server startup complete; 4 plugins started."]);
    runtime.script_startup_logs("server-", ["Bus started: rabbitmq://RabbitMQ/"]);
    runtime
}

pub fn shared(runtime: &InMemoryRuntime) -> Arc<dyn ContainerRuntime> {
    Arc::new(runtime.clone())
}

pub fn broker(runtime: &InMemoryRuntime) -> Arc<ContainerFixture> {
    Arc::new(ContainerFixture::new(
        shared(runtime),
        ContainerSpec::new("broker", ImageSource::Tag("rabbitmq:3.11.20-management".into()))
            .with_hostname("RabbitMQ")
            .with_port(5672)
            .with_port(15672),
    ))
}

pub fn built_service(runtime: &InMemoryRuntime, project: &str) -> Arc<ContainerFixture> {
    let image = Arc::new(ImageFixture::new(
        shared(runtime),
        ImageSpec {
            project: project.into(),
            context: ".".into(),
            dockerfile: format!("{project}/Dockerfile").into(),
        },
    ));
    Arc::new(ContainerFixture::new(
        shared(runtime),
        ContainerSpec::new(project.to_lowercase(), ImageSource::Build(image))
            .with_hostname(project),
    ))
}

pub fn waits_for_bus(runtime: &InMemoryRuntime, name: &str) -> Arc<ContainerFixture> {
    Arc::new(ContainerFixture::new(
        shared(runtime),
        ContainerSpec::new(name, ImageSource::Tag("never-ready".into()))
            .with_readiness(ReadinessCondition::LogMatches(
                Regex::new(".*Bus started.*").unwrap(),
            ))
            .with_startup_timeout(std::time::Duration::from_secs(5)),
    ))
}
