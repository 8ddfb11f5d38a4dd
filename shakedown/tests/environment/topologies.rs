//! Topology presets brought up on the in-memory runtime.

use std::time::Duration;

use shakedown::config::HarnessConfig;
use shakedown::fixture::{Fixture, FixtureState};
use shakedown::presets::{environment_for, Topology, CLIENT_HTTP_PORT};
use shakedown::error::FixtureError;
use shakedown::runtime::{ContainerRuntime, InMemoryRuntime, RuntimeEvent, RuntimeOperation};
use shakedown::signals::SUCCESS_MARKER;
use shakedown::verify::{ExpectedOutcome, OutcomeVerifier};
use shakedown::TokioTimeProvider;

use super::{scripted_runtime, shared};

const SETTINGS_WAIT: Duration = Duration::from_secs(5);

fn started_images(journal: &[RuntimeEvent]) -> Vec<String> {
    journal
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::ContainerStarted { image, .. } => Some(image.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_hybrid_server_runs_broker_and_client() {
    let runtime = scripted_runtime();
    let config = HarnessConfig::default();
    let env = environment_for(Topology::HybridServer, shared(&runtime), &config)
        .unwrap()
        .unwrap();
    assert!(env.server.is_none());

    env.environment.initialize().await.unwrap();

    let images = started_images(&runtime.journal());
    assert_eq!(images.len(), 2);
    assert!(images.iter().any(|i| i == "rabbitmq:3.11.20-management"));
    assert!(images.iter().any(|i| i.starts_with("client-")));

    let client = env.client.as_ref().unwrap();
    assert_eq!(client.state(), FixtureState::Running);
    assert!(client.mapped_port(CLIENT_HTTP_PORT).is_ok());
    let client_env = runtime.env_of(client.name()).unwrap();
    assert_eq!(client_env["RabbitMq__Host"], "RabbitMQ");

    let server = env.in_process.as_ref().unwrap();
    assert_eq!(server.name(), "Server");
    assert!(server.is_configured());
    let settings = tokio::time::timeout(SETTINGS_WAIT, server.settings())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settings.port, env.broker.mapped_port(5672).unwrap());
    assert_eq!(settings.username, "guest");

    env.environment.dispose().await.unwrap();
    assert!(runtime.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_each_containerized_topology_cleans_up() {
    for topology in Topology::ALL.into_iter().filter(Topology::needs_containers) {
        let runtime = scripted_runtime();
        let env = environment_for(topology, shared(&runtime), &HarnessConfig::default())
            .unwrap()
            .unwrap();

        let handle = env.environment.initialize().await.unwrap();
        let expected = 1 + usize::from(topology.containerized_server())
            + usize::from(topology.containerized_client());
        assert_eq!(handle.fixtures.len(), expected, "{topology}");
        assert_eq!(env.in_process.is_some(), topology.in_process_service().is_some());

        env.environment.dispose().await.unwrap();
        assert!(
            runtime.list_active().await.unwrap().is_empty(),
            "{topology} leaked resources"
        );
    }
}

#[tokio::test]
async fn test_end_to_end_outcome_read_from_server_logs() {
    let runtime = scripted_runtime();
    let env = environment_for(Topology::EndToEnd, shared(&runtime), &HarnessConfig::default())
        .unwrap()
        .unwrap();
    env.environment.initialize().await.unwrap();

    let server = env.signal_container().unwrap();
    let verifier = OutcomeVerifier::new(TokioTimeProvider::new())
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10));
    let cursor = verifier.mark(&server).await.unwrap();

    let writer = runtime.clone();
    let name = server.name().to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer
            .append_log(&name, format!("{SUCCESS_MARKER}: {{\"Amount\": \"12.50\"}}"))
            .unwrap();
    });

    let result = verifier
        .await_outcome(&server, &cursor, &ExpectedOutcome::Success.outcome_set())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result.matched_marker, Some(SUCCESS_MARKER));
    assert!(!result.observed_contains("Bus started"));

    env.environment.dispose().await.unwrap();
}

#[tokio::test]
async fn test_server_stderr_does_not_shift_outcome_baseline() {
    let runtime = scripted_runtime();
    let env = environment_for(Topology::EndToEnd, shared(&runtime), &HarnessConfig::default())
        .unwrap()
        .unwrap();
    env.environment.initialize().await.unwrap();

    let server = env.signal_container().unwrap();
    let name = server.name().to_string();
    runtime
        .append_stderr(&name, "warn: Microsoft.AspNetCore.DataProtection[35]")
        .unwrap();

    let verifier = OutcomeVerifier::new(TokioTimeProvider::new())
        .with_timeout(Duration::from_secs(2))
        .with_poll_interval(Duration::from_millis(10));
    let cursor = verifier.mark(&server).await.unwrap();

    runtime.append_stderr(&name, "warn: retrying connection").unwrap();
    runtime
        .append_log(&name, format!("{SUCCESS_MARKER}: {{\"Amount\": \"1\"}}"))
        .unwrap();

    let result = verifier
        .await_outcome(&server, &cursor, &ExpectedOutcome::Success.outcome_set())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(
        result.matched_text.as_deref(),
        Some(format!("{SUCCESS_MARKER}: {{\"Amount\": \"1\"}}").as_str())
    );
    assert!(!result.observed_contains("warn:"));

    env.environment.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failed_broker_start_releases_in_process_service() {
    let runtime = scripted_runtime();
    runtime.fail_on(RuntimeOperation::StartContainer, "rabbitmq");
    let env = environment_for(Topology::HybridServer, shared(&runtime), &HarnessConfig::default())
        .unwrap()
        .unwrap();

    assert!(env.environment.initialize().await.is_err());
    let server = env.in_process.as_ref().unwrap();
    assert!(!server.is_configured());
    let waited = tokio::time::timeout(SETTINGS_WAIT, server.settings())
        .await
        .expect("settings wait must not hang after a failed initialize");
    assert!(matches!(waited, Err(FixtureError::NotInitialized { .. })));
    assert!(runtime.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_broker_startup_timeout_fails_topology() {
    let runtime = InMemoryRuntime::new();
    let mut config = HarnessConfig::default();
    config.fixtures.startup_ms = 200;
    config.fixtures.readiness_poll_ms = 20;

    let env = environment_for(Topology::HybridServer, shared(&runtime), &config)
        .unwrap()
        .unwrap();
    let err = env.environment.initialize().await.unwrap_err();
    assert!(err.to_string().contains("rabbitmq"), "{err}");
    assert!(runtime.list_active().await.unwrap().is_empty());
    let server = env.in_process.unwrap();
    let waited = tokio::time::timeout(SETTINGS_WAIT, server.settings()).await.unwrap();
    assert!(waited.is_err());
}
