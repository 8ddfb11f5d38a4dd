//! Topologies against a real container engine.
//!
//! These tests need a reachable daemon, the `docker` CLI and the service
//! sources. They only run when `SHAKEDOWN_DOCKER=1`; set
//! `SHAKEDOWN_SOURCES` to the directory holding `Server/` and `Client/`.

use std::env;
use std::sync::Arc;

use shakedown::config::HarnessConfig;
use shakedown::fixture::Fixture;
use shakedown::presets::{broker_fixture, environment_for, Topology};
use shakedown::runtime::{ContainerRuntime, DockerCliRuntime};
use shakedown::message::STABILITY_HEADER;
use shakedown::signals::SUCCESS_MARKER;
use shakedown::verify::ExpectedOutcome;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shakedown=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn docker_runtime(test: &str) -> Option<Arc<DockerCliRuntime>> {
    if env::var("SHAKEDOWN_DOCKER").ok().as_deref() != Some("1") {
        eprintln!("skipping {test} (set SHAKEDOWN_DOCKER=1 to run)");
        return None;
    }
    init_tracing();
    let runtime = DockerCliRuntime::new();
    if !runtime.is_available().await {
        eprintln!("skipping {test}: docker daemon not reachable");
        return None;
    }
    Some(Arc::new(runtime))
}

fn config() -> HarnessConfig {
    let config = HarnessConfig::default().with_network_prefix("shakedown-it");
    match env::var("SHAKEDOWN_SOURCES") {
        Ok(root) => config.with_sources_root(root),
        Err(_) => config,
    }
}

#[tokio::test]
async fn docker_broker_starts_and_disposes() -> TestResult {
    let Some(runtime) = docker_runtime("docker_broker_starts_and_disposes").await else {
        return Ok(());
    };
    let config = config();
    let network = shakedown::fixture::NetworkFixture::new(runtime.clone(), &config.network_prefix);
    let handle = network.create().await?;

    let broker = broker_fixture(runtime.clone(), &config)?;
    broker.initialize(&handle).await?;
    let port = broker.mapped_port(config.broker.amqp_port)?;
    assert_ne!(port, 0);

    broker.dispose().await?;
    network.dispose().await?;
    assert!(runtime.list_active().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn docker_end_to_end_consumes_functional_message() -> TestResult {
    let Some(runtime) = docker_runtime("docker_end_to_end_consumes_functional_message").await
    else {
        return Ok(());
    };
    let config = config();
    let Some(env) = environment_for(Topology::EndToEnd, runtime.clone(), &config)? else {
        return Ok(());
    };

    let result = async {
        env.environment.initialize().await?;
        let server = env.signal_container().ok_or("end-to-end has a server container")?;
        let client = env.client.as_ref().ok_or("end-to-end has a client container")?;

        let verifier = config.verify.verifier(shakedown::TokioTimeProvider::new());
        let cursor = verifier.mark(&server).await?;

        let port = client.mapped_port(shakedown::presets::CLIENT_HTTP_PORT)?;
        let url = format!("http://{}:{port}/PaymentGenerator", client.host());
        let header = format!("{STABILITY_HEADER}: Functional");
        let status = tokio::process::Command::new("curl")
            .args(["-sf", "-o", "/dev/null", "-H", &header, &url])
            .status()
            .await?;
        assert!(status.success());

        let outcome = verifier
            .await_outcome(&server, &cursor, &ExpectedOutcome::Success.outcome_set())
            .await?
            .into_result()?;
        assert_eq!(outcome.matched_marker, Some(SUCCESS_MARKER));
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;

    env.environment.dispose().await?;
    assert!(runtime.list_active().await?.is_empty());
    result
}
