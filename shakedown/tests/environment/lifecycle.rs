//! Initialization and disposal ordering of a composite environment.

use std::time::Duration;

use shakedown::config::ServiceSettings;
use shakedown::environment::{CompositeEnvironment, InProcessService};
use shakedown::error::{FixtureError, RuntimeError};
use shakedown::fixture::{Fixture, FixtureState};
use shakedown::runtime::{ContainerRuntime, InMemoryRuntime, RuntimeEvent, RuntimeOperation};

use super::{broker, built_service, shared, waits_for_bus};

fn position(journal: &[RuntimeEvent], predicate: impl Fn(&RuntimeEvent) -> bool) -> usize {
    journal
        .iter()
        .position(predicate)
        .unwrap_or_else(|| panic!("event not found in {journal:?}"))
}

#[tokio::test]
async fn test_network_first_and_last() {
    let runtime = InMemoryRuntime::new();
    let server = built_service(&runtime, "Server");
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_network_prefix("order")
        .with_fixture(broker(&runtime))
        .with_fixture(server.clone())
        .build();

    let handle = env.initialize().await.unwrap();
    assert!(handle.network.name.starts_with("order-"));
    assert_eq!(handle.fixtures, vec!["broker".to_string(), "server".to_string()]);
    assert!(env.is_ready());

    env.dispose().await.unwrap();
    assert!(!env.is_ready());

    let journal = runtime.journal();
    assert!(matches!(journal.first(), Some(RuntimeEvent::NetworkCreated(_))));
    assert!(matches!(journal.last(), Some(RuntimeEvent::NetworkRemoved(_))));

    let container_removed = position(&journal, |e| {
        matches!(e, RuntimeEvent::ContainerRemoved(name) if name == "server")
    });
    let image_removed = position(&journal, |e| matches!(e, RuntimeEvent::ImageRemoved(_)));
    assert!(container_removed < image_removed);
    assert_eq!(server.state(), FixtureState::Disposed);
}

#[tokio::test]
async fn test_dispose_leaves_nothing_behind() {
    let runtime = InMemoryRuntime::new();
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .with_fixture(built_service(&runtime, "Server"))
        .with_fixture(built_service(&runtime, "Client"))
        .build();

    env.initialize().await.unwrap();
    let active = runtime.list_active().await.unwrap();
    assert_eq!(active.networks.len(), 1);
    assert_eq!(active.images.len(), 2);
    assert_eq!(active.containers.len(), 3);

    env.dispose().await.unwrap();
    assert!(runtime.list_active().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fixtures_start_concurrently() {
    let runtime = InMemoryRuntime::new();
    runtime.delay(RuntimeOperation::StartContainer, Duration::from_secs(5));
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .with_fixture(built_service(&runtime, "Server"))
        .with_fixture(built_service(&runtime, "Client"))
        .build();

    let started = tokio::time::Instant::now();
    env.initialize().await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_secs(5));

    env.dispose().await.unwrap();
}

#[tokio::test]
async fn test_initialize_twice_returns_same_handle() {
    let runtime = InMemoryRuntime::new();
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .build();

    let first = env.initialize().await.unwrap();
    let second = env.initialize().await.unwrap();
    assert_eq!(first, second);

    let networks = runtime
        .journal()
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::NetworkCreated(_)))
        .count();
    assert_eq!(networks, 1);
    env.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failed_start_cleans_up_and_surfaces_error() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_on(RuntimeOperation::StartContainer, "client");
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .with_fixture(built_service(&runtime, "Server"))
        .with_fixture(built_service(&runtime, "Client"))
        .build();

    let err = env.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        FixtureError::Runtime(RuntimeError::Injected { .. })
    ));
    assert!(!env.is_ready());
    assert!(runtime.list_active().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout_cleans_up() {
    let runtime = InMemoryRuntime::new();
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .with_fixture(waits_for_bus(&runtime, "server"))
        .build();

    match env.initialize().await {
        Err(FixtureError::StartupTimeout { fixture, timeout, .. }) => {
            assert_eq!(fixture, "server");
            assert_eq!(timeout, Duration::from_secs(5));
        }
        other => panic!("expected startup timeout, got {other:?}"),
    }
    assert!(runtime.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_build_is_not_retried() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_on(RuntimeOperation::BuildImage, "server");
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(built_service(&runtime, "Server"))
        .build();

    assert!(matches!(
        env.initialize().await,
        Err(FixtureError::Build { .. })
    ));
    let started = runtime
        .journal()
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::ContainerStarted { .. }))
        .count();
    assert_eq!(started, 0);
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let runtime = InMemoryRuntime::new();
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .build();

    env.initialize().await.unwrap();
    env.dispose().await.unwrap();
    env.dispose().await.unwrap();

    let removals = runtime
        .journal()
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::ContainerRemoved(_) | RuntimeEvent::NetworkRemoved(_)))
        .count();
    assert_eq!(removals, 2);
}

#[tokio::test]
async fn test_dispose_before_initialize_is_a_no_op() {
    let runtime = InMemoryRuntime::new();
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .build();

    env.dispose().await.unwrap();
    assert!(runtime.journal().is_empty());
}

#[tokio::test]
async fn test_dispose_continues_past_failures() {
    let runtime = InMemoryRuntime::new();
    let stuck = broker(&runtime);
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(stuck.clone())
        .with_fixture(built_service(&runtime, "Server"))
        .build();
    env.initialize().await.unwrap();

    runtime.fail_on(RuntimeOperation::RemoveContainer, "broker");
    match env.dispose().await {
        Err(FixtureError::Cleanup { failures }) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("broker: "));
        }
        other => panic!("expected cleanup error, got {other:?}"),
    }
    assert_eq!(stuck.state(), FixtureState::Running);
    let active = runtime.list_active().await.unwrap();
    assert_eq!(active.containers.len(), 1);
    assert!(active.images.is_empty());

    runtime.clear_failures();
    env.dispose().await.unwrap();
    assert!(runtime.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_settings_injected_after_fixtures_run() {
    let runtime = InMemoryRuntime::new();
    let rabbit = broker(&runtime);
    let (service, publisher) = InProcessService::<ServiceSettings>::new("Server");

    let resolved = rabbit.clone();
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(rabbit.clone())
        .inject(publisher, move || {
            assert_eq!(resolved.state(), FixtureState::Running);
            Ok(ServiceSettings {
                host: resolved.host().to_string(),
                port: resolved.mapped_port(5672)?,
                username: "guest".into(),
                password: "guest".into(),
                retries: 2,
            })
        })
        .build();

    assert!(!service.is_configured());
    env.initialize().await.unwrap();
    assert!(service.is_configured());

    let settings = tokio::time::timeout(Duration::from_secs(5), service.settings())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settings.host, "localhost");
    assert_eq!(settings.port, rabbit.mapped_port(5672).unwrap());
    assert_eq!(rabbit.name(), "broker");

    env.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failed_injection_cleans_up() {
    let runtime = InMemoryRuntime::new();
    let (service, publisher) = InProcessService::<u16>::new("Client");
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .inject(publisher, || {
            Err(FixtureError::NotInitialized {
                fixture: "upstream".into(),
            })
        })
        .build();

    assert!(env.initialize().await.is_err());
    assert!(runtime.list_active().await.unwrap().is_empty());
    let waited = tokio::time::timeout(Duration::from_secs(5), service.settings())
        .await
        .unwrap();
    assert!(matches!(waited, Err(FixtureError::NotInitialized { .. })));
}

#[tokio::test]
async fn test_dispose_before_publication_releases_readers() {
    let runtime = InMemoryRuntime::new();
    let (service, publisher) = InProcessService::<u16>::new("Server");
    let env = CompositeEnvironment::builder(shared(&runtime))
        .with_fixture(broker(&runtime))
        .inject(publisher, || Ok(5672))
        .build();

    env.dispose().await.unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(5), service.settings())
        .await
        .unwrap();
    assert!(waited.is_err());
    assert!(!service.is_configured());
}
