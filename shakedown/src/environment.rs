//! Composite environments: one network, many fixtures, injected settings.
//!
//! # Lifecycle
//!
//! ```text
//! initialize:  network.create()
//!                  │
//!                  ▼
//!              join_all(fixture.initialize(network))     ← concurrent
//!                  │
//!                  ▼
//!              injections (resolve from running fixtures, publish once)
//!                  │
//!                  ▼
//!                ready
//!
//! dispose:     join_all(fixture.dispose())               ← concurrent, best effort
//!                  │
//!                  ▼
//!              network.dispose()                         ← always last
//! ```
//!
//! A failure anywhere in `initialize` tears down whatever was created and
//! surfaces the original error.
//!
//! # Settings handshake
//!
//! In-process services that need to reach a containerized dependency hold a
//! [`SettingsSubscriber`]. The environment owns the matching
//! [`SettingsPublisher`] and fires it exactly once, after every fixture is
//! running. Reads before that point wait; they never see partial values.
//! When initialization fails, or the environment is disposed first, the
//! publisher is dropped and waiting readers get
//! [`FixtureError::NotInitialized`].

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};

use crate::config::ServiceSettings;
use crate::error::FixtureError;
use crate::fixture::{Fixture, NetworkFixture, NetworkHandle};
use crate::runtime::ContainerRuntime;

/// Sending half of a one-shot settings handshake.
///
/// The value lands in a slot shared with the subscriber, so it is visible
/// the moment it is published.
#[derive(Debug)]
pub struct SettingsPublisher<T> {
    target: String,
    slot: Arc<OnceCell<T>>,
    published: watch::Sender<bool>,
}

impl<T> SettingsPublisher<T> {
    /// Name of the service the settings are for.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Publish the settings. Returns false when the subscriber is gone.
    pub fn publish(self, settings: T) -> bool {
        if self.slot.set(settings).is_err() {
            return false;
        }
        self.published.send(true).is_ok()
    }
}

/// Receiving half of a one-shot settings handshake.
#[derive(Debug)]
pub struct SettingsSubscriber<T> {
    target: String,
    slot: Arc<OnceCell<T>>,
    published: watch::Receiver<bool>,
}

impl<T> SettingsSubscriber<T> {
    /// The settings, waiting for them to be published.
    ///
    /// Fails when the publisher was dropped without publishing.
    pub async fn wait(&self) -> Result<&T, FixtureError> {
        let mut published = self.published.clone();
        loop {
            if let Some(value) = self.slot.get() {
                return Ok(value);
            }
            if published.changed().await.is_err() {
                return self.slot.get().ok_or_else(|| FixtureError::NotInitialized {
                    fixture: self.target.clone(),
                });
            }
        }
    }

    /// The settings if already published.
    pub fn try_get(&self) -> Option<&T> {
        self.slot.get()
    }
}

/// Create a connected publisher / subscriber pair for `target`.
pub fn settings_handshake<T>(
    target: impl Into<String>,
) -> (SettingsPublisher<T>, SettingsSubscriber<T>) {
    let target = target.into();
    let slot = Arc::new(OnceCell::new());
    let (tx, rx) = watch::channel(false);
    (
        SettingsPublisher {
            target: target.clone(),
            slot: slot.clone(),
            published: tx,
        },
        SettingsSubscriber {
            target,
            slot,
            published: rx,
        },
    )
}

/// A service running inside the test process, configured by the environment.
#[derive(Debug)]
pub struct InProcessService<T = ServiceSettings> {
    name: String,
    settings: SettingsSubscriber<T>,
}

impl<T> InProcessService<T> {
    /// Create the service and the publisher the environment will fire.
    pub fn new(name: impl Into<String>) -> (Self, SettingsPublisher<T>) {
        let name = name.into();
        let (publisher, settings) = settings_handshake(name.clone());
        (Self { name, settings }, publisher)
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The injected settings, waiting for the environment if necessary.
    pub async fn settings(&self) -> Result<&T, FixtureError> {
        self.settings.wait().await
    }

    /// Whether the settings have been published.
    pub fn is_configured(&self) -> bool {
        self.settings.try_get().is_some()
    }
}

type Apply = Box<dyn FnOnce() -> Result<(), FixtureError> + Send>;

struct Injection {
    target: String,
    apply: Apply,
}

/// What a successful [`CompositeEnvironment::initialize`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    /// The shared network.
    pub network: NetworkHandle,
    /// Names of the running fixtures, in registration order.
    pub fixtures: Vec<String>,
}

/// Builder for [`CompositeEnvironment`].
pub struct EnvironmentBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    network_prefix: String,
    fixtures: Vec<Arc<dyn Fixture>>,
    injections: Vec<Injection>,
}

impl EnvironmentBuilder {
    /// Start a builder on `runtime`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            network_prefix: "shakedown".to_string(),
            fixtures: Vec::new(),
            injections: Vec::new(),
        }
    }

    /// Prefix of the generated network name.
    pub fn with_network_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.network_prefix = prefix.into();
        self
    }

    /// Add a fixture that depends only on the network.
    pub fn with_fixture<F: Fixture + 'static>(mut self, fixture: Arc<F>) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Publish `resolve()` to `publisher` once every fixture is running.
    pub fn inject<T, F>(mut self, publisher: SettingsPublisher<T>, resolve: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, FixtureError> + Send + 'static,
    {
        let target = publisher.target().to_string();
        let service = target.clone();
        self.injections.push(Injection {
            target,
            apply: Box::new(move || {
                let settings = resolve()?;
                if !publisher.publish(settings) {
                    tracing::debug!(%service, "settings subscriber dropped before injection");
                }
                Ok(())
            }),
        });
        self
    }

    /// Finish the environment.
    pub fn build(self) -> CompositeEnvironment {
        CompositeEnvironment {
            network: NetworkFixture::new(self.runtime.clone(), &self.network_prefix),
            runtime: self.runtime,
            fixtures: self.fixtures,
            injections: Mutex::new(self.injections),
            ready: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }
}

/// Network plus fixtures with concurrent init and best-effort teardown.
pub struct CompositeEnvironment {
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkFixture,
    fixtures: Vec<Arc<dyn Fixture>>,
    injections: Mutex<Vec<Injection>>,
    ready: Mutex<Option<EnvironmentHandle>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl CompositeEnvironment {
    /// Start building an environment.
    pub fn builder(runtime: Arc<dyn ContainerRuntime>) -> EnvironmentBuilder {
        EnvironmentBuilder::new(runtime)
    }

    /// The runtime every fixture uses.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// The shared network fixture.
    pub fn network(&self) -> &NetworkFixture {
        &self.network
    }

    /// Whether initialization completed.
    pub fn is_ready(&self) -> bool {
        self.ready.lock().is_some()
    }

    /// Bring everything up.
    ///
    /// Calling it again after success returns the same handle.
    pub async fn initialize(&self) -> Result<EnvironmentHandle, FixtureError> {
        let _guard = self.lifecycle.lock().await;
        let existing = self.ready.lock().clone();
        if let Some(handle) = existing {
            return Ok(handle);
        }

        match self.bring_up().await {
            Ok(handle) => {
                tracing::info!(
                    network = %handle.network.name,
                    fixtures = handle.fixtures.len(),
                    "environment ready"
                );
                *self.ready.lock() = Some(handle.clone());
                Ok(handle)
            }
            Err(err) => {
                tracing::error!(error = %err, "environment initialization failed, cleaning up");
                if let Err(cleanup) = self.tear_down().await {
                    tracing::warn!(error = %cleanup, "cleanup after failed initialization was incomplete");
                }
                Err(err)
            }
        }
    }

    async fn bring_up(&self) -> Result<EnvironmentHandle, FixtureError> {
        let network = self.network.create().await?;

        let results = join_all(self.fixtures.iter().map(|f| f.initialize(&network))).await;
        let mut first_error = None;
        for (fixture, result) in self.fixtures.iter().zip(results) {
            if let Err(err) = result {
                tracing::error!(fixture = fixture.name(), error = %err, "fixture failed to initialize");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let injections = std::mem::take(&mut *self.injections.lock());
        for injection in injections {
            tracing::debug!(service = %injection.target, "injecting settings");
            (injection.apply)()?;
        }

        Ok(EnvironmentHandle {
            network,
            fixtures: self.fixtures.iter().map(|f| f.name().to_string()).collect(),
        })
    }

    async fn tear_down(&self) -> Result<(), FixtureError> {
        let unpublished = std::mem::take(&mut *self.injections.lock());
        for injection in &unpublished {
            tracing::debug!(service = %injection.target, "releasing unpublished settings");
        }
        drop(unpublished);

        let results = join_all(self.fixtures.iter().map(|f| f.dispose())).await;
        let mut failures: Vec<String> = self
            .fixtures
            .iter()
            .zip(results)
            .filter_map(|(fixture, result)| {
                result.err().map(|err| format!("{}: {err}", fixture.name()))
            })
            .collect();

        if let Err(err) = self.network.dispose().await {
            failures.push(format!("{}: {err}", self.network.name()));
        }

        *self.ready.lock() = None;
        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                tracing::warn!(%failure, "disposal failed");
            }
            Err(FixtureError::Cleanup { failures })
        }
    }

    /// Tear everything down. Safe to call repeatedly.
    ///
    /// Every fixture is disposed even when some fail; the network goes last.
    pub async fn dispose(&self) -> Result<(), FixtureError> {
        let _guard = self.lifecycle.lock().await;
        self.tear_down().await?;
        tracing::info!(network = %self.network.name(), "environment disposed");
        Ok(())
    }
}
