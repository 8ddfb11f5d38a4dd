//! Harness configuration.
//!
//! Everything environment-specific (broker image and credentials, retry
//! bounds, timeouts, where the service sources live) is read from here rather
//! than hardcoded. A TOML file may override any subset; missing keys keep
//! their defaults.
//!
//! ```toml
//! network_prefix = "ci"
//!
//! [retry]
//! max_attempts = 5
//! delay_increment_ms = 250
//!
//! [verify]
//! timeout_ms = 20000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::time::TimeProvider;
use crate::verify::OutcomeVerifier;

/// Top-level harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Prefix of generated network and broker names.
    pub network_prefix: String,
    /// Broker container.
    pub broker: BrokerOptions,
    /// Redelivery bounds.
    pub retry: RetryConfig,
    /// Fixture startup budgets.
    pub fixtures: FixtureTimeouts,
    /// Outcome verification.
    pub verify: VerifyOptions,
    /// Service source tree.
    pub sources: SourceLayout,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            network_prefix: "shakedown".to_string(),
            broker: BrokerOptions::default(),
            retry: RetryConfig::default(),
            fixtures: FixtureTimeouts::default(),
            verify: VerifyOptions::default(),
            sources: SourceLayout::default(),
        }
    }
}

impl HarnessConfig {
    /// Preset for in-process services: two delivery attempts.
    pub fn in_process() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 2,
                ..RetryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded harness configuration");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.retry.policy()?;
        Ok(config)
    }

    /// Set the name prefix.
    pub fn with_network_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.network_prefix = prefix.into();
        self
    }

    /// Set the retry bounds.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the service source root.
    pub fn with_sources_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sources.root = root.into();
        self
    }
}

/// Broker container options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerOptions {
    /// Image tag.
    pub image: String,
    /// Hostname on the shared network.
    pub hostname: String,
    /// Messaging port.
    pub amqp_port: u16,
    /// Management UI port.
    pub management_port: u16,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            image: "rabbitmq:3.11.20-management".to_string(),
            hostname: "RabbitMQ".to_string(),
            amqp_port: 5672,
            management_port: 15672,
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

/// Retry bounds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total delivery attempts.
    pub max_attempts: u32,
    /// Lower delay bound.
    pub min_delay_ms: u64,
    /// Upper delay bound.
    pub max_delay_ms: u64,
    /// Step per attempt.
    pub delay_increment_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay_ms: 0,
            max_delay_ms: 2_000,
            delay_increment_ms: 500,
        }
    }
}

impl RetryConfig {
    /// The validated policy.
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Duration::from_millis(self.delay_increment_ms),
        )
    }
}

impl TryFrom<RetryConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(config: RetryConfig) -> Result<Self, Self::Error> {
        config.policy()
    }
}

/// Fixture startup budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixtureTimeouts {
    /// Readiness budget per container.
    pub startup_ms: u64,
    /// Delay between readiness checks.
    pub readiness_poll_ms: u64,
}

impl Default for FixtureTimeouts {
    fn default() -> Self {
        Self {
            startup_ms: 60_000,
            readiness_poll_ms: 250,
        }
    }
}

impl FixtureTimeouts {
    /// Readiness budget.
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// Readiness poll interval.
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }
}

/// Outcome verification options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyOptions {
    /// Wait budget.
    pub timeout_ms: u64,
    /// Poll interval.
    pub poll_interval_ms: u64,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl VerifyOptions {
    /// A verifier using these options.
    pub fn verifier<T: TimeProvider>(&self, time: T) -> OutcomeVerifier<T> {
        OutcomeVerifier::new(time)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

/// Where the service sources and build descriptors live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceLayout {
    /// Build context root.
    pub root: PathBuf,
    /// Server build descriptor, relative to `root`.
    pub server_dockerfile: PathBuf,
    /// Client build descriptor, relative to `root`.
    pub client_dockerfile: PathBuf,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            server_dockerfile: PathBuf::from("Server/Dockerfile"),
            client_dockerfile: PathBuf::from("Client/Dockerfile"),
        }
    }
}

/// Connection settings injected into a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Delivery attempts the service configures on its consumer.
    pub retries: u32,
}

impl ServiceSettings {
    /// Settings for a container on the broker's network.
    pub fn on_network(broker: &BrokerOptions, retries: u32) -> Self {
        Self {
            host: broker.hostname.clone(),
            port: broker.amqp_port,
            username: broker.username.clone(),
            password: broker.password.clone(),
            retries,
        }
    }

    /// Settings for an in-process service reaching a published port.
    pub fn from_host(
        broker: &BrokerOptions,
        host: impl Into<String>,
        port: u16,
        retries: u32,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: broker.username.clone(),
            password: broker.password.clone(),
            retries,
        }
    }

    /// Environment variables in the `Section__Key` convention.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        [
            ("RabbitMq__Host", self.host.clone()),
            ("RabbitMq__Port", self.port.to_string()),
            ("RabbitMq__Username", self.username.clone()),
            ("RabbitMq__Password", self.password.clone()),
            ("RabbitMq__Retries", self.retries.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}
