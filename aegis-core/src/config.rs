//! Service configuration with sensible defaults and environment loading.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::codec::SerializationFormat;
use crate::domain::{InstanceId, ServiceName};
use crate::election::{FailoverMode, FailoverPolicy};
use crate::error::{AegisError, Result};

/// Default TTL for registry entries (seconds).
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(30);

/// Default registry heartbeat cadence (seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default TTL for the leader key (seconds).
pub const DEFAULT_LEADER_TTL: Duration = Duration::from_secs(5);

/// Default jitter bound before a standby contends after seeing vacancy.
pub const DEFAULT_ELECTION_DELAY: Duration = Duration::from_secs(1);

/// Default graceful-stop budget.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one service instance.
///
/// Built either programmatically via [`AegisConfig::builder`] or from the
/// `AEGIS_*` environment variables via [`AegisConfig::from_env`]. Invalid
/// configuration surfaces as [`AegisError::Config`], which maps to process
/// exit code 64.
///
/// # Examples
///
/// ```rust
/// use aegis_core::config::AegisConfig;
///
/// let config = AegisConfig::builder("nats://localhost:4222", "pricing")
///     .unwrap()
///     .with_version("1.4.2")
///     .build()
///     .unwrap();
/// assert_eq!(config.service_name.as_str(), "pricing");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AegisConfig {
    /// Broker connection target, e.g. `nats://localhost:4222`.
    pub broker_url: String,

    /// This service's name.
    pub service_name: ServiceName,

    /// This instance's id; generated when not supplied.
    pub instance_id: InstanceId,

    /// Reported build version.
    pub version: String,

    /// TTL for registry entries.
    pub registry_ttl: Duration,

    /// Registry heartbeat cadence.
    pub heartbeat_interval: Duration,

    /// TTL for the leader key.
    pub leader_ttl: Duration,

    /// Leader renewal cadence; defaults to `leader_ttl / 3` when `None`.
    pub leader_heartbeat_interval: Option<Duration>,

    /// Jitter bound before contending after seeing leader vacancy.
    pub election_delay: Duration,

    /// Failover aggressiveness preset.
    pub failover_mode: FailoverMode,

    /// Graceful stop budget for draining in-flight handlers.
    pub drain_timeout: Duration,

    /// Wire format for all envelopes.
    pub serialization: SerializationFormat,
}

impl AegisConfig {
    /// Start building a configuration from the two required fields.
    pub fn builder(
        broker_url: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Result<AegisConfigBuilder> {
        Ok(AegisConfigBuilder {
            config: Self {
                broker_url: broker_url.into(),
                service_name: ServiceName::new(service_name)?,
                instance_id: InstanceId::generate(),
                version: "0.1.0".to_string(),
                registry_ttl: DEFAULT_REGISTRY_TTL,
                heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                leader_ttl: DEFAULT_LEADER_TTL,
                leader_heartbeat_interval: None,
                election_delay: DEFAULT_ELECTION_DELAY,
                failover_mode: FailoverMode::Balanced,
                drain_timeout: DEFAULT_DRAIN_TIMEOUT,
                serialization: SerializationFormat::MessagePack,
            },
        })
    }

    /// Load configuration from `AEGIS_*` environment variables.
    ///
    /// `AEGIS_BROKER_URL` and `AEGIS_SERVICE_NAME` are required; everything
    /// else falls back to its default.
    pub fn from_env() -> Result<Self> {
        let broker_url = require_env("AEGIS_BROKER_URL")?;
        let service_name = require_env("AEGIS_SERVICE_NAME")?;
        let mut builder = Self::builder(broker_url, service_name)?;

        if let Ok(id) = std::env::var("AEGIS_INSTANCE_ID") {
            builder = builder.with_instance_id(InstanceId::new(id)?);
        }
        if let Some(secs) = env_seconds("AEGIS_REGISTRY_TTL_SECONDS")? {
            builder = builder.with_registry_ttl(secs);
        }
        if let Some(secs) = env_seconds("AEGIS_HEARTBEAT_INTERVAL_SECONDS")? {
            builder = builder.with_heartbeat_interval(secs);
        }
        if let Some(secs) = env_seconds("AEGIS_LEADER_TTL_SECONDS")? {
            builder = builder.with_leader_ttl(secs);
        }
        if let Some(secs) = env_seconds("AEGIS_LEADER_HEARTBEAT_INTERVAL_SECONDS")? {
            builder = builder.with_leader_heartbeat_interval(secs);
        }
        if let Some(secs) = env_seconds("AEGIS_ELECTION_DELAY_SECONDS")? {
            builder = builder.with_election_delay(secs);
        }
        if let Ok(mode) = std::env::var("AEGIS_FAILOVER_MODE") {
            builder = builder.with_failover_mode(FailoverMode::parse(&mode)?);
        }
        if let Some(secs) = env_seconds("AEGIS_DRAIN_TIMEOUT_SECONDS")? {
            builder = builder.with_drain_timeout(secs);
        }
        if let Ok(format) = std::env::var("AEGIS_SERIALIZATION") {
            builder = builder.with_serialization(SerializationFormat::parse(&format)?);
        }

        builder.build()
    }

    /// Effective leader renewal cadence.
    pub fn effective_leader_heartbeat_interval(&self) -> Duration {
        self.leader_heartbeat_interval
            .unwrap_or(self.leader_ttl / 3)
    }

    /// The failover policy implied by this configuration.
    pub fn failover_policy(&self) -> FailoverPolicy {
        FailoverPolicy::for_mode(self.failover_mode)
            .with_leader_ttl(self.leader_ttl)
            .with_heartbeat_interval(self.effective_leader_heartbeat_interval())
            .with_election_delay(self.election_delay)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let config_err = |reason: String| AegisError::Config { reason };

        if self.broker_url.is_empty() {
            return Err(config_err("broker_url is required".to_string()));
        }
        if self.registry_ttl.is_zero() {
            return Err(config_err("registry_ttl must be > 0".to_string()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.registry_ttl {
            return Err(config_err(format!(
                "heartbeat_interval ({:?}) must be > 0 and < registry_ttl ({:?})",
                self.heartbeat_interval, self.registry_ttl
            )));
        }
        if self.leader_ttl.is_zero() {
            return Err(config_err("leader_ttl must be > 0".to_string()));
        }
        let leader_heartbeat = self.effective_leader_heartbeat_interval();
        if leader_heartbeat.is_zero() || leader_heartbeat >= self.leader_ttl {
            return Err(config_err(format!(
                "leader_heartbeat_interval ({leader_heartbeat:?}) must be > 0 and < leader_ttl ({:?})",
                self.leader_ttl
            )));
        }
        if self.drain_timeout.is_zero() {
            return Err(config_err("drain_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`AegisConfig`] with a fluent API.
#[derive(Debug, Clone)]
pub struct AegisConfigBuilder {
    config: AegisConfig,
}

impl AegisConfigBuilder {
    /// Set the instance id.
    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.config.instance_id = instance_id;
        self
    }

    /// Set the reported version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Set the registry entry TTL.
    pub fn with_registry_ttl(mut self, ttl: Duration) -> Self {
        self.config.registry_ttl = ttl;
        self
    }

    /// Set the registry heartbeat cadence.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the leader key TTL.
    pub fn with_leader_ttl(mut self, ttl: Duration) -> Self {
        self.config.leader_ttl = ttl;
        self
    }

    /// Set the leader renewal cadence.
    pub fn with_leader_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.leader_heartbeat_interval = Some(interval);
        self
    }

    /// Set the election jitter bound.
    pub fn with_election_delay(mut self, delay: Duration) -> Self {
        self.config.election_delay = delay;
        self
    }

    /// Set the failover preset.
    pub fn with_failover_mode(mut self, mode: FailoverMode) -> Self {
        self.config.failover_mode = mode;
        self
    }

    /// Set the graceful stop budget.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set the wire format.
    pub fn with_serialization(mut self, format: SerializationFormat) -> Self {
        self.config.serialization = format;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<AegisConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn require_env(name: &'static str) -> Result<String> {
    std::env::var(name).map_err(|_| AegisError::Config {
        reason: format!("{name} is required"),
    })
}

fn env_seconds(name: &'static str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|secs| *secs >= 0.0 && secs.is_finite())
            .map(Duration::from_secs_f64)
            .map(Some)
            .ok_or_else(|| AegisError::Config {
                reason: format!("{name} must be a non-negative number of seconds, got {raw:?}"),
            }),
    }
}
