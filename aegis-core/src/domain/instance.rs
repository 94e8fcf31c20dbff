//! The registry entry describing one live service instance.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use super::identity::{InstanceId, ServiceName};
use super::status::{ServiceStatus, StickyActiveStatus};

/// One service instance as stored in the registry bucket.
///
/// `(service_name, instance_id)` is the primary key. `last_heartbeat` is
/// monotonic non-decreasing for a given instance; TTL expiry in the KV store
/// removes entries whose owner stopped heartbeating.
///
/// # Example
/// ```rust
/// use aegis_core::domain::{InstanceId, ServiceInstance, ServiceName, ServiceStatus};
/// use std::time::Duration;
///
/// let instance = ServiceInstance::new(
///     ServiceName::new("pricing").unwrap(),
///     InstanceId::new("pricing-0").unwrap(),
///     "1.2.0",
/// );
/// assert_eq!(instance.status, ServiceStatus::Active);
/// assert!(instance.is_healthy(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Name of the service this instance belongs to.
    pub service_name: ServiceName,

    /// Unique id of this instance within the service.
    pub instance_id: InstanceId,

    /// Reported build version.
    pub version: String,

    /// Current lifecycle status.
    pub status: ServiceStatus,

    /// Position within a single-active group; `None` for regular services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_active_status: Option<StickyActiveStatus>,

    /// Election group this instance contends in; `None` for regular services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_active_group: Option<String>,

    /// When the instance first registered.
    pub registered_at: DateTime<Utc>,

    /// When the instance last heartbeated.
    pub last_heartbeat: DateTime<Utc>,

    /// Free-form instance metadata (region, capabilities, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServiceInstance {
    /// Create a fresh instance record with `Active` status and current
    /// timestamps.
    pub fn new(
        service_name: ServiceName,
        instance_id: InstanceId,
        version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            service_name,
            instance_id,
            version: version.into(),
            status: ServiceStatus::Active,
            sticky_active_status: None,
            sticky_active_group: None,
            registered_at: now,
            last_heartbeat: now,
            metadata: HashMap::new(),
        }
    }

    /// Builder method: attach metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builder method: enroll the instance in a single-active group.
    ///
    /// New contenders start as `Standby`; the election coordinator promotes
    /// the winner.
    pub fn with_sticky_active_group(mut self, group: impl Into<String>) -> Self {
        self.sticky_active_group = Some(group.into());
        self.sticky_active_status = Some(StickyActiveStatus::Standby);
        self
    }

    /// Whether the instance counts as healthy: status is `Active`/`Standby`
    /// and the last heartbeat is younger than `heartbeat_timeout`.
    pub fn is_healthy(&self, heartbeat_timeout: Duration) -> bool {
        if !self.status.is_healthy_status() {
            return false;
        }
        let age = Utc::now().signed_duration_since(self.last_heartbeat);
        age.to_std()
            .map(|age| age < heartbeat_timeout)
            .unwrap_or(true) // heartbeat in the future counts as fresh
    }

    /// Seconds since registration.
    pub fn uptime_seconds(&self) -> f64 {
        let uptime = Utc::now().signed_duration_since(self.registered_at);
        uptime.num_milliseconds() as f64 / 1000.0
    }

    /// Record a heartbeat.
    ///
    /// `last_heartbeat` never moves backwards. A heartbeat from an
    /// `Unhealthy` instance recovers it to `Active`; the return value is
    /// `true` when that recovery happened so the caller can emit a
    /// `service.recovered` lifecycle event.
    pub fn heartbeat(&mut self) -> bool {
        let now = Utc::now();
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
        if self.status == ServiceStatus::Unhealthy {
            self.status = ServiceStatus::Active;
            return true;
        }
        false
    }

    /// Degrade the instance to `Unhealthy` unless already shut down.
    pub fn mark_unhealthy(&mut self) {
        if self.status.can_transition_to(ServiceStatus::Unhealthy) {
            self.status = ServiceStatus::Unhealthy;
        }
    }

    /// Terminal transition used during graceful stop.
    pub fn mark_shutdown(&mut self) {
        self.status = ServiceStatus::Shutdown;
    }

    /// Set the sticky-active position, e.g. after winning or losing an
    /// election.
    pub fn set_sticky_active_status(&mut self, status: StickyActiveStatus) {
        self.sticky_active_status = Some(status);
    }
}
