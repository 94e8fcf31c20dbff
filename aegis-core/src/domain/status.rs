//! Status and priority enums used across the registry and messaging layers.

// Layer 1: Standard library imports
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
// (none)

/// Lifecycle status of a registered service instance.
///
/// `Shutdown` is terminal: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    /// Serving traffic.
    Active,
    /// Healthy hot spare in a single-active group.
    Standby,
    /// Alive but degraded; excluded from healthy discovery.
    Unhealthy,
    /// Terminal: the instance is stopping or stopped.
    Shutdown,
}

impl ServiceStatus {
    /// Whether this status counts toward healthy discovery.
    pub fn is_healthy_status(self) -> bool {
        matches!(self, Self::Active | Self::Standby)
    }

    /// Whether the instance may transition from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        !matches!(self, Self::Shutdown) || next == Self::Shutdown
    }
}

impl Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Standby => "STANDBY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

/// Position of an instance within a single-active group.
///
/// Only populated on instances that participate in sticky-active election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StickyActiveStatus {
    /// The unique leader of the group.
    Active,
    /// A contender waiting for the leader key to vacate.
    Standby,
}

impl Display for StickyActiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Standby => "STANDBY",
        };
        write!(f, "{s}")
    }
}

/// Command priority, recorded in the envelope and surfaced to handlers.
///
/// Totally ordered: `Low < Normal < High < Critical`. The work queue never
/// reorders by priority; this is routing metadata only.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Elevated priority.
    High,
    /// Highest priority.
    Critical,
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_totally_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn shutdown_is_terminal() {
        assert!(!ServiceStatus::Shutdown.can_transition_to(ServiceStatus::Active));
        assert!(ServiceStatus::Shutdown.can_transition_to(ServiceStatus::Shutdown));
        assert!(ServiceStatus::Unhealthy.can_transition_to(ServiceStatus::Active));
    }

    #[test]
    fn statuses_serialize_uppercase() {
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Active).unwrap(),
            "\"ACTIVE\""
        );
        assert_eq!(
            serde_json::to_string(&StickyActiveStatus::Standby).unwrap(),
            "\"STANDBY\""
        );
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }

    #[test]
    fn healthy_statuses() {
        assert!(ServiceStatus::Active.is_healthy_status());
        assert!(ServiceStatus::Standby.is_healthy_status());
        assert!(!ServiceStatus::Unhealthy.is_healthy_status());
        assert!(!ServiceStatus::Shutdown.is_healthy_status());
    }
}
