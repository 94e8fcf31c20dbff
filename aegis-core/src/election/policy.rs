//! Failover policy presets and tuning knobs.

// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::error::{AegisError, Result};

/// Failover aggressiveness preset; sets defaults for every other knob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    /// Short TTLs, fast failover, more broker traffic.
    Aggressive,
    /// The default trade-off.
    #[default]
    Balanced,
    /// Long TTLs, slow failover, minimal churn.
    Conservative,
}

impl FailoverMode {
    /// Parse the `failover_mode` config value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "aggressive" => Ok(Self::Aggressive),
            "balanced" => Ok(Self::Balanced),
            "conservative" => Ok(Self::Conservative),
            other => Err(AegisError::Config {
                reason: format!(
                    "unknown failover_mode {other:?} (expected aggressive|balanced|conservative)"
                ),
            }),
        }
    }
}

impl Display for FailoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aggressive => "aggressive",
            Self::Balanced => "balanced",
            Self::Conservative => "conservative",
        };
        write!(f, "{s}")
    }
}

/// Tuning bundle for one election group.
///
/// # Example
/// ```rust
/// use aegis_core::election::FailoverPolicy;
/// use std::time::Duration;
///
/// let policy = FailoverPolicy::balanced().with_leader_ttl(Duration::from_secs(8));
/// assert_eq!(policy.leader_ttl, Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailoverPolicy {
    /// Preset these values came from.
    pub mode: FailoverMode,
    /// Seconds the leader key lives without renewal.
    pub leader_ttl: Duration,
    /// How often the elected leader renews the key.
    pub heartbeat_interval: Duration,
    /// Upper bound of the randomized wait before a standby contends after
    /// seeing vacancy.
    pub election_delay: Duration,
    /// Hard cap on one election attempt; exceeding it forces `Failed`.
    pub max_election_time: Duration,
    /// Consecutive renewal transport errors tolerated before leadership is
    /// given up.
    pub max_failures: u32,
}

impl FailoverPolicy {
    /// Fast failover: 2 s TTL.
    pub fn aggressive() -> Self {
        Self {
            mode: FailoverMode::Aggressive,
            leader_ttl: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(600),
            election_delay: Duration::from_millis(500),
            max_election_time: Duration::from_secs(5),
            max_failures: 2,
        }
    }

    /// The default trade-off: 5 s TTL.
    pub fn balanced() -> Self {
        Self {
            mode: FailoverMode::Balanced,
            leader_ttl: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(1_500),
            election_delay: Duration::from_secs(1),
            max_election_time: Duration::from_secs(10),
            max_failures: 3,
        }
    }

    /// Minimal churn: 10 s TTL.
    pub fn conservative() -> Self {
        Self {
            mode: FailoverMode::Conservative,
            leader_ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            election_delay: Duration::from_secs(2),
            max_election_time: Duration::from_secs(15),
            max_failures: 5,
        }
    }

    /// The preset for a mode.
    pub fn for_mode(mode: FailoverMode) -> Self {
        match mode {
            FailoverMode::Aggressive => Self::aggressive(),
            FailoverMode::Balanced => Self::balanced(),
            FailoverMode::Conservative => Self::conservative(),
        }
    }

    /// Builder method: override the leader TTL (renewal cadence follows at
    /// a third unless overridden afterwards).
    pub fn with_leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = ttl;
        self.heartbeat_interval = ttl / 3;
        self
    }

    /// Builder method: override the renewal cadence.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Builder method: override the election jitter bound.
    pub fn with_election_delay(mut self, delay: Duration) -> Self {
        self.election_delay = delay;
        self
    }

    /// Builder method: override the election attempt cap.
    pub fn with_max_election_time(mut self, cap: Duration) -> Self {
        self.max_election_time = cap;
        self
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.leader_ttl.is_zero() {
            return Err(AegisError::Config {
                reason: "leader_ttl must be > 0".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.leader_ttl {
            return Err(AegisError::Config {
                reason: format!(
                    "heartbeat_interval ({:?}) must be > 0 and < leader_ttl ({:?})",
                    self.heartbeat_interval, self.leader_ttl
                ),
            });
        }
        Ok(())
    }

    /// A fresh random delay in `[0, election_delay]`, drawn per vacancy so
    /// simultaneous contenders spread out.
    pub fn jittered_election_delay(&self) -> Duration {
        if self.election_delay.is_zero() {
            return Duration::ZERO;
        }
        self.election_delay.mul_f64(rand::random::<f64>())
    }
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::balanced()
    }
}
