//! Election state machine.
//!
//! ```text
//!         start_election
//! IDLE ─────────────────► CAMPAIGNING
//!   ▲                         │
//!   │ release                 │ win      lose
//!   │                         ▼           ▼
//!   └──────────────────── ELECTED      FAILED
//!                             │           │
//!                             │ lost/     │ retry after
//!                             │ expired   │ election_delay
//!                             ▼           │
//!                          IDLE ◄─────────┘
//! ```

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
// (none)

/// Phase of the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionPhase {
    /// Not contending.
    Idle,
    /// An election attempt is in flight.
    Campaigning,
    /// This instance holds the leader key.
    Elected,
    /// The last attempt lost or errored; a retry is scheduled.
    Failed,
}

/// Current election state with its transition timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionState {
    /// Current phase.
    pub phase: ElectionPhase,
    /// When the phase was entered.
    pub since: DateTime<Utc>,
    /// Why the last attempt failed, if it did.
    pub last_error: Option<String>,
}

impl ElectionState {
    /// Fresh idle state.
    pub fn idle() -> Self {
        Self {
            phase: ElectionPhase::Idle,
            since: Utc::now(),
            last_error: None,
        }
    }

    /// Transition to a new phase, clearing any previous error.
    pub fn transition(&mut self, phase: ElectionPhase) {
        self.phase = phase;
        self.since = Utc::now();
        self.last_error = None;
    }

    /// Transition to `Failed` with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.phase = ElectionPhase::Failed;
        self.since = Utc::now();
        self.last_error = Some(reason.into());
    }

    /// Whether the state machine is idle.
    pub fn is_idle(&self) -> bool {
        self.phase == ElectionPhase::Idle
    }

    /// Whether an attempt is in flight.
    pub fn is_campaigning(&self) -> bool {
        self.phase == ElectionPhase::Campaigning
    }

    /// Whether this instance is the leader.
    pub fn is_elected(&self) -> bool {
        self.phase == ElectionPhase::Elected
    }

    /// Whether the last attempt failed.
    pub fn is_failed(&self) -> bool {
        self.phase == ElectionPhase::Failed
    }
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::idle()
    }
}
