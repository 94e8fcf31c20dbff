//! Error types shared by every component of the coordination core.
//!
//! All fallible operations in this crate return [`AegisError`]. Variants are
//! distinct named kinds rather than stringly-typed codes so callers can match
//! on the failure class: expected contention (`AlreadyExists`,
//! `RevisionMismatch`) is recovered locally, transient transport trouble is
//! retried with backoff, and fatal categories terminate startup with a
//! process exit code.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Process exit code for a clean stop.
pub const EXIT_OK: i32 = 0;

/// Process exit code for invalid or missing configuration.
pub const EXIT_CONFIG: i32 = 64;

/// Process exit code for a fatal runtime error.
pub const EXIT_RUNTIME: i32 = 70;

/// Process exit code after SIGINT.
pub const EXIT_SIGINT: i32 = 130;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AegisError>;

/// Errors raised by transport, KV, registry, election, and runtime code.
///
/// # Examples
///
/// ```rust
/// use aegis_core::error::AegisError;
///
/// fn classify(err: &AegisError) {
///     if err.is_fatal() {
///         eprintln!("giving up: {err}");
///     } else if err.is_retryable() {
///         eprintln!("will retry: {err}");
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum AegisError {
    /// Invalid or missing configuration detected at startup.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// A value object rejected its input during construction.
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Broker connection or send failure.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// An operation exceeded its deadline.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// An operation was attempted while the transport is disconnected.
    #[error("Not connected to the message broker")]
    NotConnected,

    /// Encoding or decoding a message payload failed.
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    /// A create-only KV write hit an existing key.
    ///
    /// Expected during election races; callers treat this as "lost the race",
    /// not as a failure.
    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    /// A compare-and-swap KV write observed a different revision.
    #[error("Revision mismatch for key '{key}' (expected revision {expected})")]
    RevisionMismatch { key: String, expected: u64 },

    /// A key (or registry entry) that the caller requires is absent or
    /// expired.
    ///
    /// Plain KV reads of missing keys return `None` instead of this error;
    /// this variant is reserved for operations that need the entry to exist,
    /// such as heartbeating an expired registration.
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// A user-supplied handler returned an error.
    ///
    /// Always wrapped into a structured `{success: false, error, message}`
    /// payload before it crosses a message boundary.
    #[error("Handler '{name}' failed: {message}")]
    Handler { name: String, message: String },

    /// Leader-key renewal failed and leadership was given up.
    #[error("Leadership lost: {reason}")]
    LeadershipLost { reason: String },
}

impl AegisError {
    /// Whether the failure is transient and a bounded retry is appropriate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::RevisionMismatch { .. }
        )
    }

    /// Whether the failure is expected contention during normal coordination.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::RevisionMismatch { .. }
        )
    }

    /// Whether the failure should terminate startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Validation { .. })
    }

    /// Exit code for services that fail with this error during startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Validation { .. } => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        }
    }

    /// Shorthand for a transport failure with a formatted reason.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Shorthand for a serialization failure with a formatted reason.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }
}
