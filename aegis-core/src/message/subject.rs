//! Subject grammar shared by publishers and consumers.
//!
//! The five canonical forms (bit-exact, both sides):
//!
//! ```text
//! rpc.<service>.<method>
//! events.<domain>.<event_type>[.<subtype>...]
//! commands.<service>.<command>
//! commands.progress.<uuid>
//! commands.result.<uuid>
//! ```
//!
//! [`Subject`] is a concrete address (no wildcards); [`SubjectPattern`] may
//! contain `*` (one token) and `>` (trailing rest) for subscriptions.

// Layer 1: Standard library imports
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::domain::{EventType, InstanceId, MethodName, ServiceName};
use crate::error::{AegisError, Result};

/// A concrete, wildcard-free subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Validate and construct an arbitrary subject.
    ///
    /// Tokens are dot-separated, non-empty, and must not contain wildcards
    /// or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(invalid_subject(&value, "empty subject"));
        }
        for token in value.split('.') {
            if token.is_empty() {
                return Err(invalid_subject(&value, "empty token"));
            }
            if token == "*" || token == ">" {
                return Err(invalid_subject(&value, "wildcards not allowed"));
            }
            if token.chars().any(|c| c.is_whitespace()) {
                return Err(invalid_subject(&value, "whitespace not allowed"));
            }
        }
        Ok(Self(value))
    }

    /// `rpc.<service>.<method>`
    pub fn rpc(service: &ServiceName, method: &MethodName) -> Self {
        Self(format!("rpc.{service}.{method}"))
    }

    /// `events.<domain>.<event_type>[...]` — the event type already carries
    /// its domain as the first segment.
    pub fn event(event_type: &EventType) -> Self {
        Self(format!("events.{event_type}"))
    }

    /// `commands.<service>.<command>`
    pub fn command(service: &ServiceName, command: &MethodName) -> Self {
        Self(format!("commands.{service}.{command}"))
    }

    /// `commands.progress.<uuid>`
    pub fn command_progress(message_id: Uuid) -> Self {
        Self(format!("commands.progress.{message_id}"))
    }

    /// `commands.result.<uuid>`
    pub fn command_result(message_id: Uuid) -> Self {
        Self(format!("commands.result.{message_id}"))
    }

    /// Point-to-point inbox used for request/reply correlation.
    pub fn inbox() -> Self {
        Self(format!("_inbox.{}", Uuid::new_v4().simple()))
    }

    /// The subject as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Subject> for String {
    fn from(value: Subject) -> Self {
        value.0
    }
}

/// A subscription pattern; `*` matches one token, a trailing `>` matches the
/// remainder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectPattern(String);

impl SubjectPattern {
    /// Validate and construct a pattern.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(invalid_subject(&value, "empty pattern"));
        }
        let tokens: Vec<&str> = value.split('.').collect();
        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(invalid_subject(&value, "empty token"));
            }
            if *token == ">" && i != tokens.len() - 1 {
                return Err(invalid_subject(&value, "'>' must be the last token"));
            }
            if token.chars().any(|c| c.is_whitespace()) {
                return Err(invalid_subject(&value, "whitespace not allowed"));
            }
        }
        Ok(Self(value))
    }

    /// Pattern matching every RPC method of a service:
    /// `rpc.<service>.*`
    pub fn rpc_methods(service: &ServiceName) -> Self {
        Self(format!("rpc.{service}.*"))
    }

    /// Pattern for event subscriptions, e.g. `order.*` becomes
    /// `events.order.*`.
    pub fn events(type_pattern: &str) -> Result<Self> {
        Self::new(format!("events.{type_pattern}"))
    }

    /// Exact-match pattern for one subject.
    pub fn exact(subject: &Subject) -> Self {
        Self(subject.as_str().to_string())
    }

    /// Token-wise wildcard matching.
    pub fn matches(&self, subject: &str) -> bool {
        let mut pattern_tokens = self.0.split('.');
        let mut subject_tokens = subject.split('.');
        loop {
            match (pattern_tokens.next(), subject_tokens.next()) {
                (None, None) => return true,
                (Some(">"), Some(_)) => return true,
                (Some("*"), Some(_)) => continue,
                (Some(p), Some(s)) if p == s => continue,
                _ => return false,
            }
        }
    }

    /// The pattern as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SubjectPattern> for String {
    fn from(value: SubjectPattern) -> Self {
        value.0
    }
}

fn invalid_subject(value: &str, reason: &str) -> AegisError {
    AegisError::Validation {
        field: "subject",
        reason: format!("{reason}: {value:?}"),
    }
}

/// Whether a published subject matches one of the five canonical forms.
///
/// Inbox subjects (`_inbox.*`) and lifecycle traffic all reduce to these
/// forms or to the inbox prefix; anything else is a publisher bug.
pub fn conforms_to_grammar(subject: &str) -> bool {
    let tokens: Vec<&str> = subject.split('.').collect();
    match tokens.as_slice() {
        ["rpc", service, method] => {
            ServiceName::new(*service).is_ok() && MethodName::new(*method).is_ok()
        }
        ["events", rest @ ..] if rest.len() >= 2 => EventType::new(rest.join(".")).is_ok(),
        ["commands", "progress", id] | ["commands", "result", id] => Uuid::parse_str(id).is_ok(),
        ["commands", service, command] => {
            ServiceName::new(*service).is_ok() && MethodName::new(*command).is_ok()
        }
        ["_inbox", token] => !token.is_empty(),
        _ => false,
    }
}

/// KV key of a registry entry: `service-instances.<service>.<instance_id>`.
pub fn registry_key(service: &ServiceName, instance: &InstanceId) -> String {
    format!("service-instances.{service}.{instance}")
}

/// KV key prefix for all instances of one service.
pub fn registry_prefix(service: &ServiceName) -> String {
    format!("service-instances.{service}.")
}

/// KV key prefix for the whole registry.
pub const REGISTRY_PREFIX: &str = "service-instances.";

/// KV key of a group leader: `sticky-active.<service>.<group>.leader`.
pub fn leader_key(service: &ServiceName, group: &str) -> String {
    format!("sticky-active.{service}.{group}.leader")
}
