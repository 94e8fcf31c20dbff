//! Validated identifier value objects.
//!
//! Each newtype validates on construction and serializes as its inner string,
//! so wire payloads stay plain while in-process values are always well
//! formed.

// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::str::FromStr;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::error::AegisError;

/// Maximum length of a service name.
const SERVICE_NAME_MAX: usize = 64;

/// Maximum length of an instance identifier.
const INSTANCE_ID_MAX: usize = 128;

/// Maximum length of a method or command name.
const METHOD_NAME_MAX: usize = 64;

/// Maximum length of a dotted event type.
const EVENT_TYPE_MAX: usize = 64;

/// Name of a service, e.g. `order-service`.
///
/// Lowercase, starts with a letter, continues with `[a-z0-9_-]`, at most 64
/// characters, and never ends in `-` or `_`.
///
/// # Example
/// ```rust
/// use aegis_core::domain::ServiceName;
///
/// let name = ServiceName::new("pricing-service").unwrap();
/// assert_eq!(name.as_str(), "pricing-service");
/// assert!(ServiceName::new("Pricing").is_err());
/// assert!(ServiceName::new("pricing-").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Validate and construct a service name.
    pub fn new(value: impl Into<String>) -> Result<Self, AegisError> {
        let value = value.into();
        let invalid = |reason: &str| AegisError::Validation {
            field: "service_name",
            reason: format!("{reason}: {value:?}"),
        };

        if value.is_empty() || value.len() > SERVICE_NAME_MAX {
            return Err(invalid("must be 1-64 characters"));
        }
        let mut chars = value.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return Err(invalid("must start with a lowercase letter")),
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid("allowed characters are [a-z0-9_-]"));
        }
        if value.ends_with('-') || value.ends_with('_') {
            return Err(invalid("must not end in '-' or '_'"));
        }
        Ok(Self(value))
    }

    /// The validated name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceName {
    type Error = AegisError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for ServiceName {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<ServiceName> for String {
    fn from(value: ServiceName) -> Self {
        value.0
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one running instance of a service.
///
/// Non-empty, at most 128 characters, no whitespace or control characters.
/// Normally a UUID or a pod name; [`InstanceId::generate`] produces a fresh
/// UUIDv4-based id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Validate and construct an instance id.
    pub fn new(value: impl Into<String>) -> Result<Self, AegisError> {
        let value = value.into();
        let invalid = |reason: &str| AegisError::Validation {
            field: "instance_id",
            reason: format!("{reason}: {value:?}"),
        };

        if value.is_empty() || value.len() > INSTANCE_ID_MAX {
            return Err(invalid("must be 1-128 characters"));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("must not contain whitespace or control characters"));
        }
        Ok(Self(value))
    }

    /// Generate a fresh random instance id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The validated id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstanceId {
    type Error = AegisError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for InstanceId {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<InstanceId> for String {
    fn from(value: InstanceId) -> Self {
        value.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// snake_case name of an RPC method or work-queue command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MethodName(String);

impl MethodName {
    /// Validate and construct a method name.
    pub fn new(value: impl Into<String>) -> Result<Self, AegisError> {
        let value = value.into();
        let invalid = |reason: &str| AegisError::Validation {
            field: "method_name",
            reason: format!("{reason}: {value:?}"),
        };

        if value.is_empty() || value.len() > METHOD_NAME_MAX {
            return Err(invalid("must be 1-64 characters"));
        }
        let mut chars = value.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return Err(invalid("must start with a lowercase letter")),
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(invalid("must be snake_case [a-z0-9_]"));
        }
        Ok(Self(value))
    }

    /// The validated name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MethodName {
    type Error = AegisError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for MethodName {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<MethodName> for String {
    fn from(value: MethodName) -> Self {
        value.0
    }
}

impl Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dot-separated event type, e.g. `order.created`.
///
/// Lowercase segments, no leading/trailing/consecutive dots, at most 64
/// characters. The first segment is the domain, the last is the action.
///
/// # Example
/// ```rust
/// use aegis_core::domain::EventType;
///
/// let event = EventType::new("order.fill.created").unwrap();
/// assert_eq!(event.domain(), "order");
/// assert_eq!(event.action(), "created");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Validate and construct an event type.
    pub fn new(value: impl Into<String>) -> Result<Self, AegisError> {
        let value = value.into();
        let invalid = |reason: &str| AegisError::Validation {
            field: "event_type",
            reason: format!("{reason}: {value:?}"),
        };

        if value.is_empty() || value.len() > EVENT_TYPE_MAX {
            return Err(invalid("must be 1-64 characters"));
        }
        if value.starts_with('.') || value.ends_with('.') || value.contains("..") {
            return Err(invalid("must not have leading/trailing/consecutive dots"));
        }
        for segment in value.split('.') {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_lowercase() => {}
                _ => return Err(invalid("segments must start with a lowercase letter")),
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(invalid("segments must be lowercase [a-z0-9_]"));
            }
        }
        Ok(Self(value))
    }

    /// First segment of the dotted path.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Last segment of the dotted path.
    pub fn action(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// The validated type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = AegisError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for EventType {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
