//! Serialized message envelopes for RPC, events, and commands.
//!
//! Every envelope carries a fresh UUIDv4 `message_id` and a UTC timestamp.
//! Envelopes are plain serde structs; the wire format is chosen by
//! [`crate::codec`] at connect time.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::domain::{EventType, MethodName, Priority, ServiceName};

/// Default RPC timeout in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;

/// Default command timeout in milliseconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Default maximum command redeliveries before dead-lettering.
pub const DEFAULT_COMMAND_MAX_RETRIES: u32 = 3;

/// A request published to `rpc.<service>.<method>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fresh UUIDv4 identifying this request.
    pub message_id: Uuid,
    /// Target method.
    pub method: MethodName,
    /// Free-form parameters.
    pub params: serde_json::Value,
    /// Caller-side deadline, surfaced to the handler.
    pub timeout_ms: u64,
    /// Set by the caller to tie the response back to this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl RpcRequest {
    /// New request with default timeout and a fresh message id.
    pub fn new(method: MethodName, params: serde_json::Value) -> Self {
        let message_id = Uuid::new_v4();
        Self {
            message_id,
            method,
            params,
            timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            correlation_id: Some(message_id),
            timestamp: Utc::now(),
        }
    }

    /// Builder method: override the timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// The reply to an [`RpcRequest`].
///
/// User-visible errors are always structured: `success == false` plus an
/// `error` code and a human-readable `message`, never a broken connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Fresh UUIDv4 identifying this response.
    pub message_id: Uuid,
    /// The request's `message_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Whether the handler completed normally.
    pub success: bool,
    /// Handler return value when `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error code when `!success`, e.g. `NOT_ACTIVE` or `HANDLER_ERROR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable error detail when `!success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl RpcResponse {
    /// Successful reply carrying `result`.
    pub fn ok(correlation_id: Option<Uuid>, result: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id,
            success: true,
            result: Some(result),
            error: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed reply carrying an error code and message.
    pub fn failure(
        correlation_id: Option<Uuid>,
        error: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id,
            success: false,
            result: None,
            error: Some(error.into()),
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

/// A fire-and-forget event published to `events.<domain>.<event_type>`.
///
/// Delivery is best-effort fan-out; handlers must be idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Fresh UUIDv4 identifying this event.
    pub message_id: Uuid,
    /// First segment of the event type, duplicated for cheap filtering.
    pub domain: String,
    /// Full dotted event type.
    pub event_type: EventType,
    /// Free-form payload.
    pub payload: serde_json::Value,
    /// Publishing instance, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// New event with a fresh message id.
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            domain: event_type.domain().to_string(),
            event_type,
            payload,
            source: None,
            timestamp: Utc::now(),
        }
    }

    /// Builder method: record the publishing instance.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A durable command published to the `commands.<service>.<command>` work
/// queue.
///
/// `priority` is metadata: it is recorded and surfaced to handlers but the
/// queue delivers FIFO regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Fresh UUIDv4 identifying this command; progress and result subjects
    /// are derived from it.
    pub message_id: Uuid,
    /// Command name.
    pub command: MethodName,
    /// Target service.
    pub target: ServiceName,
    /// Free-form payload.
    pub payload: serde_json::Value,
    /// Routing metadata; never reorders the queue.
    #[serde(default)]
    pub priority: Priority,
    /// Handler deadline in milliseconds.
    pub timeout_ms: u64,
    /// Redeliveries allowed before the command is dead-lettered.
    pub max_retries: u32,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl Command {
    /// New command with default timeout, retries, and priority.
    pub fn new(target: ServiceName, command: MethodName, payload: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            command,
            target,
            payload,
            priority: Priority::Normal,
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            max_retries: DEFAULT_COMMAND_MAX_RETRIES,
            timestamp: Utc::now(),
        }
    }

    /// Builder method: set the priority metadata.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method: override the handler deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Builder method: override the redelivery budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Progress report published to `commands.progress.<message_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandProgress {
    /// The command's `message_id`.
    pub message_id: Uuid,
    /// Completion percentage in `[0, 100]`.
    pub percent: f64,
    /// Human-readable stage description.
    pub status: String,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl CommandProgress {
    /// New progress report for a command.
    pub fn new(message_id: Uuid, percent: f64, status: impl Into<String>) -> Self {
        Self {
            message_id,
            percent: percent.clamp(0.0, 100.0),
            status: status.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Terminal state of a command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Handler returned successfully.
    Completed,
    /// Handler failed and the redelivery budget is exhausted.
    Failed,
    /// Handler exceeded the command's `timeout_ms`.
    Timeout,
}

/// Final outcome published to `commands.result.<message_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command's `message_id`.
    pub message_id: Uuid,
    /// Terminal status.
    pub status: CommandStatus,
    /// Handler return value on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error detail on failure or timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    /// Successful outcome.
    pub fn completed(message_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            message_id,
            status: CommandStatus::Completed,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed outcome.
    pub fn failed(message_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            message_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Timed-out outcome.
    pub fn timed_out(message_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            message_id,
            status: CommandStatus::Timeout,
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, SerializationFormat};

    fn method(name: &str) -> MethodName {
        MethodName::new(name).unwrap()
    }

    fn service(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }

    #[test]
    fn rpc_request_defaults() {
        let request = RpcRequest::new(method("do_work"), serde_json::json!({"n": 1}));
        assert_eq!(request.timeout_ms, DEFAULT_RPC_TIMEOUT_MS);
        assert_eq!(request.correlation_id, Some(request.message_id));
    }

    #[test]
    fn rpc_round_trip_both_formats() {
        let request = RpcRequest::new(method("do_work"), serde_json::json!({"n": 1}));
        for format in [SerializationFormat::MessagePack, SerializationFormat::Json] {
            let bytes = encode(&request, format).unwrap();
            let back: RpcRequest = decode(&bytes).unwrap();
            assert_eq!(back, request);
        }
    }

    #[test]
    fn event_round_trip() {
        let event = Event::new(
            EventType::new("order.created").unwrap(),
            serde_json::json!({"order_id": 7}),
        )
        .with_source("order-service/i-1");
        assert_eq!(event.domain, "order");

        let bytes = encode(&event, SerializationFormat::MessagePack).unwrap();
        let back: Event = decode(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn command_round_trip() {
        let command = Command::new(
            service("batch-service"),
            method("process_batch"),
            serde_json::json!({"size": 1000}),
        )
        .with_priority(Priority::High)
        .with_timeout_ms(5_000)
        .with_max_retries(2);

        let bytes = encode(&command, SerializationFormat::Json).unwrap();
        let back: Command = decode(&bytes).unwrap();
        assert_eq!(back, command);
        assert_eq!(back.priority, Priority::High);
    }

    #[test]
    fn fresh_message_ids_are_unique() {
        let a = Event::new(EventType::new("x.y").unwrap(), serde_json::Value::Null);
        let b = Event::new(EventType::new("x.y").unwrap(), serde_json::Value::Null);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let progress = CommandProgress::new(Uuid::new_v4(), 250.0, "overachieving");
        assert_eq!(progress.percent, 100.0);
        let progress = CommandProgress::new(Uuid::new_v4(), -3.0, "underachieving");
        assert_eq!(progress.percent, 0.0);
    }

    #[test]
    fn failure_response_shape() {
        let response = RpcResponse::failure(None, "NOT_ACTIVE", "i-2 is in STANDBY mode");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("NOT_ACTIVE"));
        assert_eq!(response.message.as_deref(), Some("i-2 is in STANDBY mode"));
        assert!(response.result.is_none());
    }

    #[test]
    fn command_status_serializes_lowercase() {
        let result = CommandResult::timed_out(Uuid::new_v4(), "deadline exceeded");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "timeout");
    }
}
