//! Caller-side messaging API.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use tracing::debug;
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::codec::{self, SerializationFormat};
use crate::domain::{EventType, MethodName, ServiceName};
use crate::error::{AegisError, Result};
use crate::message::{
    Command, CommandProgress, CommandResult, Event, RpcRequest, RpcResponse, Subject,
    SubjectPattern,
};
use crate::transport::{BusSubscription, MessageBus};

/// Name of the durable work-queue stream carrying commands.
pub const COMMANDS_STREAM: &str = "commands";

/// Caller-side API over a connected bus: RPC, events, and commands.
///
/// # Example
/// ```rust,ignore
/// let client = AegisClient::new(bus, SerializationFormat::MessagePack)
///     .with_source("pricing/i-1");
/// let response = client
///     .call_rpc(&service, &method, serde_json::json!({"n": 1}), Duration::from_secs(5))
///     .await?;
/// ```
#[derive(Clone)]
pub struct AegisClient<B: MessageBus> {
    bus: B,
    format: SerializationFormat,
    source: Option<String>,
}

impl<B: MessageBus> AegisClient<B> {
    /// Wrap a connected bus.
    pub fn new(bus: B, format: SerializationFormat) -> Self {
        Self {
            bus,
            format,
            source: None,
        }
    }

    /// Builder method: stamp published events with a source identifier.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Call `rpc.<service>.<method>` and wait for the structured response.
    ///
    /// A handler failure arrives as `{success: false, ...}`; only transport
    /// problems and deadline misses surface as errors.
    pub async fn call_rpc(
        &self,
        service: &ServiceName,
        method: &MethodName,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let request =
            RpcRequest::new(method.clone(), params).with_timeout_ms(timeout.as_millis() as u64);
        let subject = Subject::rpc(service, method);
        let payload = codec::encode(&request, self.format)?;
        let reply = self.bus.request(&subject, payload, timeout).await?;
        codec::decode(&reply)
    }

    /// Publish a fire-and-forget event on `events.<domain>.<type>`.
    ///
    /// Returns the envelope so callers can correlate on its `message_id`.
    pub async fn publish_event(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let mut event = Event::new(event_type, payload);
        if let Some(source) = &self.source {
            event = event.with_source(source.clone());
        }
        let subject = Subject::event(&event.event_type);
        let bytes = codec::encode(&event, self.format)?;
        self.bus.publish(&subject, bytes).await?;
        Ok(event)
    }

    /// Subscribe to events; `type_pattern` may contain wildcards, e.g.
    /// `order.*`.
    pub async fn subscribe_events(&self, type_pattern: &str) -> Result<EventSubscription> {
        let pattern = SubjectPattern::events(type_pattern)?;
        let subscription = self.bus.subscribe(&pattern, None).await?;
        Ok(EventSubscription { subscription })
    }

    /// Dispatch a durable command and return its acknowledgement handle.
    ///
    /// Progress and result subscriptions are established before the command
    /// is enqueued, so no update can be missed.
    pub async fn send_command(&self, command: Command) -> Result<CommandAck> {
        let progress_subject = Subject::command_progress(command.message_id);
        let result_subject = Subject::command_result(command.message_id);
        let progress = self
            .bus
            .subscribe(&SubjectPattern::exact(&progress_subject), None)
            .await?;
        let result = self
            .bus
            .subscribe(&SubjectPattern::exact(&result_subject), None)
            .await?;

        let subject = Subject::command(&command.target, &command.command);
        let payload = codec::encode(&command, self.format)?;
        self.bus
            .work_queue_publish(COMMANDS_STREAM, &subject, payload)
            .await?;
        debug!(command = %command.command, target = %command.target, id = %command.message_id, "command dispatched");

        Ok(CommandAck {
            message_id: command.message_id,
            progress,
            result,
        })
    }
}

/// Typed stream of events for one subscription.
pub struct EventSubscription {
    subscription: BusSubscription,
}

impl EventSubscription {
    /// Next decodable event; undecodable payloads are skipped.
    pub async fn next(&mut self) -> Option<Event> {
        while let Some(message) = self.subscription.next().await {
            if let Ok(event) = codec::decode::<Event>(&message.payload) {
                return Some(event);
            }
        }
        None
    }
}

/// Acknowledgement handle for one dispatched command.
pub struct CommandAck {
    message_id: Uuid,
    progress: BusSubscription,
    result: BusSubscription,
}

impl CommandAck {
    /// The command's `message_id`.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Next progress report; `None` once the subscription closes.
    pub async fn next_progress(&mut self) -> Option<CommandProgress> {
        while let Some(message) = self.progress.next().await {
            if let Ok(progress) = codec::decode::<CommandProgress>(&message.payload) {
                return Some(progress);
            }
        }
        None
    }

    /// Wait for the terminal result.
    pub async fn result(mut self, timeout: Duration) -> Result<CommandResult> {
        let deadline = tokio::time::timeout(timeout, async {
            while let Some(message) = self.result.next().await {
                if let Ok(result) = codec::decode::<CommandResult>(&message.payload) {
                    return Some(result);
                }
            }
            None
        });
        match deadline.await {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(AegisError::NotConnected),
            Err(_) => Err(AegisError::Timeout {
                operation: "command_result",
                timeout,
            }),
        }
    }
}
