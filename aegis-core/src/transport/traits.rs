//! The message bus port.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

// Layer 3: Internal module imports
use crate::error::Result;
use crate::kv::{KvBucketOptions, KvStore};
use crate::message::{Subject, SubjectPattern};

/// A message delivered to a plain subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Concrete subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Inbox to publish the reply to, for request/reply traffic.
    pub reply_to: Option<Subject>,
}

/// A pull-driven stream of inbound messages.
///
/// Dropping the subscription unsubscribes; queue-group siblings keep
/// receiving.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl BusSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        Self { rx }
    }

    /// Next message; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// Acknowledgement surface of one delivered work-queue message.
///
/// Object-safe so each adapter can carry its own broker handle.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Mark the message processed; it will not be redelivered.
    async fn ack(&self) -> Result<()>;

    /// Reject and requeue; the broker redelivers after `delay` (or its own
    /// backoff when `None`).
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;

    /// Terminally reject; the message is dropped without redelivery.
    async fn term(&self) -> Result<()>;
}

/// One at-least-once delivery from a durable work queue.
pub struct QueueMessage {
    /// Concrete subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// How many times this message has been delivered (1 on first
    /// delivery).
    pub delivery_count: u32,
    acker: Box<dyn Acknowledge>,
}

impl QueueMessage {
    pub(crate) fn new(
        subject: String,
        payload: Bytes,
        delivery_count: u32,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            subject,
            payload,
            delivery_count,
            acker,
        }
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Requeue for redelivery.
    pub async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.acker.nak(delay).await
    }

    /// Drop without redelivery.
    pub async fn term(&self) -> Result<()> {
        self.acker.term().await
    }
}

/// A pull-driven stream of work-queue deliveries.
///
/// Within one stream, messages for the same subject arrive FIFO and one at
/// a time; the previous delivery must be acknowledged (or rejected) before
/// the next is handed out.
pub struct QueueSubscription {
    rx: mpsc::UnboundedReceiver<QueueMessage>,
}

impl QueueSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<QueueMessage>) -> Self {
        Self { rx }
    }

    /// Next delivery; `None` once the consumer is closed.
    pub async fn next(&mut self) -> Option<QueueMessage> {
        self.rx.recv().await
    }
}

/// Connection abstraction over the broker.
///
/// Implementations are cheaply cloneable handles sharing one underlying
/// connection. Reconnection is the adapter's concern (bounded exponential
/// backoff); publishes during disconnection fail fast with `NotConnected`.
/// Reconnection never replays plain publishes; durable subscriptions
/// resume from the last acknowledged message.
#[async_trait]
pub trait MessageBus: Clone + Send + Sync + 'static {
    /// The KV bucket type this bus opens.
    type Kv: KvStore;

    /// Whether the underlying connection is currently up.
    fn is_connected(&self) -> bool;

    /// Close the connection; subsequent operations fail with
    /// `NotConnected`.
    async fn disconnect(&self) -> Result<()>;

    /// Fire-and-forget publish.
    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<()>;

    /// Request/reply with inbox correlation; fails with `Timeout` when no
    /// reply arrives in time.
    async fn request(&self, subject: &Subject, payload: Bytes, timeout: Duration)
        -> Result<Bytes>;

    /// Subscribe to a subject pattern.
    ///
    /// With a queue group, delivery is load-balanced across the group's
    /// subscribers; without one, every subscriber receives every message.
    async fn subscribe(
        &self,
        pattern: &SubjectPattern,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription>;

    /// Durably publish onto a work-queue stream.
    async fn work_queue_publish(
        &self,
        stream: &str,
        subject: &Subject,
        payload: Bytes,
    ) -> Result<()>;

    /// Attach a durable consumer to a work-queue stream.
    ///
    /// Messages are redelivered until acknowledged; after `max_deliver`
    /// deliveries the broker dead-letters the message.
    async fn work_queue_subscribe(
        &self,
        stream: &str,
        pattern: &SubjectPattern,
        durable_name: &str,
        max_deliver: u32,
    ) -> Result<QueueSubscription>;

    /// Open (or create) a named KV bucket.
    async fn kv_bucket(&self, name: &str, options: KvBucketOptions) -> Result<Self::Kv>;
}
