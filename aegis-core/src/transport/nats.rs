//! NATS broker adapter: core pub/sub plus JetStream work queues and KV.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy};
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::traits::{
    Acknowledge, BusSubscription, InboundMessage, MessageBus, QueueMessage, QueueSubscription,
};
use crate::error::{AegisError, Result};
use crate::kv::{KvBucketOptions, NatsKvStore};
use crate::message::{Subject, SubjectPattern};

/// Message bus backed by one NATS connection.
///
/// Reconnection with bounded exponential backoff is handled by the client
/// itself; while disconnected, operations fail fast and durable consumers
/// resume from the last acknowledged message once the connection returns.
#[derive(Clone)]
pub struct NatsMessageBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    ensured_streams: Arc<DashMap<String, ()>>,
    closed: Arc<AtomicBool>,
}

impl NatsMessageBus {
    /// Connect to the broker.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| AegisError::transport(format!("connect {url}: {e}")))?;
        debug!(%url, "connected to broker");
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            ensured_streams: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AegisError::NotConnected);
        }
        Ok(())
    }

    /// Create the work-queue stream on first use; `<stream>.>` captures
    /// every subject rooted at the stream name.
    async fn ensure_stream(&self, stream: &str) -> Result<()> {
        if self.ensured_streams.contains_key(stream) {
            return Ok(());
        }
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: stream.to_string(),
                subjects: vec![format!("{stream}.>")],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| AegisError::transport(format!("ensure stream {stream}: {e}")))?;
        self.ensured_streams.insert(stream.to_string(), ());
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    type Kv = NatsKvStore;

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.client
            .flush()
            .await
            .map_err(|e| AegisError::transport(format!("flush on disconnect: {e}")))
    }

    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.client
            .publish(subject.as_str().to_string(), payload)
            .await
            .map_err(|e| AegisError::transport(format!("publish {subject}: {e}")))
    }

    async fn request(
        &self,
        subject: &Subject,
        payload: Bytes,
        timeout_duration: Duration,
    ) -> Result<Bytes> {
        self.ensure_open()?;
        let response = timeout(
            timeout_duration,
            self.client.request(subject.as_str().to_string(), payload),
        )
        .await
        .map_err(|_| AegisError::Timeout {
            operation: "request",
            timeout: timeout_duration,
        })?
        .map_err(|e| AegisError::transport(format!("request {subject}: {e}")))?;
        Ok(response.payload)
    }

    async fn subscribe(
        &self,
        pattern: &SubjectPattern,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription> {
        self.ensure_open()?;
        let mut subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(pattern.as_str().to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(pattern.as_str().to_string()).await,
        }
        .map_err(|e| AegisError::transport(format!("subscribe {pattern}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let inbound = InboundMessage {
                    subject: message.subject.to_string(),
                    payload: message.payload,
                    reply_to: message
                        .reply
                        .and_then(|reply| Subject::new(reply.to_string()).ok()),
                };
                if tx.send(inbound).is_err() {
                    return; // subscription dropped
                }
            }
        });
        Ok(BusSubscription::new(rx))
    }

    async fn work_queue_publish(
        &self,
        stream: &str,
        subject: &Subject,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_open()?;
        self.ensure_stream(stream).await?;
        let ack = self
            .jetstream
            .publish(subject.as_str().to_string(), payload)
            .await
            .map_err(|e| AegisError::transport(format!("queue publish {subject}: {e}")))?;
        ack.await
            .map_err(|e| AegisError::transport(format!("queue publish ack {subject}: {e}")))?;
        Ok(())
    }

    async fn work_queue_subscribe(
        &self,
        stream: &str,
        pattern: &SubjectPattern,
        durable_name: &str,
        max_deliver: u32,
    ) -> Result<QueueSubscription> {
        self.ensure_open()?;
        self.ensure_stream(stream).await?;
        let stream_handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| AegisError::transport(format!("get stream {stream}: {e}")))?;
        let consumer = stream_handle
            .get_or_create_consumer(
                durable_name,
                PullConsumerConfig {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: pattern.as_str().to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: i64::from(max_deliver.max(1)),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| AegisError::transport(format!("consumer {durable_name}: {e}")))?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| AegisError::transport(format!("consume {durable_name}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = messages.next().await {
                let message = match item {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(%err, "work queue delivery error");
                        continue;
                    }
                };
                let subject = message.subject.to_string();
                let payload = message.payload.clone();
                let delivery_count = message
                    .info()
                    .map(|info| info.delivered.max(1) as u32)
                    .unwrap_or(1);
                let queue_message = QueueMessage::new(
                    subject,
                    payload,
                    delivery_count,
                    Box::new(NatsAcker { message }),
                );
                if tx.send(queue_message).is_err() {
                    return; // consumer dropped
                }
            }
        });
        Ok(QueueSubscription::new(rx))
    }

    async fn kv_bucket(&self, name: &str, options: KvBucketOptions) -> Result<Self::Kv> {
        self.ensure_open()?;
        NatsKvStore::open(&self.jetstream, name, options).await
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledge for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| AegisError::transport(format!("ack: {e}")))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| AegisError::transport(format!("nak: {e}")))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| AegisError::transport(format!("term: {e}")))
    }
}
