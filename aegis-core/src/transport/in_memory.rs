//! In-memory message bus with full broker semantics.
//!
//! Backs the test suite and local development with the same observable
//! contract as the broker adapter: wildcard pub/sub, load-balanced queue
//! groups, inbox-correlated request/reply, and durable work queues with
//! at-least-once redelivery, per-consumer FIFO, and dead-lettering.
//!
//! One broker is shared by every handle cloned from it; [`handle`] mints a
//! fresh *connection* onto the same broker, so disconnecting one service
//! does not sever the others (mirroring separate connections to one
//! server).
//!
//! [`handle`]: InMemoryMessageBus::handle

// Layer 1: Standard library imports
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::timeout;

// Layer 3: Internal module imports
use super::traits::{
    Acknowledge, BusSubscription, InboundMessage, MessageBus, QueueMessage, QueueSubscription,
};
use crate::error::{AegisError, Result};
use crate::kv::{KvBucketOptions, MemoryKvStore};
use crate::message::{Subject, SubjectPattern};

/// How long a delivered work-queue message may stay unacknowledged before
/// it is redelivered.
const ACK_WAIT: Duration = Duration::from_secs(30);

/// Base delay for nak redelivery backoff.
const NAK_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Cap for nak redelivery backoff.
const NAK_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// One connection onto an in-process broker.
///
/// `Clone` shares the connection; [`handle`](Self::handle) opens a new
/// one.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    core: Arc<BrokerCore>,
    connection: Arc<ConnectionState>,
}

struct BrokerCore {
    next_sub_id: AtomicU64,
    round_robin: AtomicUsize,
    subscriptions: Mutex<Vec<SubEntry>>,
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
    buckets: Mutex<HashMap<String, MemoryKvStore>>,
    published: Mutex<Vec<String>>,
    shutdown: watch::Sender<bool>,
}

struct ConnectionState {
    connected: AtomicBool,
    sub_ids: Mutex<Vec<u64>>,
}

struct SubEntry {
    id: u64,
    pattern: SubjectPattern,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

struct StreamState {
    consumers: Mutex<HashMap<String, Arc<ConsumerState>>>,
    unrouted: Mutex<VecDeque<Job>>,
    dead: Mutex<Vec<Job>>,
}

#[derive(Clone)]
struct Job {
    subject: String,
    payload: Bytes,
    delivery_count: u32,
}

struct ConsumerState {
    pattern: SubjectPattern,
    max_deliver: u32,
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    delivery: Mutex<Option<mpsc::UnboundedSender<QueueMessage>>>,
    stream: Weak<StreamState>,
}

enum AckSignal {
    Ack,
    Nak(Option<Duration>),
    Term,
}

struct MemoryAcker {
    signal: Mutex<Option<oneshot::Sender<AckSignal>>>,
}

impl MemoryAcker {
    fn send(&self, signal: AckSignal) -> Result<()> {
        if let Some(tx) = self.signal.lock().take() {
            let _ = tx.send(signal);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.send(AckSignal::Ack)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.send(AckSignal::Nak(delay))
    }

    async fn term(&self) -> Result<()> {
        self.send(AckSignal::Term)
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageBus {
    /// Create a broker with one connected handle onto it.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(BrokerCore {
                next_sub_id: AtomicU64::new(0),
                round_robin: AtomicUsize::new(0),
                subscriptions: Mutex::new(Vec::new()),
                streams: Mutex::new(HashMap::new()),
                buckets: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                shutdown,
            }),
            connection: Arc::new(ConnectionState {
                connected: AtomicBool::new(true),
                sub_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open a fresh connection onto the same broker.
    ///
    /// Disconnecting it closes only its own subscriptions; other handles
    /// keep working.
    pub fn handle(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            connection: Arc::new(ConnectionState {
                connected: AtomicBool::new(true),
                sub_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every subject published so far, in order. Test hook for verifying
    /// subject-grammar compliance.
    pub fn published_subjects(&self) -> Vec<String> {
        self.core.published.lock().clone()
    }

    /// Dead-lettered work-queue messages of one stream, as
    /// `(subject, payload)` pairs. Test hook.
    pub fn dead_letters(&self, stream: &str) -> Vec<(String, Bytes)> {
        let streams = self.core.streams.lock();
        let Some(state) = streams.get(stream) else {
            return Vec::new();
        };
        let dead_letters = state
            .dead
            .lock()
            .iter()
            .map(|job| (job.subject.clone(), job.payload.clone()))
            .collect();
        dead_letters
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connection.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AegisError::NotConnected)
        }
    }

    fn add_subscription(
        &self,
        pattern: SubjectPattern,
        queue_group: Option<String>,
    ) -> (u64, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.core.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.core.subscriptions.lock().push(SubEntry {
            id,
            pattern,
            queue_group,
            tx,
        });
        self.connection.sub_ids.lock().push(id);
        (id, rx)
    }

    fn remove_subscription(&self, id: u64) {
        self.core.subscriptions.lock().retain(|entry| entry.id != id);
        self.connection.sub_ids.lock().retain(|sub_id| *sub_id != id);
    }

    fn deliver(&self, subject: &str, payload: &Bytes, reply_to: Option<&Subject>) {
        let make_message = || InboundMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            reply_to: reply_to.cloned(),
        };

        let mut subs = self.core.subscriptions.lock();
        subs.retain(|entry| !entry.tx.is_closed());

        let mut groups: HashMap<&str, Vec<&SubEntry>> = HashMap::new();
        for entry in subs.iter() {
            if !entry.pattern.matches(subject) {
                continue;
            }
            match &entry.queue_group {
                None => {
                    let _ = entry.tx.send(make_message());
                }
                Some(group) => groups.entry(group.as_str()).or_default().push(entry),
            }
        }
        // Queue groups load-balance: exactly one member receives each
        // message.
        for members in groups.values() {
            let index = self.core.round_robin.fetch_add(1, Ordering::Relaxed) % members.len();
            let _ = members[index].tx.send(make_message());
        }
    }

    fn record_publish(&self, subject: &str) {
        self.core.published.lock().push(subject.to_string());
    }

    fn stream_state(&self, stream: &str) -> Arc<StreamState> {
        let mut streams = self.core.streams.lock();
        Arc::clone(streams.entry(stream.to_string()).or_insert_with(|| {
            Arc::new(StreamState {
                consumers: Mutex::new(HashMap::new()),
                unrouted: Mutex::new(VecDeque::new()),
                dead: Mutex::new(Vec::new()),
            })
        }))
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    type Kv = MemoryKvStore;

    fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connection.connected.store(false, Ordering::SeqCst);
        let ids: Vec<u64> = self.connection.sub_ids.lock().drain(..).collect();
        self.core
            .subscriptions
            .lock()
            .retain(|entry| !ids.contains(&entry.id));
        Ok(())
    }

    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;
        self.record_publish(subject.as_str());
        self.deliver(subject.as_str(), &payload, None);
        Ok(())
    }

    async fn request(
        &self,
        subject: &Subject,
        payload: Bytes,
        timeout_duration: Duration,
    ) -> Result<Bytes> {
        self.ensure_connected()?;
        let inbox = Subject::inbox();
        let (id, mut rx) = self.add_subscription(SubjectPattern::exact(&inbox), None);

        self.record_publish(subject.as_str());
        self.deliver(subject.as_str(), &payload, Some(&inbox));

        let reply = timeout(timeout_duration, rx.recv()).await;
        self.remove_subscription(id);
        match reply {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(AegisError::NotConnected),
            Err(_) => Err(AegisError::Timeout {
                operation: "request",
                timeout: timeout_duration,
            }),
        }
    }

    async fn subscribe(
        &self,
        pattern: &SubjectPattern,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription> {
        self.ensure_connected()?;
        let (_, rx) = self.add_subscription(pattern.clone(), queue_group.map(str::to_string));
        Ok(BusSubscription::new(rx))
    }

    async fn work_queue_publish(
        &self,
        stream: &str,
        subject: &Subject,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.record_publish(subject.as_str());

        let state = self.stream_state(stream);
        let job = Job {
            subject: subject.as_str().to_string(),
            payload,
            delivery_count: 0,
        };
        let consumers = state.consumers.lock();
        let target = consumers
            .values()
            .find(|consumer| consumer.pattern.matches(&job.subject));
        match target {
            Some(consumer) => {
                consumer.queue.lock().push_back(job);
                consumer.notify.notify_one();
            }
            // Durable: messages published before any consumer exists are
            // retained and drained on attach.
            None => state.unrouted.lock().push_back(job),
        }
        Ok(())
    }

    async fn work_queue_subscribe(
        &self,
        stream: &str,
        pattern: &SubjectPattern,
        durable_name: &str,
        max_deliver: u32,
    ) -> Result<QueueSubscription> {
        self.ensure_connected()?;

        let state = self.stream_state(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut consumers = state.consumers.lock();
        match consumers.get(durable_name) {
            Some(existing) => {
                // Reattach to the durable consumer: redeliveries resume on
                // the new channel from the last unacknowledged message.
                *existing.delivery.lock() = Some(tx);
                existing.notify.notify_one();
            }
            None => {
                let consumer = Arc::new(ConsumerState {
                    pattern: pattern.clone(),
                    max_deliver: max_deliver.max(1),
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                    delivery: Mutex::new(Some(tx)),
                    stream: Arc::downgrade(&state),
                });
                {
                    let mut unrouted = state.unrouted.lock();
                    let mut queue = consumer.queue.lock();
                    let mut remaining = VecDeque::new();
                    while let Some(job) = unrouted.pop_front() {
                        if consumer.pattern.matches(&job.subject) {
                            queue.push_back(job);
                        } else {
                            remaining.push_back(job);
                        }
                    }
                    *unrouted = remaining;
                }
                consumer.notify.notify_one();
                consumers.insert(durable_name.to_string(), Arc::clone(&consumer));
                tokio::spawn(run_consumer(consumer, self.core.shutdown.subscribe()));
            }
        }
        Ok(QueueSubscription::new(rx))
    }

    async fn kv_bucket(&self, name: &str, options: KvBucketOptions) -> Result<Self::Kv> {
        self.ensure_connected()?;
        let mut buckets = self.core.buckets.lock();
        // Re-opening an existing bucket returns the same state; options
        // apply on first open only.
        Ok(buckets
            .entry(name.to_string())
            .or_insert_with(|| MemoryKvStore::new(name, options))
            .clone())
    }
}

fn nak_backoff(delivery_count: u32) -> Duration {
    let factor = 1u32 << delivery_count.saturating_sub(1).min(10);
    (NAK_BACKOFF_BASE * factor).min(NAK_BACKOFF_MAX)
}

/// Per-consumer delivery pump: one outstanding message at a time, FIFO,
/// redelivery on nak/ack-timeout, dead-letter once `max_deliver` is
/// exhausted.
async fn run_consumer(consumer: Arc<ConsumerState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let mut job = loop {
            if let Some(job) = consumer.queue.lock().pop_front() {
                break job;
            }
            tokio::select! {
                _ = consumer.notify.notified() => {}
                _ = shutdown.changed() => return,
            }
        };

        let tx = loop {
            let current = consumer.delivery.lock().clone();
            match current {
                Some(tx) if !tx.is_closed() => break tx,
                _ => {}
            }
            tokio::select! {
                _ = consumer.notify.notified() => {}
                _ = shutdown.changed() => return,
            }
        };

        job.delivery_count += 1;
        let (ack_tx, ack_rx) = oneshot::channel();
        let message = QueueMessage::new(
            job.subject.clone(),
            job.payload.clone(),
            job.delivery_count,
            Box::new(MemoryAcker {
                signal: Mutex::new(Some(ack_tx)),
            }),
        );
        if tx.send(message).is_err() {
            job.delivery_count -= 1;
            consumer.queue.lock().push_front(job);
            continue;
        }

        match timeout(ACK_WAIT, ack_rx).await {
            Ok(Ok(AckSignal::Ack)) | Ok(Ok(AckSignal::Term)) => {}
            Ok(Ok(AckSignal::Nak(delay))) => {
                let delay = delay.unwrap_or_else(|| nak_backoff(job.delivery_count));
                tokio::time::sleep(delay).await;
                requeue_or_dead_letter(&consumer, job);
            }
            // Dropped without acknowledgement, or the ack window elapsed.
            Ok(Err(_)) | Err(_) => requeue_or_dead_letter(&consumer, job),
        }
    }
}

fn requeue_or_dead_letter(consumer: &ConsumerState, job: Job) {
    if job.delivery_count >= consumer.max_deliver {
        if let Some(stream) = consumer.stream.upgrade() {
            stream.dead.lock().push(job);
        }
    } else {
        consumer.queue.lock().push_front(job);
        consumer.notify.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::domain::{MethodName, ServiceName};

    fn subject(raw: &str) -> Subject {
        Subject::new(raw).unwrap()
    }

    fn pattern(raw: &str) -> SubjectPattern {
        SubjectPattern::new(raw).unwrap()
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_subscriber() {
        let bus = InMemoryMessageBus::new();
        let mut a = bus.subscribe(&pattern("events.order.*"), None).await.unwrap();
        let mut b = bus.subscribe(&pattern("events.order.*"), None).await.unwrap();

        bus.publish(&subject("events.order.created"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(a.next().await.is_some());
        assert!(b.next().await.is_some());
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one() {
        let bus = InMemoryMessageBus::new();
        let mut a = bus
            .subscribe(&pattern("rpc.svc.*"), Some("svc"))
            .await
            .unwrap();
        let mut b = bus
            .subscribe(&pattern("rpc.svc.*"), Some("svc"))
            .await
            .unwrap();

        for _ in 0..4 {
            bus.publish(&subject("rpc.svc.ping"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let mut received = 0;
        while timeout(Duration::from_millis(50), a.next()).await.is_ok() {
            received += 1;
        }
        while timeout(Duration::from_millis(50), b.next()).await.is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn wildcard_subscription_filters_subjects() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe(&pattern("events.order.*"), None).await.unwrap();

        bus.publish(&subject("events.order.created"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        bus.publish(&subject("events.trade.executed"), Bytes::from_static(b"2"))
            .await
            .unwrap();
        bus.publish(&subject("events.order.cancelled"), Bytes::from_static(b"3"))
            .await
            .unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.subject, "events.order.created");
        let second = sub.next().await.unwrap();
        assert_eq!(second.subject, "events.order.cancelled");
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = InMemoryMessageBus::new();
        let mut server = bus.subscribe(&pattern("rpc.svc.echo"), None).await.unwrap();

        let client = bus.clone();
        let request = tokio::spawn(async move {
            client
                .request(
                    &subject("rpc.svc.echo"),
                    Bytes::from_static(b"hello"),
                    Duration::from_secs(1),
                )
                .await
        });

        let inbound = server.next().await.unwrap();
        let reply_to = inbound.reply_to.clone().unwrap();
        bus.publish(&reply_to, inbound.payload).await.unwrap();

        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let bus = InMemoryMessageBus::new();
        let err = bus
            .request(
                &subject("rpc.svc.void"),
                Bytes::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AegisError::Timeout { .. }));
    }

    #[tokio::test]
    async fn work_queue_retains_messages_until_consumer_attaches() {
        let bus = InMemoryMessageBus::new();
        let svc = ServiceName::new("svc").unwrap();
        let cmd = MethodName::new("run").unwrap();
        let cmd_subject = Subject::command(&svc, &cmd);

        bus.work_queue_publish("commands", &cmd_subject, Bytes::from_static(b"early"))
            .await
            .unwrap();

        let mut sub = bus
            .work_queue_subscribe("commands", &pattern("commands.svc.run"), "svc-run", 3)
            .await
            .unwrap();
        let message = sub.next().await.unwrap();
        assert_eq!(message.payload.as_ref(), b"early");
        assert_eq!(message.delivery_count, 1);
        message.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nak_triggers_redelivery_then_dead_letter() {
        let bus = InMemoryMessageBus::new();
        let svc = ServiceName::new("svc").unwrap();
        let cmd = MethodName::new("flaky").unwrap();
        let cmd_subject = Subject::command(&svc, &cmd);

        let mut sub = bus
            .work_queue_subscribe("commands", &pattern("commands.svc.flaky"), "svc-flaky", 2)
            .await
            .unwrap();
        bus.work_queue_publish("commands", &cmd_subject, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.delivery_count, 1);
        first.nak(Some(Duration::from_millis(10))).await.unwrap();

        let second = sub.next().await.unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.payload.as_ref(), b"x");
        second.nak(Some(Duration::from_millis(10))).await.unwrap();

        // max_deliver = 2 exhausted: dead-lettered, not redelivered.
        assert!(timeout(Duration::from_millis(200), sub.next()).await.is_err());
        let dead = bus.dead_letters("commands");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "commands.svc.flaky");
    }

    #[tokio::test]
    async fn work_queue_is_fifo() {
        let bus = InMemoryMessageBus::new();
        let svc = ServiceName::new("svc").unwrap();
        let cmd = MethodName::new("seq").unwrap();
        let cmd_subject = Subject::command(&svc, &cmd);

        let mut sub = bus
            .work_queue_subscribe("commands", &pattern("commands.svc.seq"), "svc-seq", 3)
            .await
            .unwrap();
        for i in 0..3u8 {
            bus.work_queue_publish("commands", &cmd_subject, Bytes::copy_from_slice(&[i]))
                .await
                .unwrap();
        }
        for i in 0..3u8 {
            let message = sub.next().await.unwrap();
            assert_eq!(message.payload.as_ref(), &[i]);
            message.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn disconnect_fails_fast_but_spares_other_handles() {
        let bus = InMemoryMessageBus::new();
        let other = bus.handle();
        let mut other_sub = other.subscribe(&pattern("events.x.*"), None).await.unwrap();

        bus.disconnect().await.unwrap();
        assert!(!bus.is_connected());
        let err = bus
            .publish(&subject("events.x.y"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AegisError::NotConnected));

        // The second connection still works end to end.
        assert!(other.is_connected());
        other
            .publish(&subject("events.x.y"), Bytes::from_static(b"alive"))
            .await
            .unwrap();
        assert_eq!(other_sub.next().await.unwrap().payload.as_ref(), b"alive");
    }

    #[tokio::test]
    async fn disconnect_drops_only_own_subscriptions() {
        let bus = InMemoryMessageBus::new();
        let other = bus.handle();
        let mut mine = bus.subscribe(&pattern("events.a.*"), None).await.unwrap();
        let mut theirs = other.subscribe(&pattern("events.a.*"), None).await.unwrap();

        bus.disconnect().await.unwrap();
        other
            .publish(&subject("events.a.b"), Bytes::from_static(b"m"))
            .await
            .unwrap();

        assert!(theirs.next().await.is_some());
        // Our subscription was torn down with the connection.
        assert!(mine.next().await.is_none());
    }

    #[tokio::test]
    async fn published_subjects_are_recorded() {
        let bus = InMemoryMessageBus::new();
        bus.publish(&subject("events.order.created"), Bytes::new())
            .await
            .unwrap();
        assert_eq!(bus.published_subjects(), vec!["events.order.created"]);
    }

    #[tokio::test]
    async fn kv_bucket_is_shared_by_name() {
        let bus = InMemoryMessageBus::new();
        let a = bus
            .kv_bucket("service_registry", KvBucketOptions::default())
            .await
            .unwrap();
        let b = bus
            .handle()
            .kv_bucket("service_registry", KvBucketOptions::default())
            .await
            .unwrap();

        use crate::kv::{KvStore, PutOptions};
        a.put("k", Bytes::from_static(b"v"), PutOptions::default())
            .await
            .unwrap();
        assert!(b.get("k").await.unwrap().is_some());
    }
}
