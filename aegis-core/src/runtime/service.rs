//! The service runtime: registration, heartbeats, election, and handler
//! dispatch under one supervised lifecycle.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use super::supervision::spawn_supervised;
use crate::codec;
use crate::config::AegisConfig;
use crate::domain::{EventType, MethodName, ServiceInstance};
use crate::election::{ElectionCoordinator, ElectionState, LeadershipHooks, NoopHooks};
use crate::error::{AegisError, Result};
use crate::kv::KvBucketOptions;
use crate::message::{
    Command, CommandProgress, CommandResult, Event, RpcRequest, RpcResponse, Subject,
    SubjectPattern,
};
use crate::metrics::{counters, Metrics};
use crate::patterns::{
    AegisClient, CommandHandler, EventHandler, ProgressReporter, RpcHandler, COMMANDS_STREAM,
};
use crate::registry::{KvServiceRegistry, REGISTRY_BUCKET};
use crate::transport::{MessageBus, QueueMessage};

/// Consecutive registry heartbeat failures before the instance degrades
/// itself to `Unhealthy`.
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Broker-side redelivery backstop for command consumers; the per-command
/// `max_retries` budget is enforced by the runtime before this cap.
const QUEUE_MAX_DELIVER: u32 = 32;

struct RpcEntry {
    handler: Arc<dyn RpcHandler>,
    exclusive: bool,
}

struct HandlerTable {
    rpc: HashMap<String, RpcEntry>,
    events: Vec<(SubjectPattern, Arc<dyn EventHandler>)>,
    commands: HashMap<String, Arc<dyn CommandHandler>>,
}

struct SingleActive {
    group: String,
    hooks: Arc<dyn LeadershipHooks>,
}

/// Builder for a [`ServiceRuntime`].
///
/// Handlers are registered here, before `start()`; the registries are
/// immutable afterwards. Single-active behavior is attached by composition
/// via [`single_active`](Self::single_active).
pub struct ServiceRuntimeBuilder<B: MessageBus> {
    config: AegisConfig,
    bus: B,
    rpc: HashMap<String, RpcEntry>,
    events: Vec<(String, Arc<dyn EventHandler>)>,
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    single_active: Option<SingleActive>,
    instance_metadata: HashMap<String, serde_json::Value>,
}

impl<B: MessageBus> ServiceRuntimeBuilder<B> {
    /// Start configuring a runtime over a connected bus.
    pub fn new(config: AegisConfig, bus: B) -> Self {
        Self {
            config,
            bus,
            rpc: HashMap::new(),
            events: Vec::new(),
            commands: HashMap::new(),
            single_active: None,
            instance_metadata: HashMap::new(),
        }
    }

    /// Register an RPC method handler.
    pub fn register_rpc(mut self, method: MethodName, handler: impl RpcHandler + 'static) -> Self {
        self.rpc.insert(
            method.as_str().to_string(),
            RpcEntry {
                handler: Arc::new(handler),
                exclusive: false,
            },
        );
        self
    }

    /// Register an RPC method that only the ACTIVE instance of a
    /// single-active group serves; standbys reject it with `NOT_ACTIVE`
    /// without invoking the handler.
    pub fn register_exclusive_rpc(
        mut self,
        method: MethodName,
        handler: impl RpcHandler + 'static,
    ) -> Self {
        self.rpc.insert(
            method.as_str().to_string(),
            RpcEntry {
                handler: Arc::new(handler),
                exclusive: true,
            },
        );
        self
    }

    /// Register an event handler; `type_pattern` may contain wildcards,
    /// e.g. `order.*` (validated at `start()`).
    pub fn register_event(
        mut self,
        type_pattern: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.events.push((type_pattern.into(), Arc::new(handler)));
        self
    }

    /// Register a durable command handler.
    pub fn register_command(
        mut self,
        command: MethodName,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        self.commands
            .insert(command.as_str().to_string(), Arc::new(handler));
        self
    }

    /// Enroll this instance in a single-active election group.
    pub fn single_active(mut self, group: impl Into<String>) -> Self {
        self.single_active = Some(SingleActive {
            group: group.into(),
            hooks: Arc::new(NoopHooks),
        });
        self
    }

    /// Install leadership callbacks (requires
    /// [`single_active`](Self::single_active)).
    pub fn with_leadership_hooks(mut self, hooks: Arc<dyn LeadershipHooks>) -> Self {
        if let Some(single_active) = &mut self.single_active {
            single_active.hooks = hooks;
        }
        self
    }

    /// Attach metadata published with the registry entry.
    pub fn with_instance_metadata(
        mut self,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.instance_metadata = metadata;
        self
    }

    /// Bring the service up: open the bucket, register, wire dispatch,
    /// contend for leadership, and start the heartbeat loop.
    pub async fn start(self) -> Result<ServiceRuntime<B>> {
        self.config.validate()?;
        let config = self.config;
        let format = config.serialization;

        // Validate the handler table before any side effects.
        let handlers = HandlerTable {
            rpc: self.rpc,
            events: {
                let mut validated = Vec::with_capacity(self.events.len());
                for (raw, handler) in self.events {
                    validated.push((SubjectPattern::events(&raw)?, handler));
                }
                validated
            },
            commands: self.commands,
        };

        // The registry bucket also carries the leader keys (shared layout);
        // max_age covers TTL expiry on brokers without per-key TTLs.
        let kv = self
            .bus
            .kv_bucket(
                REGISTRY_BUCKET,
                KvBucketOptions {
                    max_age: Some(config.registry_ttl),
                    ..KvBucketOptions::default()
                },
            )
            .await?;
        let registry = KvServiceRegistry::new(kv.clone(), format, config.registry_ttl);

        let mut instance = ServiceInstance::new(
            config.service_name.clone(),
            config.instance_id.clone(),
            config.version.clone(),
        )
        .with_metadata(self.instance_metadata.clone());
        if let Some(single_active) = &self.single_active {
            instance = instance.with_sticky_active_group(single_active.group.clone());
        }
        registry.register(&instance).await?;

        let metrics = Arc::new(Metrics::new());
        // Non-single-active services are always "active" for exclusive
        // dispatch purposes.
        let active = Arc::new(AtomicBool::new(self.single_active.is_none()));
        let (shutdown, _) = watch::channel(false);

        let election = match &self.single_active {
            None => None,
            Some(single_active) => {
                let bridge = Arc::new(StatusBridge {
                    active: Arc::clone(&active),
                    metrics: Arc::clone(&metrics),
                    user: Arc::clone(&single_active.hooks),
                });
                let coordinator = ElectionCoordinator::new(
                    kv.clone(),
                    registry.clone(),
                    config.service_name.clone(),
                    config.instance_id.clone(),
                    single_active.group.clone(),
                    config.failover_policy(),
                    format,
                )
                .with_hooks(bridge)
                .with_metadata(self.instance_metadata.clone());
                Some(Arc::new(coordinator))
            }
        };

        let inner = Arc::new(RuntimeInner {
            config,
            bus: self.bus,
            registry,
            election,
            handlers,
            metrics,
            active,
            running: AtomicBool::new(true),
            heartbeat_failures: AtomicU32::new(0),
            instance: Mutex::new(instance),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        });

        spawn_dispatchers(&inner)?;

        if let Some(coordinator) = &inner.election {
            let watch_handle = coordinator.spawn_watch(inner.shutdown.subscribe());
            inner.tasks.lock().push(watch_handle);
            if !coordinator.start_election().await {
                inner.metrics.incr(counters::ELECTIONS_LOST);
            }
        }

        spawn_heartbeat_loop(&inner);
        publish_lifecycle(&inner, "registered").await;
        info!(
            service = %inner.config.service_name,
            instance = %inner.config.instance_id,
            "service started"
        );

        Ok(ServiceRuntime { inner })
    }
}

struct RuntimeInner<B: MessageBus> {
    config: AegisConfig,
    bus: B,
    registry: KvServiceRegistry<B::Kv>,
    election: Option<Arc<ElectionCoordinator<B::Kv>>>,
    handlers: HandlerTable,
    metrics: Arc<Metrics>,
    active: Arc<AtomicBool>,
    running: AtomicBool,
    heartbeat_failures: AtomicU32,
    instance: Mutex<ServiceInstance>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// A running service.
///
/// Cheaply cloneable handle; `stop()` is idempotent.
pub struct ServiceRuntime<B: MessageBus> {
    inner: Arc<RuntimeInner<B>>,
}

impl<B: MessageBus> Clone for ServiceRuntime<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: MessageBus> ServiceRuntime<B> {
    /// Whether this instance serves exclusive operations right now.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether `stop()` has not run yet.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The runtime's metrics sink.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// The service registry handle.
    pub fn registry(&self) -> &KvServiceRegistry<B::Kv> {
        &self.inner.registry
    }

    /// The election coordinator, when single-active is enabled.
    pub fn election(&self) -> Option<&Arc<ElectionCoordinator<B::Kv>>> {
        self.inner.election.as_ref()
    }

    /// Snapshot of the election state machine, when single-active is
    /// enabled.
    pub fn election_state(&self) -> Option<ElectionState> {
        self.inner
            .election
            .as_ref()
            .map(|coordinator| coordinator.election_state())
    }

    /// A caller-side client sharing this runtime's bus, with events
    /// stamped by this instance.
    pub fn client(&self) -> AegisClient<B> {
        AegisClient::new(self.inner.bus.clone(), self.inner.config.serialization).with_source(
            format!(
                "{}/{}",
                self.inner.config.service_name, self.inner.config.instance_id
            ),
        )
    }

    /// This instance's current registry record.
    pub fn instance(&self) -> ServiceInstance {
        self.inner.instance.lock().clone()
    }

    /// Graceful stop: release leadership, deregister, drain, disconnect.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            service = %self.inner.config.service_name,
            instance = %self.inner.config.instance_id,
            "stopping service"
        );
        publish_lifecycle(&self.inner, "unregistered").await;
        let _ = self.inner.shutdown.send(true);

        if let Some(coordinator) = &self.inner.election {
            coordinator.release_leadership().await;
        }

        {
            let mut instance = self.inner.instance.lock();
            instance.mark_shutdown();
        }
        if let Err(err) = self
            .inner
            .registry
            .deregister(
                &self.inner.config.service_name,
                &self.inner.config.instance_id,
            )
            .await
        {
            warn!(%err, "deregistration failed during stop");
        }

        // Drain in-flight handlers within the budget, then cut them loose.
        let drain_deadline = Instant::now() + self.inner.config.drain_timeout;
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for mut handle in handles {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!("task exceeded drain budget, aborting");
                handle.abort();
            }
        }

        self.inner.bus.disconnect().await
    }
}

/// Internal hooks bridging election outcomes onto the runtime's active
/// flag before (or after) the user hooks run.
struct StatusBridge {
    active: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    user: Arc<dyn LeadershipHooks>,
}

#[async_trait]
impl LeadershipHooks for StatusBridge {
    async fn on_elected(&self, metadata: &HashMap<String, serde_json::Value>) {
        self.metrics.incr(counters::ELECTIONS_WON);
        self.user.on_elected(metadata).await;
        // Visible as active only after the user hook finished preparing.
        self.active.store(true, Ordering::SeqCst);
    }

    async fn on_leadership_lost(&self, reason: &str) {
        // Reject exclusive traffic before anything else runs.
        self.active.store(false, Ordering::SeqCst);
        self.metrics.incr(counters::LEADERSHIP_LOST);
        self.user.on_leadership_lost(reason).await;
    }
}

fn spawn_dispatchers<B: MessageBus>(inner: &Arc<RuntimeInner<B>>) -> Result<()> {
    let mut tasks = inner.tasks.lock();

    if !inner.handlers.rpc.is_empty() {
        let runtime = Arc::clone(inner);
        tasks.push(spawn_supervised(
            "rpc_dispatch",
            Arc::clone(&inner.metrics),
            inner.shutdown.subscribe(),
            move || {
                let runtime = Arc::clone(&runtime);
                rpc_dispatch_loop(runtime)
            },
        ));
    }

    for (index, (pattern, _)) in inner.handlers.events.iter().enumerate() {
        let runtime = Arc::clone(inner);
        let pattern = pattern.clone();
        tasks.push(spawn_supervised(
            "event_dispatch",
            Arc::clone(&inner.metrics),
            inner.shutdown.subscribe(),
            move || {
                let runtime = Arc::clone(&runtime);
                let pattern = pattern.clone();
                event_dispatch_loop(runtime, index, pattern)
            },
        ));
    }

    for command in inner.handlers.commands.keys() {
        let runtime = Arc::clone(inner);
        let command = command.clone();
        tasks.push(spawn_supervised(
            "command_dispatch",
            Arc::clone(&inner.metrics),
            inner.shutdown.subscribe(),
            move || {
                let runtime = Arc::clone(&runtime);
                let command = command.clone();
                command_dispatch_loop(runtime, command)
            },
        ));
    }

    Ok(())
}

fn spawn_heartbeat_loop<B: MessageBus>(inner: &Arc<RuntimeInner<B>>) {
    let runtime = Arc::clone(inner);
    let handle = spawn_supervised(
        "heartbeat",
        Arc::clone(&inner.metrics),
        inner.shutdown.subscribe(),
        move || {
            let runtime = Arc::clone(&runtime);
            heartbeat_loop(runtime)
        },
    );
    inner.tasks.lock().push(handle);
}

/// One supervised loop, two schedules: registry TTL refresh and leader
/// renewal. Sharing the loop serializes leader renewals per group by
/// construction.
async fn heartbeat_loop<B: MessageBus>(inner: Arc<RuntimeInner<B>>) -> Result<()> {
    let mut shutdown = inner.shutdown.subscribe();
    let registry_period = inner.config.heartbeat_interval;
    let leader_period = inner.config.effective_leader_heartbeat_interval();

    let mut registry_tick = interval_at(Instant::now() + registry_period, registry_period);
    registry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut leader_tick = interval_at(Instant::now() + leader_period, leader_period);
    leader_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = registry_tick.tick() => registry_heartbeat_once(&inner).await,
            _ = leader_tick.tick() => {
                if let Some(coordinator) = &inner.election {
                    // Lost leadership is handled inside renew (callbacks,
                    // registry downgrade); the watch task schedules the
                    // next election.
                    let _ = coordinator.renew().await;
                }
            }
        }
    }
}

async fn registry_heartbeat_once<B: MessageBus>(inner: &Arc<RuntimeInner<B>>) {
    let service = &inner.config.service_name;
    let instance_id = &inner.config.instance_id;
    match inner.registry.heartbeat(service, instance_id).await {
        Ok((instance, recovered)) => {
            inner.metrics.incr(counters::HEARTBEATS);
            inner.heartbeat_failures.store(0, Ordering::SeqCst);
            *inner.instance.lock() = instance;
            if recovered {
                publish_lifecycle(inner, "recovered").await;
            }
        }
        Err(AegisError::NotFound { .. }) => {
            if !inner.running.load(Ordering::SeqCst) {
                return; // stop() already deregistered us
            }
            // Entry expired: re-register from the local copy.
            inner.metrics.incr(counters::HEARTBEAT_FAILURES);
            warn!(instance = %instance_id, "registry entry expired, re-registering");
            let mut instance = inner.instance.lock().clone();
            instance.heartbeat();
            match inner.registry.register(&instance).await {
                Ok(()) => *inner.instance.lock() = instance,
                Err(AegisError::AlreadyExists { .. }) => {
                    let _ = inner.registry.update_instance(&instance).await;
                }
                Err(err) => warn!(%err, "re-registration failed"),
            }
        }
        Err(err) => {
            inner.metrics.incr(counters::HEARTBEAT_FAILURES);
            let failures = inner.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(%err, failures, "registry heartbeat failed");
            if failures == HEARTBEAT_FAILURE_LIMIT {
                degrade_to_unhealthy(inner).await;
            }
        }
    }
}

/// Three consecutive heartbeat failures: mark UNHEALTHY, give up
/// leadership, and try to re-assert the registration.
async fn degrade_to_unhealthy<B: MessageBus>(inner: &Arc<RuntimeInner<B>>) {
    warn!(
        service = %inner.config.service_name,
        instance = %inner.config.instance_id,
        "degrading to UNHEALTHY after repeated heartbeat failures"
    );
    {
        let mut instance = inner.instance.lock();
        instance.mark_unhealthy();
    }
    if let Some(coordinator) = &inner.election {
        if coordinator.is_elected() {
            coordinator.release_leadership().await;
        }
    }
    let instance = inner.instance.lock().clone();
    if let Err(err) = inner.registry.update_instance(&instance).await {
        debug!(%err, "could not persist UNHEALTHY status, trying re-register");
        let _ = inner.registry.register(&instance).await;
    }
    publish_lifecycle(inner, "unhealthy").await;
}

async fn rpc_dispatch_loop<B: MessageBus>(inner: Arc<RuntimeInner<B>>) -> Result<()> {
    let service = &inner.config.service_name;
    let pattern = SubjectPattern::rpc_methods(service);
    // Queue group = service name: each request goes to one instance.
    let mut subscription = inner
        .bus
        .subscribe(&pattern, Some(service.as_str()))
        .await?;
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let message = tokio::select! {
            message = subscription.next() => message,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(message) = message else {
            return Ok(());
        };

        let response = handle_rpc(&inner, &message.payload).await;
        if let Some(reply_to) = message.reply_to {
            match codec::encode(&response, inner.config.serialization) {
                Ok(bytes) => {
                    if let Err(err) = inner.bus.publish(&reply_to, bytes).await {
                        warn!(%err, "failed to publish RPC reply");
                    }
                }
                Err(err) => warn!(%err, "failed to encode RPC reply"),
            }
        }
    }
}

async fn handle_rpc<B: MessageBus>(inner: &Arc<RuntimeInner<B>>, payload: &[u8]) -> RpcResponse {
    let request: RpcRequest = match codec::decode(payload) {
        Ok(request) => request,
        Err(err) => {
            inner.metrics.incr(counters::RPC_FAILED);
            return RpcResponse::failure(None, "SERIALIZATION", err.to_string());
        }
    };
    let correlation = Some(request.message_id);

    let Some(entry) = inner.handlers.rpc.get(request.method.as_str()) else {
        inner.metrics.incr(counters::RPC_FAILED);
        return RpcResponse::failure(
            correlation,
            "UNKNOWN_METHOD",
            format!("no handler registered for {}", request.method),
        );
    };

    if entry.exclusive && !inner.active.load(Ordering::SeqCst) {
        inner.metrics.incr(counters::RPC_NOT_ACTIVE);
        return RpcResponse::failure(
            correlation,
            "NOT_ACTIVE",
            format!("{} is in STANDBY mode", inner.config.instance_id),
        );
    }

    let deadline = Duration::from_millis(request.timeout_ms.max(1));
    match timeout(deadline, entry.handler.handle(request)).await {
        Ok(Ok(result)) => {
            inner.metrics.incr(counters::RPC_SERVED);
            RpcResponse::ok(correlation, result)
        }
        Ok(Err(err)) => {
            inner.metrics.incr(counters::RPC_FAILED);
            RpcResponse::failure(correlation, error_code(&err), err.to_string())
        }
        Err(_) => {
            inner.metrics.incr(counters::RPC_FAILED);
            RpcResponse::failure(correlation, "TIMEOUT", "handler exceeded its deadline")
        }
    }
}

async fn event_dispatch_loop<B: MessageBus>(
    inner: Arc<RuntimeInner<B>>,
    handler_index: usize,
    pattern: SubjectPattern,
) -> Result<()> {
    let Some((_, handler)) = inner.handlers.events.get(handler_index) else {
        return Ok(());
    };
    let handler = Arc::clone(handler);
    let mut subscription = inner.bus.subscribe(&pattern, None).await?;
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let message = tokio::select! {
            message = subscription.next() => message,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(message) = message else {
            return Ok(());
        };
        match codec::decode::<Event>(&message.payload) {
            Ok(event) => {
                inner.metrics.incr(counters::EVENTS_RECEIVED);
                if let Err(err) = handler.handle(event).await {
                    warn!(%err, subject = %message.subject, "event handler failed");
                }
            }
            Err(err) => warn!(%err, subject = %message.subject, "undecodable event"),
        }
    }
}

async fn command_dispatch_loop<B: MessageBus>(
    inner: Arc<RuntimeInner<B>>,
    command_name: String,
) -> Result<()> {
    let Some(handler) = inner.handlers.commands.get(&command_name) else {
        return Ok(());
    };
    let handler = Arc::clone(handler);
    let service = &inner.config.service_name;
    let method = MethodName::new(command_name.clone())?;
    let subject = Subject::command(service, &method);
    let durable = format!("{service}-{command_name}");

    let mut subscription = inner
        .bus
        .work_queue_subscribe(
            COMMANDS_STREAM,
            &SubjectPattern::exact(&subject),
            &durable,
            QUEUE_MAX_DELIVER,
        )
        .await?;
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let delivery = tokio::select! {
            delivery = subscription.next() => delivery,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(delivery) = delivery else {
            return Ok(());
        };
        process_command_delivery(&inner, &handler, delivery).await;
    }
}

async fn process_command_delivery<B: MessageBus>(
    inner: &Arc<RuntimeInner<B>>,
    handler: &Arc<dyn CommandHandler>,
    delivery: QueueMessage,
) {
    let format = inner.config.serialization;
    let command: Command = match codec::decode(&delivery.payload) {
        Ok(command) => command,
        Err(err) => {
            // Undecodable payloads can never succeed; drop them.
            warn!(%err, subject = %delivery.subject, "undecodable command, dropping");
            let _ = delivery.term().await;
            return;
        }
    };

    // The envelope's own retry budget; naks count as retries, so delivery
    // number max_retries + 1 means the budget is spent.
    if delivery.delivery_count > command.max_retries {
        warn!(
            command = %command.command,
            id = %command.message_id,
            deliveries = delivery.delivery_count,
            "command retry budget exhausted, dead-lettering"
        );
        inner.metrics.incr(counters::COMMANDS_DEAD_LETTERED);
        publish_command_result(
            inner,
            CommandResult::failed(command.message_id, "retry budget exhausted"),
        )
        .await;
        let _ = delivery.term().await;
        return;
    }

    // Forward progress reports to commands.progress.<id> off the handler's
    // critical path.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(f64, String)>();
    let reporter = ProgressReporter::new(command.message_id, progress_tx);
    let forwarder = {
        let bus = inner.bus.clone();
        let subject = Subject::command_progress(command.message_id);
        let message_id = command.message_id;
        tokio::spawn(async move {
            while let Some((percent, status)) = progress_rx.recv().await {
                let progress = CommandProgress::new(message_id, percent, status);
                match codec::encode(&progress, format) {
                    Ok(bytes) => {
                        if bus.publish(&subject, bytes).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(%err, "failed to encode command progress"),
                }
            }
        })
    };

    let deadline = Duration::from_millis(command.timeout_ms.max(1));
    let outcome = timeout(deadline, handler.handle(command.clone(), reporter)).await;
    // Reporter dropped above; wait for the forwarder to flush so progress
    // is observed before the result.
    let _ = forwarder.await;

    match outcome {
        Ok(Ok(result)) => {
            inner.metrics.incr(counters::COMMANDS_COMPLETED);
            publish_command_result(inner, CommandResult::completed(command.message_id, result))
                .await;
            let _ = delivery.ack().await;
        }
        Ok(Err(err)) => {
            inner.metrics.incr(counters::COMMANDS_RETRIED);
            warn!(
                %err,
                command = %command.command,
                id = %command.message_id,
                delivery = delivery.delivery_count,
                "command handler failed, requeueing"
            );
            if delivery.delivery_count > command.max_retries.saturating_sub(1) {
                // That was the last attempt in the budget.
                inner.metrics.incr(counters::COMMANDS_DEAD_LETTERED);
                publish_command_result(
                    inner,
                    CommandResult::failed(command.message_id, err.to_string()),
                )
                .await;
                let _ = delivery.term().await;
            } else {
                let _ = delivery.nak(None).await;
            }
        }
        Err(_) => {
            inner.metrics.incr(counters::COMMANDS_RETRIED);
            publish_command_result(
                inner,
                CommandResult::timed_out(
                    command.message_id,
                    format!("handler exceeded {deadline:?}"),
                ),
            )
            .await;
            let _ = delivery.nak(None).await;
        }
    }
}

async fn publish_command_result<B: MessageBus>(
    inner: &Arc<RuntimeInner<B>>,
    result: CommandResult,
) {
    let subject = Subject::command_result(result.message_id);
    match codec::encode(&result, inner.config.serialization) {
        Ok(bytes) => {
            if let Err(err) = inner.bus.publish(&subject, bytes).await {
                warn!(%err, "failed to publish command result");
            }
        }
        Err(err) => warn!(%err, "failed to encode command result"),
    }
}

/// Best-effort lifecycle events on `events.service.<action>`.
async fn publish_lifecycle<B: MessageBus>(inner: &Arc<RuntimeInner<B>>, action: &str) {
    let Ok(event_type) = EventType::new(format!("service.{action}")) else {
        return;
    };
    let event = Event::new(
        event_type,
        serde_json::json!({
            "service_name": inner.config.service_name.as_str(),
            "instance_id": inner.config.instance_id.as_str(),
            "version": inner.config.version,
        }),
    )
    .with_source(format!(
        "{}/{}",
        inner.config.service_name, inner.config.instance_id
    ));
    let subject = Subject::event(&event.event_type);
    if let Ok(bytes) = codec::encode(&event, inner.config.serialization) {
        let _ = inner.bus.publish(&subject, bytes).await;
    }
}

fn error_code(err: &AegisError) -> &'static str {
    match err {
        AegisError::Config { .. } => "CONFIG",
        AegisError::Validation { .. } => "VALIDATION",
        AegisError::Transport { .. } => "TRANSPORT",
        AegisError::Timeout { .. } => "TIMEOUT",
        AegisError::NotConnected => "NOT_CONNECTED",
        AegisError::Serialization { .. } => "SERIALIZATION",
        AegisError::AlreadyExists { .. } => "ALREADY_EXISTS",
        AegisError::RevisionMismatch { .. } => "REVISION_MISMATCH",
        AegisError::NotFound { .. } => "NOT_FOUND",
        AegisError::Handler { .. } => "HANDLER_ERROR",
        AegisError::LeadershipLost { .. } => "LEADERSHIP_LOST",
    }
}
