//! Group-scoped leader election over the KV store.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

// Layer 3: Internal module imports
use super::hooks::{LeadershipHooks, NoopHooks};
use super::policy::FailoverPolicy;
use super::state::{ElectionPhase, ElectionState};
use crate::codec::SerializationFormat;
use crate::domain::{InstanceId, ServiceName, StickyActiveStatus};
use crate::error::{AegisError, Result};
use crate::kv::{KvStore, KvStoreExt, KvWatchEventKind, PutOptions};
use crate::message::subject::leader_key;
use crate::registry::KvServiceRegistry;

/// Value stored under the leader key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderRecord {
    /// The instance holding leadership.
    pub instance_id: InstanceId,
    /// Leader metadata surfaced to `on_elected`.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When leadership was acquired.
    pub acquired_at: DateTime<Utc>,
}

struct Leadership {
    record: LeaderRecord,
    revision: u64,
}

/// At-most-one-active election for one `(service, group)` pair.
///
/// The coordinator owns no timers: the service runtime drives [`renew`]
/// from its consolidated heartbeat loop, and [`spawn_watch`] reacts to
/// leader-key vacancy. Elections themselves are serialized internally, so
/// the watch task and an explicit [`start_election`] can never interleave.
///
/// [`renew`]: ElectionCoordinator::renew
/// [`start_election`]: ElectionCoordinator::start_election
/// [`spawn_watch`]: ElectionCoordinator::spawn_watch
pub struct ElectionCoordinator<K: KvStore> {
    kv: K,
    registry: KvServiceRegistry<K>,
    service_name: ServiceName,
    instance_id: InstanceId,
    group_id: String,
    policy: FailoverPolicy,
    format: SerializationFormat,
    metadata: HashMap<String, serde_json::Value>,
    hooks: Arc<dyn LeadershipHooks>,
    state: Mutex<ElectionState>,
    leadership: Mutex<Option<Leadership>>,
    renewal_failures: AtomicU32,
    election_gate: tokio::sync::Mutex<()>,
}

impl<K: KvStore> ElectionCoordinator<K> {
    /// Create a coordinator; it does nothing until an election is started
    /// or its watch task is spawned.
    pub fn new(
        kv: K,
        registry: KvServiceRegistry<K>,
        service_name: ServiceName,
        instance_id: InstanceId,
        group_id: impl Into<String>,
        policy: FailoverPolicy,
        format: SerializationFormat,
    ) -> Self {
        Self {
            kv,
            registry,
            service_name,
            instance_id,
            group_id: group_id.into(),
            policy,
            format,
            metadata: HashMap::new(),
            hooks: Arc::new(NoopHooks),
            state: Mutex::new(ElectionState::idle()),
            leadership: Mutex::new(None),
            renewal_failures: AtomicU32::new(0),
            election_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Builder method: install leadership callbacks.
    pub fn with_hooks(mut self, hooks: Arc<dyn LeadershipHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builder method: metadata published in the leader record.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The group this coordinator contends in.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// The failover policy in effect.
    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    /// Snapshot of the election state machine.
    pub fn election_state(&self) -> ElectionState {
        self.state.lock().clone()
    }

    /// Whether this instance currently holds leadership.
    pub fn is_elected(&self) -> bool {
        self.state.lock().is_elected()
    }

    fn leader_key(&self) -> String {
        leader_key(&self.service_name, &self.group_id)
    }

    /// Read-only probe: does the leader key currently name us?
    pub async fn check_leadership(&self) -> bool {
        match self.kv.get_typed::<LeaderRecord>(&self.leader_key()).await {
            Ok(Some((record, _))) => record.instance_id == self.instance_id,
            Ok(None) => false,
            Err(err) => {
                error!(%err, "leadership check failed");
                false
            }
        }
    }

    /// Contend for leadership once.
    ///
    /// Returns `true` when this instance holds the key afterwards (either
    /// it won the create race or it already was the leader and extended the
    /// TTL). One attempt is bounded by `max_election_time`; exceeding it
    /// forces the `Failed` phase.
    pub async fn start_election(&self) -> bool {
        let _gate = self.election_gate.lock().await;
        self.state.lock().transition(ElectionPhase::Campaigning);

        let attempt = timeout(self.policy.max_election_time, self.attempt_leadership()).await;
        match attempt {
            Ok(Ok(true)) => {
                self.update_instance_status(StickyActiveStatus::Active).await;
                // on_elected is awaited before the state flips, so exclusive
                // handlers never run ahead of the hook.
                self.hooks.on_elected(&self.metadata).await;
                self.state.lock().transition(ElectionPhase::Elected);
                self.renewal_failures.store(0, Ordering::SeqCst);
                info!(
                    service = %self.service_name,
                    instance = %self.instance_id,
                    group = %self.group_id,
                    "elected leader"
                );
                true
            }
            Ok(Ok(false)) => {
                self.update_instance_status(StickyActiveStatus::Standby).await;
                self.state.lock().fail("another instance holds leadership");
                debug!(
                    service = %self.service_name,
                    instance = %self.instance_id,
                    group = %self.group_id,
                    "election lost"
                );
                false
            }
            Ok(Err(err)) => {
                self.state.lock().fail(err.to_string());
                warn!(%err, group = %self.group_id, "election attempt errored");
                false
            }
            Err(_) => {
                let reason = format!(
                    "election timed out after {:?}",
                    self.policy.max_election_time
                );
                self.state.lock().fail(reason.clone());
                warn!(group = %self.group_id, "{reason}");
                false
            }
        }
    }

    /// The create-or-extend step of one election attempt.
    async fn attempt_leadership(&self) -> Result<bool> {
        let key = self.leader_key();
        match self.kv.get_typed::<LeaderRecord>(&key).await? {
            Some((record, revision)) if record.instance_id == self.instance_id => {
                // Already leader: extend the TTL in place.
                let extend = self
                    .kv
                    .put_typed(
                        &key,
                        &record,
                        self.format,
                        PutOptions::with_revision(revision).with_ttl(self.policy.leader_ttl),
                    )
                    .await;
                match extend {
                    Ok(new_revision) => {
                        *self.leadership.lock() = Some(Leadership {
                            record,
                            revision: new_revision,
                        });
                        Ok(true)
                    }
                    Err(AegisError::RevisionMismatch { .. }) => Ok(false),
                    Err(err) => Err(err),
                }
            }
            Some(_) => Ok(false),
            None => {
                let record = LeaderRecord {
                    instance_id: self.instance_id.clone(),
                    metadata: self.metadata.clone(),
                    acquired_at: Utc::now(),
                };
                let create = self
                    .kv
                    .put_typed(
                        &key,
                        &record,
                        self.format,
                        PutOptions::create_only().with_ttl(self.policy.leader_ttl),
                    )
                    .await;
                match create {
                    Ok(revision) => {
                        *self.leadership.lock() = Some(Leadership { record, revision });
                        Ok(true)
                    }
                    // Someone else won the race.
                    Err(AegisError::AlreadyExists { .. }) => Ok(false),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Renew the leader key; a no-op unless elected.
    ///
    /// Driven by the runtime's heartbeat loop, which serializes renewals
    /// per group. A lost CAS means another instance took over (or the key
    /// expired): leadership is surrendered immediately. Transport errors
    /// are tolerated up to `max_failures` consecutive times.
    pub async fn renew(&self) -> Result<()> {
        if !self.is_elected() {
            return Ok(());
        }
        let Some((record, revision)) = self
            .leadership
            .lock()
            .as_ref()
            .map(|held| (held.record.clone(), held.revision))
        else {
            return Ok(());
        };

        let key = self.leader_key();
        let renewed = self
            .kv
            .put_typed(
                &key,
                &record,
                self.format,
                PutOptions::with_revision(revision).with_ttl(self.policy.leader_ttl),
            )
            .await;
        match renewed {
            Ok(new_revision) => {
                if let Some(held) = self.leadership.lock().as_mut() {
                    held.revision = new_revision;
                }
                self.renewal_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(AegisError::RevisionMismatch { .. }) | Err(AegisError::NotFound { .. }) => {
                let reason = "leader key lost or overwritten";
                self.handle_leadership_lost(reason).await;
                Err(AegisError::LeadershipLost {
                    reason: reason.to_string(),
                })
            }
            Err(err) => {
                let failures = self.renewal_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.policy.max_failures {
                    let reason = format!("renewal failed {failures} consecutive times: {err}");
                    self.handle_leadership_lost(&reason).await;
                    Err(AegisError::LeadershipLost { reason })
                } else {
                    warn!(%err, failures, "leader renewal failed, will retry");
                    Ok(())
                }
            }
        }
    }

    /// Voluntarily give up leadership.
    ///
    /// CAS-deletes the leader key only while its value still names this
    /// instance, so a successor's key is never removed.
    pub async fn release_leadership(&self) {
        let key = self.leader_key();
        match self.kv.get_typed::<LeaderRecord>(&key).await {
            Ok(Some((record, revision))) if record.instance_id == self.instance_id => {
                if let Err(err) = self.kv.delete(&key, Some(revision)).await {
                    if !err.is_contention() {
                        warn!(%err, "failed to delete leader key on release");
                    }
                }
                self.handle_leadership_lost("released").await;
            }
            Ok(_) => {
                // Not the leader: nothing to delete, just settle locally.
                self.state.lock().transition(ElectionPhase::Idle);
                *self.leadership.lock() = None;
            }
            Err(err) => {
                warn!(%err, "could not read leader key on release");
                if self.is_elected() {
                    // The TTL will reap the key; surrender locally anyway.
                    self.handle_leadership_lost("released while broker unreachable")
                        .await;
                }
            }
        }
    }

    /// External election trigger (e.g. an operator tool); ignored with a
    /// warning when the target does not match this coordinator.
    pub async fn trigger_election(&self, service: &str, group: &str) -> bool {
        if service != self.service_name.as_str() || group != self.group_id {
            warn!(
                requested_service = service,
                requested_group = group,
                service = %self.service_name,
                group = %self.group_id,
                "ignoring election trigger for a different target"
            );
            return false;
        }
        self.start_election().await
    }

    /// Watch the leader key and contend (after jitter) whenever it
    /// vacates. Every instance of the group runs this, elected or not.
    pub fn spawn_watch(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut kv_watch = match coordinator.kv.watch(&coordinator.leader_key(), None).await
                {
                    Ok(kv_watch) => kv_watch,
                    Err(err) => {
                        warn!(%err, "leader watch failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            _ = shutdown.changed() => return,
                        }
                    }
                };
                loop {
                    let event = tokio::select! {
                        event = kv_watch.next() => event,
                        _ = shutdown.changed() => return,
                    };
                    let Some(event) = event else {
                        break; // watch closed; restart it
                    };
                    if !matches!(
                        event.kind,
                        KvWatchEventKind::Delete | KvWatchEventKind::Expired
                    ) {
                        continue;
                    }
                    if coordinator.is_elected() {
                        // Our own release in flight; renewals handle takeover.
                        continue;
                    }
                    let delay = coordinator.policy.jittered_election_delay();
                    debug!(
                        group = %coordinator.group_id,
                        ?delay,
                        "leader key vacated, contending after jitter"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                    let _ = coordinator.start_election().await;
                }
            }
        })
    }

    async fn handle_leadership_lost(&self, reason: &str) {
        // Safety first: stop reporting elected before anything else so
        // exclusive handlers reject immediately.
        self.state.lock().transition(ElectionPhase::Idle);
        *self.leadership.lock() = None;
        self.renewal_failures.store(0, Ordering::SeqCst);
        self.update_instance_status(StickyActiveStatus::Standby).await;
        self.hooks.on_leadership_lost(reason).await;
        info!(
            service = %self.service_name,
            instance = %self.instance_id,
            group = %self.group_id,
            reason,
            "leadership lost"
        );
    }

    /// Mirror the election outcome into this instance's registry entry;
    /// that is what makes at-most-one-active observable to discovery.
    async fn update_instance_status(&self, status: StickyActiveStatus) {
        match self
            .registry
            .get_instance(&self.service_name, &self.instance_id)
            .await
        {
            Ok(Some(mut instance)) => {
                instance.set_sticky_active_status(status);
                if instance.sticky_active_group.is_none() {
                    instance.sticky_active_group = Some(self.group_id.clone());
                }
                if let Err(err) = self.registry.update_instance(&instance).await {
                    warn!(%err, "failed to update sticky status in registry");
                }
            }
            Ok(None) => {
                warn!(
                    instance = %self.instance_id,
                    "instance not registered while updating sticky status"
                );
            }
            Err(err) => warn!(%err, "could not read instance while updating sticky status"),
        }
    }
}
