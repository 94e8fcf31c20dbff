//! Election integration tests: contention, failover, stickiness, and the
//! at-most-one-active invariant under leader churn.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use aegis_core::codec::SerializationFormat;
use aegis_core::domain::{
    InstanceId, ServiceInstance, ServiceName, StickyActiveStatus,
};
use aegis_core::election::{
    ElectionCoordinator, FailoverPolicy, LeaderRecord, LeadershipHooks,
};
use aegis_core::error::AegisError;
use aegis_core::kv::{KvBucketOptions, KvStoreExt, MemoryKvStore};
use aegis_core::message::subject::leader_key;
use aegis_core::registry::{KvServiceRegistry, REGISTRY_BUCKET};

const FORMAT: SerializationFormat = SerializationFormat::MessagePack;
const GROUP: &str = "default";

fn fast_policy() -> FailoverPolicy {
    FailoverPolicy::balanced()
        .with_leader_ttl(Duration::from_millis(200))
        .with_election_delay(Duration::from_millis(30))
        .with_max_election_time(Duration::from_secs(2))
}

struct Cluster {
    kv: MemoryKvStore,
    registry: KvServiceRegistry<MemoryKvStore>,
    service: ServiceName,
}

impl Cluster {
    fn new() -> Self {
        let kv = MemoryKvStore::new(REGISTRY_BUCKET, KvBucketOptions::default());
        let registry = KvServiceRegistry::new(kv.clone(), FORMAT, Duration::from_secs(30));
        Self {
            kv,
            registry,
            service: ServiceName::new("order-service").unwrap(),
        }
    }

    async fn contender(&self, id: &str) -> Arc<ElectionCoordinator<MemoryKvStore>> {
        let instance_id = InstanceId::new(id).unwrap();
        let record = ServiceInstance::new(self.service.clone(), instance_id.clone(), "1.0.0")
            .with_sticky_active_group(GROUP);
        self.registry.register(&record).await.unwrap();
        Arc::new(ElectionCoordinator::new(
            self.kv.clone(),
            self.registry.clone(),
            self.service.clone(),
            instance_id,
            GROUP,
            fast_policy(),
            FORMAT,
        ))
    }

    async fn leader_record(&self) -> Option<LeaderRecord> {
        let key = leader_key(&self.service, GROUP);
        self.kv
            .get_typed::<LeaderRecord>(&key)
            .await
            .unwrap()
            .map(|(record, _)| record)
    }

    async fn active_count(&self) -> usize {
        self.registry
            .list_instances(Some(&self.service))
            .await
            .unwrap()
            .iter()
            .filter(|instance| {
                instance.sticky_active_status == Some(StickyActiveStatus::Active)
            })
            .count()
    }
}

async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
struct RecordingHooks {
    lost: AtomicUsize,
}

#[async_trait]
impl LeadershipHooks for RecordingHooks {
    async fn on_leadership_lost(&self, _reason: &str) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }
}

/// S1: two contenders start simultaneously; exactly one wins and the
/// registry shows one ACTIVE and one STANDBY.
#[tokio::test]
async fn two_contenders_exactly_one_wins() {
    let cluster = Cluster::new();
    let i1 = cluster.contender("i-1").await;
    let i2 = cluster.contender("i-2").await;

    let (won1, won2) = tokio::join!(
        {
            let i1 = Arc::clone(&i1);
            async move { i1.start_election().await }
        },
        {
            let i2 = Arc::clone(&i2);
            async move { i2.start_election().await }
        }
    );
    assert!(won1 ^ won2, "exactly one must win, got {won1}/{won2}");

    let instances = cluster
        .registry
        .list_instances(Some(&cluster.service))
        .await
        .unwrap();
    let statuses: Vec<_> = instances
        .iter()
        .map(|instance| instance.sticky_active_status.unwrap())
        .collect();
    assert_eq!(
        statuses
            .iter()
            .filter(|status| **status == StickyActiveStatus::Active)
            .count(),
        1
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|status| **status == StickyActiveStatus::Standby)
            .count(),
        1
    );

    let record = cluster.leader_record().await.unwrap();
    let winner = if won1 { "i-1" } else { "i-2" };
    assert_eq!(record.instance_id.as_str(), winner);
}

/// S2: the leader dies (stops renewing, no graceful release); the standby
/// takes over within the failover bound and the key never names two
/// instances.
#[tokio::test]
async fn failover_after_leader_death() {
    let cluster = Cluster::new();
    let i1 = cluster.contender("i-1").await;
    let i2 = cluster.contender("i-2").await;

    assert!(i1.start_election().await);
    assert!(!i2.start_election().await);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _watch = i2.spawn_watch(shutdown_rx);

    // i-1 "dies": it simply never renews, so the key expires.
    let policy = fast_policy();
    let bound = policy.leader_ttl + policy.election_delay + policy.max_election_time;
    let taken_over = wait_until(bound, || i2.is_elected()).await;
    assert!(taken_over, "standby did not take over within {bound:?}");

    let record = cluster.leader_record().await.unwrap();
    assert_eq!(record.instance_id.as_str(), "i-2");

    // The dead leader finds out the moment it tries to renew.
    let err = i1.renew().await.unwrap_err();
    assert!(matches!(err, AegisError::LeadershipLost { .. }));
    assert!(!i1.is_elected());
}

/// Stickiness: a leader that keeps renewing holds leadership across many
/// TTL windows with no spurious loss.
#[tokio::test]
async fn healthy_leader_keeps_leadership() {
    let cluster = Cluster::new();
    let hooks = Arc::new(RecordingHooks::default());
    let instance_id = InstanceId::new("i-1").unwrap();
    let record = ServiceInstance::new(cluster.service.clone(), instance_id.clone(), "1.0.0")
        .with_sticky_active_group(GROUP);
    cluster.registry.register(&record).await.unwrap();
    let leader = Arc::new(
        ElectionCoordinator::new(
            cluster.kv.clone(),
            cluster.registry.clone(),
            cluster.service.clone(),
            instance_id,
            GROUP,
            fast_policy(),
            FORMAT,
        )
        .with_hooks(hooks.clone()),
    );
    assert!(leader.start_election().await);

    let policy = fast_policy();
    // Renew on schedule for five full TTL windows.
    for _ in 0..15 {
        tokio::time::sleep(policy.heartbeat_interval).await;
        leader.renew().await.unwrap();
    }

    assert!(leader.is_elected());
    assert!(leader.check_leadership().await);
    assert_eq!(hooks.lost.load(Ordering::SeqCst), 0);
}

/// Voluntary release hands leadership to a watching standby.
#[tokio::test]
async fn release_triggers_standby_takeover() {
    let cluster = Cluster::new();
    let i1 = cluster.contender("i-1").await;
    let i2 = cluster.contender("i-2").await;

    assert!(i1.start_election().await);
    assert!(!i2.start_election().await);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _watch = i2.spawn_watch(shutdown_rx);

    i1.release_leadership().await;

    let taken_over = wait_until(Duration::from_secs(3), || i2.is_elected()).await;
    assert!(taken_over);
    let record = cluster.leader_record().await.unwrap();
    assert_eq!(record.instance_id.as_str(), "i-2");
}

/// Leader metadata travels with the leader record into `on_elected`.
#[tokio::test]
async fn leader_record_carries_metadata() {
    let cluster = Cluster::new();
    let instance_id = InstanceId::new("i-1").unwrap();
    let record = ServiceInstance::new(cluster.service.clone(), instance_id.clone(), "1.0.0")
        .with_sticky_active_group(GROUP);
    cluster.registry.register(&record).await.unwrap();

    let mut metadata = HashMap::new();
    metadata.insert("zone".to_string(), serde_json::json!("us-east-1a"));
    let leader = ElectionCoordinator::new(
        cluster.kv.clone(),
        cluster.registry.clone(),
        cluster.service.clone(),
        instance_id,
        GROUP,
        fast_policy(),
        FORMAT,
    )
    .with_metadata(metadata);

    assert!(leader.start_election().await);
    let record = cluster.leader_record().await.unwrap();
    assert_eq!(record.metadata.get("zone"), Some(&serde_json::json!("us-east-1a")));
}

/// Chaos-style churn: repeatedly kill the current leader; a successor
/// always emerges and the registry never shows two ACTIVE instances.
///
/// Each contender runs a renewal loop (as the service runtime would); a
/// kill aborts that loop and deregisters the instance, so only the victim's
/// key expires.
#[tokio::test]
async fn at_most_one_active_under_leader_churn() {
    let cluster = Cluster::new();
    let contenders = vec![
        cluster.contender("i-1").await,
        cluster.contender("i-2").await,
        cluster.contender("i-3").await,
    ];

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut watches = Vec::new();
    let mut renewals = Vec::new();
    for contender in &contenders {
        watches.push(contender.spawn_watch(shutdown_rx.clone()));
        let renewer = Arc::clone(contender);
        renewals.push(tokio::spawn(async move {
            let interval = renewer.policy().heartbeat_interval;
            loop {
                tokio::time::sleep(interval).await;
                let _ = renewer.renew().await;
            }
        }));
    }
    assert!(contenders[0].start_election().await);

    let mut alive: Vec<usize> = (0..contenders.len()).collect();
    for _round in 0..2 {
        // Find the current leader among the living.
        let position = alive
            .iter()
            .position(|index| contenders[*index].is_elected())
            .unwrap();
        let killed = alive.remove(position);

        // "Kill": stop renewing and deregister; the key expires on its own.
        renewals[killed].abort();
        cluster
            .registry
            .deregister(
                &cluster.service,
                &InstanceId::new(format!("i-{}", killed + 1)).unwrap(),
            )
            .await
            .unwrap();

        // Sample the registry while failover happens.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut new_leader = false;
        while Instant::now() < deadline {
            assert!(cluster.active_count().await <= 1, "two ACTIVE instances");
            let survivor_elected = alive.iter().any(|index| contenders[*index].is_elected());
            if survivor_elected {
                new_leader = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(new_leader, "no successor elected after killing leader");
    }

    for renewal in &renewals {
        renewal.abort();
    }
}
