//! Runtime lifecycle tests: heartbeats, lifecycle events, single-active
//! failover between two running services.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use aegis_core::codec::SerializationFormat;
use aegis_core::config::AegisConfig;
use aegis_core::domain::{InstanceId, MethodName, ServiceName, StickyActiveStatus};
use aegis_core::message::{Event, RpcRequest, SubjectPattern};
use aegis_core::patterns::AegisClient;
use aegis_core::runtime::ServiceRuntimeBuilder;
use aegis_core::transport::{InMemoryMessageBus, MessageBus};

/// Opt-in tracing for debugging a failing test: RUST_LOG=debug cargo test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn config(service_name: &str, instance: &str) -> AegisConfig {
    AegisConfig::builder("memory://local", service_name)
        .unwrap()
        .with_instance_id(InstanceId::new(instance).unwrap())
        .with_registry_ttl(Duration::from_millis(300))
        .with_heartbeat_interval(Duration::from_millis(80))
        .with_leader_ttl(Duration::from_millis(250))
        .with_leader_heartbeat_interval(Duration::from_millis(60))
        .with_election_delay(Duration::from_millis(20))
        .build()
        .unwrap()
}

/// The heartbeat loop keeps the registration alive well past the registry
/// TTL.
#[tokio::test]
async fn heartbeats_keep_registration_alive() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("svc", "i-1"), bus)
        .start()
        .await
        .unwrap();

    // Three full TTL windows.
    tokio::time::sleep(Duration::from_millis(900)).await;

    let service = ServiceName::new("svc").unwrap();
    let listed = runtime
        .registry()
        .list_instances(Some(&service))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1, "instance fell out of the registry");
    assert!(runtime.metrics().counter("heartbeats") >= 3);
    runtime.stop().await.unwrap();
}

/// Lifecycle events are published on `events.service.*`.
#[tokio::test]
async fn lifecycle_events_are_published() {
    let bus = InMemoryMessageBus::new();
    let mut lifecycle = bus
        .subscribe(&SubjectPattern::new("events.service.*").unwrap(), None)
        .await
        .unwrap();

    let runtime = ServiceRuntimeBuilder::new(config("svc", "i-1"), bus.handle())
        .start()
        .await
        .unwrap();

    let registered = tokio::time::timeout(Duration::from_secs(1), lifecycle.next())
        .await
        .unwrap()
        .unwrap();
    let event: Event = aegis_core::codec::decode(&registered.payload).unwrap();
    assert_eq!(event.event_type.as_str(), "service.registered");
    assert_eq!(event.payload["instance_id"], "i-1");

    runtime.stop().await.unwrap();
    let unregistered = tokio::time::timeout(Duration::from_secs(1), lifecycle.next())
        .await
        .unwrap()
        .unwrap();
    let event: Event = aegis_core::codec::decode(&unregistered.payload).unwrap();
    assert_eq!(event.event_type.as_str(), "service.unregistered");
}

/// Graceful failover between two runtimes: stopping the active instance
/// promotes the standby, which then serves exclusive RPCs.
#[tokio::test]
async fn single_active_failover_between_runtimes() {
    init_tracing();
    let bus = InMemoryMessageBus::new();

    // Each runtime owns its own connection onto the shared broker, as
    // separate processes would.
    let build = |instance: &str| {
        ServiceRuntimeBuilder::new(config("svc", instance), bus.handle())
            .register_exclusive_rpc(
                MethodName::new("do_work").unwrap(),
                |_request: RpcRequest| async move { Ok(serde_json::json!({"ok": true})) },
            )
            .single_active("g")
    };

    let first = build("i-1").start().await.unwrap();
    let second = build("i-2").start().await.unwrap();
    assert!(first.is_active());
    assert!(!second.is_active());

    first.stop().await.unwrap();

    // The standby notices the release through its watch and takes over.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !second.is_active() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(second.is_active(), "standby never became active");

    let registry = second.registry();
    let service = ServiceName::new("svc").unwrap();
    let instances = registry.list_instances(Some(&service)).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(
        instances[0].sticky_active_status,
        Some(StickyActiveStatus::Active)
    );

    let client = AegisClient::new(bus.clone(), SerializationFormat::MessagePack);
    let response = client
        .call_rpc(
            &service,
            &MethodName::new("do_work").unwrap(),
            serde_json::Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(response.success);

    second.stop().await.unwrap();
}

/// Election state is observable through the runtime.
#[tokio::test]
async fn election_state_snapshot() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("svc", "i-1"), bus)
        .single_active("g")
        .start()
        .await
        .unwrap();

    let state = runtime.election_state().unwrap();
    assert!(state.is_elected());
    assert!(runtime.election().unwrap().check_leadership().await);
    runtime.stop().await.unwrap();
}

/// A runtime without single-active has no coordinator and is always
/// active.
#[tokio::test]
async fn plain_service_has_no_election() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("svc", "i-1"), bus)
        .start()
        .await
        .unwrap();
    assert!(runtime.election().is_none());
    assert!(runtime.election_state().is_none());
    assert!(runtime.is_active());
    runtime.stop().await.unwrap();
}
