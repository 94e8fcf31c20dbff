//! End-to-end messaging pattern tests over the in-memory bus: RPC,
//! exclusive RPC, event wildcards, command progress, and redelivery.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use aegis_core::codec::SerializationFormat;
use aegis_core::config::AegisConfig;
use aegis_core::domain::{EventType, InstanceId, MethodName, Priority, ServiceName};
use aegis_core::error::AegisError;
use aegis_core::message::{conforms_to_grammar, Command, Event, RpcRequest};
use aegis_core::patterns::{AegisClient, ProgressReporter};
use aegis_core::runtime::ServiceRuntimeBuilder;
use aegis_core::transport::InMemoryMessageBus;

fn method(name: &str) -> MethodName {
    MethodName::new(name).unwrap()
}

fn service(name: &str) -> ServiceName {
    ServiceName::new(name).unwrap()
}

fn config(service_name: &str, instance: &str) -> AegisConfig {
    AegisConfig::builder("memory://local", service_name)
        .unwrap()
        .with_instance_id(InstanceId::new(instance).unwrap())
        .with_registry_ttl(Duration::from_millis(800))
        .with_heartbeat_interval(Duration::from_millis(200))
        .with_leader_ttl(Duration::from_millis(300))
        .with_leader_heartbeat_interval(Duration::from_millis(80))
        .with_election_delay(Duration::from_millis(20))
        .build()
        .unwrap()
}

fn client(bus: &InMemoryMessageBus) -> AegisClient<InMemoryMessageBus> {
    AegisClient::new(bus.clone(), SerializationFormat::MessagePack)
}

#[tokio::test]
async fn rpc_round_trip() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("calc", "i-1"), bus.clone())
        .register_rpc(method("add"), |request: RpcRequest| async move {
            let a = request.params["a"].as_i64().unwrap_or(0);
            let b = request.params["b"].as_i64().unwrap_or(0);
            Ok(serde_json::json!({"sum": a + b}))
        })
        .start()
        .await
        .unwrap();

    let response = client(&bus)
        .call_rpc(
            &service("calc"),
            &method("add"),
            serde_json::json!({"a": 2, "b": 3}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.result.unwrap()["sum"], 5);
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn rpc_handler_error_is_structured() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("calc", "i-1"), bus.clone())
        .register_rpc(method("explode"), |_request: RpcRequest| async move {
            Err::<serde_json::Value, _>(AegisError::Handler {
                name: "explode".to_string(),
                message: "division by zero".to_string(),
            })
        })
        .start()
        .await
        .unwrap();

    let response = client(&bus)
        .call_rpc(
            &service("calc"),
            &method("explode"),
            serde_json::Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("HANDLER_ERROR"));
    assert!(response.message.unwrap().contains("division by zero"));
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn rpc_unknown_method_is_rejected() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("calc", "i-1"), bus.clone())
        .register_rpc(method("known"), |_request: RpcRequest| async move {
            Ok(serde_json::Value::Null)
        })
        .start()
        .await
        .unwrap();

    let response = client(&bus)
        .call_rpc(
            &service("calc"),
            &method("unknown"),
            serde_json::Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("UNKNOWN_METHOD"));
    runtime.stop().await.unwrap();
}

/// S3: an exclusive RPC routed to a STANDBY instance is rejected with
/// NOT_ACTIVE and the user handler never runs.
#[tokio::test]
async fn exclusive_rpc_on_standby_is_rejected() {
    let bus = InMemoryMessageBus::new();
    let invocations = Arc::new(AtomicU32::new(0));

    // i-1 wins the group; it registers no RPC handlers, so requests land
    // on the standby.
    let leader = ServiceRuntimeBuilder::new(config("svc", "instance-1"), bus.handle())
        .single_active("g")
        .start()
        .await
        .unwrap();
    assert!(leader.is_active());

    let counter = Arc::clone(&invocations);
    let standby = ServiceRuntimeBuilder::new(config("svc", "instance-2"), bus.handle())
        .register_exclusive_rpc(method("do_work"), move |_request: RpcRequest| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        })
        .single_active("g")
        .start()
        .await
        .unwrap();
    assert!(!standby.is_active());

    let response = client(&bus)
        .call_rpc(
            &service("svc"),
            &method("do_work"),
            serde_json::Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("NOT_ACTIVE"));
    assert_eq!(
        response.message.as_deref(),
        Some("instance-2 is in STANDBY mode")
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    standby.stop().await.unwrap();
    leader.stop().await.unwrap();
}

#[tokio::test]
async fn exclusive_rpc_on_active_is_served() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("svc", "i-1"), bus.clone())
        .register_exclusive_rpc(method("do_work"), |_request: RpcRequest| async move {
            Ok(serde_json::json!({"done": true}))
        })
        .single_active("g")
        .start()
        .await
        .unwrap();
    assert!(runtime.is_active());

    let response = client(&bus)
        .call_rpc(
            &service("svc"),
            &method("do_work"),
            serde_json::Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(response.success);
    runtime.stop().await.unwrap();
}

/// S6: a subscriber on `events.order.*` sees order events but not trade
/// events.
#[tokio::test]
async fn event_wildcard_subscription() {
    let bus = InMemoryMessageBus::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let runtime = ServiceRuntimeBuilder::new(config("auditor", "i-1"), bus.clone())
        .register_event("order.*", move |event: Event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event.event_type.as_str().to_string());
                Ok(())
            }
        })
        .start()
        .await
        .unwrap();

    let publisher = client(&bus);
    publisher
        .publish_event(EventType::new("order.created").unwrap(), serde_json::json!({"id": 1}))
        .await
        .unwrap();
    publisher
        .publish_event(
            EventType::new("trade.executed").unwrap(),
            serde_json::json!({"id": 2}),
        )
        .await
        .unwrap();
    publisher
        .publish_event(
            EventType::new("order.cancelled").unwrap(),
            serde_json::json!({"id": 3}),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let observed = seen.lock().clone();
    assert_eq!(observed, vec!["order.created", "order.cancelled"]);
    runtime.stop().await.unwrap();
}

/// S4: a command handler reports progress 0..100; the dispatcher's ack
/// handle observes monotonic progress and a completed result.
#[tokio::test]
async fn command_with_progress() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("batch", "i-1"), bus.clone())
        .register_command(
            method("process_batch"),
            |command: Command, progress: ProgressReporter| async move {
                let size = command.payload["size"].as_u64().unwrap_or(0);
                for step in [0.0, 25.0, 50.0, 75.0] {
                    progress.report(step, format!("processed {}%", step)).await?;
                }
                progress.report(100.0, "batch processing complete").await?;
                Ok(serde_json::json!({"processed": size}))
            },
        )
        .start()
        .await
        .unwrap();

    let command = Command::new(
        service("batch"),
        method("process_batch"),
        serde_json::json!({"size": 1000}),
    )
    .with_timeout_ms(5_000);

    let mut ack = client(&bus).send_command(command).await.unwrap();

    let mut reports = Vec::new();
    while let Some(progress) =
        tokio::time::timeout(Duration::from_secs(2), ack.next_progress())
            .await
            .ok()
            .flatten()
    {
        let done = progress.percent >= 100.0;
        reports.push(progress.percent);
        if done {
            break;
        }
    }
    assert!(reports.len() >= 5, "expected >= 5 reports, got {reports:?}");
    assert!(reports.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*reports.last().unwrap(), 100.0);

    let result = ack.result(Duration::from_secs(2)).await.unwrap();
    assert_eq!(
        result.status,
        aegis_core::message::CommandStatus::Completed
    );
    assert_eq!(result.result.unwrap()["processed"], 1000);
    runtime.stop().await.unwrap();
}

/// Property 7: a failing handler sees the same message redelivered (same
/// message_id); once the retry budget is spent the command is
/// dead-lettered with a failed result.
#[tokio::test]
async fn command_redelivery_then_dead_letter() {
    let bus = InMemoryMessageBus::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let observed_ids: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));

    let counter = Arc::clone(&attempts);
    let ids = Arc::clone(&observed_ids);
    let runtime = ServiceRuntimeBuilder::new(config("retrysvc", "i-1"), bus.clone())
        .register_command(
            method("flaky"),
            move |command: Command, _progress: ProgressReporter| {
                let counter = Arc::clone(&counter);
                let ids = Arc::clone(&ids);
                async move {
                    ids.lock().push(command.message_id);
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<serde_json::Value, _>(AegisError::Handler {
                        name: "flaky".to_string(),
                        message: "still broken".to_string(),
                    })
                }
            },
        )
        .start()
        .await
        .unwrap();

    let command = Command::new(
        service("retrysvc"),
        method("flaky"),
        serde_json::Value::Null,
    )
    .with_max_retries(2);
    let expected_id = command.message_id;

    let ack = client(&bus).send_command(command).await.unwrap();
    let result = ack.result(Duration::from_secs(5)).await.unwrap();

    assert_eq!(result.status, aegis_core::message::CommandStatus::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let ids = observed_ids.lock().clone();
    assert!(ids.iter().all(|id| *id == expected_id));
    assert_eq!(runtime.metrics().counter("commands_dead_lettered"), 1);
    runtime.stop().await.unwrap();
}

/// Priority is envelope metadata only: a critical command enqueued after a
/// low one is still delivered second (FIFO).
#[tokio::test]
async fn priority_is_metadata_only() {
    let bus = InMemoryMessageBus::new();
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&order);
    let runtime = ServiceRuntimeBuilder::new(config("queue", "i-1"), bus.clone())
        .register_command(
            method("step"),
            move |command: Command, _progress: ProgressReporter| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock()
                        .push(command.payload["tag"].as_str().unwrap_or("?").to_string());
                    Ok(serde_json::Value::Null)
                }
            },
        )
        .start()
        .await
        .unwrap();

    let dispatcher = client(&bus);
    let low = Command::new(
        service("queue"),
        method("step"),
        serde_json::json!({"tag": "low"}),
    )
    .with_priority(Priority::Low);
    let critical = Command::new(
        service("queue"),
        method("step"),
        serde_json::json!({"tag": "critical"}),
    )
    .with_priority(Priority::Critical);

    let low_ack = dispatcher.send_command(low).await.unwrap();
    let critical_ack = dispatcher.send_command(critical).await.unwrap();
    low_ack.result(Duration::from_secs(2)).await.unwrap();
    critical_ack.result(Duration::from_secs(2)).await.unwrap();

    assert_eq!(*order.lock(), vec!["low", "critical"]);
    runtime.stop().await.unwrap();
}

/// Property 8: every subject published during RPC/event/command flows
/// matches the canonical grammar.
#[tokio::test]
async fn published_subjects_conform_to_grammar() {
    let bus = InMemoryMessageBus::new();
    let runtime = ServiceRuntimeBuilder::new(config("grammar", "i-1"), bus.clone())
        .register_rpc(method("ping"), |_request: RpcRequest| async move {
            Ok(serde_json::Value::Null)
        })
        .register_command(
            method("run"),
            |_command: Command, progress: ProgressReporter| async move {
                progress.report(100.0, "done").await?;
                Ok(serde_json::Value::Null)
            },
        )
        .start()
        .await
        .unwrap();

    let caller = client(&bus);
    caller
        .call_rpc(
            &service("grammar"),
            &method("ping"),
            serde_json::Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    caller
        .publish_event(EventType::new("order.created").unwrap(), serde_json::Value::Null)
        .await
        .unwrap();
    let ack = caller
        .send_command(Command::new(
            service("grammar"),
            method("run"),
            serde_json::Value::Null,
        ))
        .await
        .unwrap();
    ack.result(Duration::from_secs(2)).await.unwrap();
    runtime.stop().await.unwrap();

    let subjects = bus.published_subjects();
    assert!(!subjects.is_empty());
    for subject in subjects {
        assert!(
            conforms_to_grammar(&subject),
            "non-canonical subject published: {subject}"
        );
    }
}
