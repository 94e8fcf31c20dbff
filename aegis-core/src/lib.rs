//! # aegis-core - Distributed Service Coordination Core
//!
//! Registry, sticky single-active leader election, and messaging patterns
//! for building coordinated network services over a NATS-style broker.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use aegis_core::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AegisConfig::from_env()?;
//!     let bus = NatsMessageBus::connect(&config.broker_url).await?;
//!
//!     let runtime = ServiceRuntimeBuilder::new(config, bus)
//!         .register_rpc(MethodName::new("get_quote")?, |request: RpcRequest| async move {
//!             Ok(serde_json::json!({"echo": request.params}))
//!         })
//!         .register_exclusive_rpc(MethodName::new("place_order")?, |request: RpcRequest| async move {
//!             // Served only by the ACTIVE instance of the group.
//!             Ok(serde_json::json!({"accepted": true}))
//!         })
//!         .single_active("default")
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! Six cooperating components, leaves first:
//!
//! - [`transport`] — one connection abstraction over the broker: pub/sub
//!   with wildcards, request/reply, durable work queues, KV buckets. An
//!   in-memory adapter carries the full semantics for tests; the NATS
//!   adapter is the production path.
//! - [`kv`] — typed bucket access with revisions (CAS), create-only
//!   writes, per-entry TTL, and restartable watches. The only shared
//!   authoritative state in the system.
//! - [`registry`] — TTL-expiring catalog of live instances keyed by
//!   `(service, instance)`.
//! - [`election`] — at-most-one-active leadership per `(service, group)`,
//!   sticky while the leader stays healthy, failing over within a bounded
//!   window when it dies.
//! - [`runtime`] — supervises registration, the consolidated heartbeat
//!   loop, election, and handler dispatch behind `start()`/`stop()`.
//! - [`patterns`] — request/response RPC, fire-and-forget events with
//!   wildcard subscriptions, and durable commands with progress reporting
//!   and bounded retries.
//!
//! # Coordination Guarantees
//!
//! - **At-most-one-active**: the leader key is written create-only and
//!   renewed by CAS, so two instances can never both hold it.
//! - **Sticky leadership**: a healthy leader renews indefinitely; failover
//!   happens only on death (TTL expiry) or voluntary release.
//! - **Bounded failover**: vacancy is noticed by watch, contended after a
//!   randomized delay, and decided by one create-only write.

pub mod codec;
pub mod config;
pub mod domain;
pub mod election;
pub mod error;
pub mod kv;
pub mod message;
pub mod metrics;
pub mod patterns;
pub mod prelude;
pub mod registry;
pub mod runtime;
pub mod transport;

pub use config::AegisConfig;
pub use error::{AegisError, Result};
