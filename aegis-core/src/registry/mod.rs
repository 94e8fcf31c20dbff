//! Service registry: the authoritative set of live instances.
//!
//! Entries live in the `service_registry` KV bucket under
//! `service-instances.<service>.<instance_id>`, carry the registry TTL, and
//! disappear when their owner stops heartbeating. All writes are create-only
//! or CAS; expected contention (`RevisionMismatch`) is retried a bounded
//! number of times.

pub mod store;
pub mod watch;

pub use store::{KvServiceRegistry, REGISTRY_BUCKET};
pub use watch::{RegistryEvent, RegistryWatch};
