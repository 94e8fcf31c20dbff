//! Sticky single-active leader election.
//!
//! Within a `(service, group)` pair at most one instance is ACTIVE at any
//! time. Leadership is held through a TTL'd leader key in the KV store:
//! create-only writes decide races, CAS renewals keep a healthy leader in
//! place indefinitely, and TTL expiry plus a jittered watch-driven
//! re-election bound failover time when the leader dies.

pub mod coordinator;
pub mod hooks;
pub mod policy;
pub mod state;

pub use coordinator::{ElectionCoordinator, LeaderRecord};
pub use hooks::{LeadershipHooks, NoopHooks};
pub use policy::{FailoverMode, FailoverPolicy};
pub use state::{ElectionPhase, ElectionState};
