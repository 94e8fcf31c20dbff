//! Service runtime: composes transport, KV, registry, election, and the
//! messaging patterns into one supervised lifecycle.

pub mod service;
pub mod supervision;

pub use service::{ServiceRuntime, ServiceRuntimeBuilder};
pub use supervision::RestartBackoff;
