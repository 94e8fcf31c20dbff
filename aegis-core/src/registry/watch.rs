//! Discovery watch stream over registry changes.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use tokio::sync::mpsc;

// Layer 3: Internal module imports
use crate::domain::{InstanceId, ServiceInstance, ServiceName};

/// One observed registry change.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new instance appeared.
    Added(ServiceInstance),
    /// An existing instance changed (heartbeat, status, metadata).
    Updated(ServiceInstance),
    /// An instance deregistered or its TTL expired.
    Removed {
        /// Service the instance belonged to.
        service_name: ServiceName,
        /// The removed instance.
        instance_id: InstanceId,
    },
}

/// Pull-driven stream of [`RegistryEvent`]s.
pub struct RegistryWatch {
    rx: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl RegistryWatch {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<RegistryEvent>) -> Self {
        Self { rx }
    }

    /// Next change; `None` once the underlying watch closes.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        self.rx.recv().await
    }
}
