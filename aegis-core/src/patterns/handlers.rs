//! Handler capability traits.
//!
//! Each messaging pattern has one small interface. Plain async closures
//! implement them through blanket impls, so tests and simple services can
//! register `|request| async move { ... }` directly.

// Layer 1: Standard library imports
use std::future::Future;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::error::Result;
use crate::message::{Command, Event, RpcRequest};

/// Handles one RPC method.
///
/// Returned errors are wrapped into a structured
/// `{success: false, error, message}` response by the runtime; they never
/// tear down the connection.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Process a request and produce the `result` payload.
    async fn handle(&self, request: RpcRequest) -> Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    async fn handle(&self, request: RpcRequest) -> Result<serde_json::Value> {
        self(request).await
    }
}

/// Handles events matching one subscription pattern.
///
/// Delivery is best-effort fan-out; implementations must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event.
    async fn handle(&self, event: Event) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Event) -> Result<()> {
        self(event).await
    }
}

/// Handles one work-queue command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process a command, reporting progress through `progress`, and
    /// produce the result payload.
    async fn handle(&self, command: Command, progress: ProgressReporter)
        -> Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Command, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    async fn handle(
        &self,
        command: Command,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value> {
        self(command, progress).await
    }
}

/// Bound progress callback handed to command handlers.
///
/// Reports are forwarded to `commands.progress.<message_id>` by the
/// runtime; the reporter itself never blocks on the broker.
#[derive(Clone)]
pub struct ProgressReporter {
    message_id: Uuid,
    tx: mpsc::UnboundedSender<(f64, String)>,
}

impl ProgressReporter {
    pub(crate) fn new(message_id: Uuid, tx: mpsc::UnboundedSender<(f64, String)>) -> Self {
        Self { message_id, tx }
    }

    /// The command this reporter is bound to.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Report completion progress; `percent` is clamped to `[0, 100]`.
    pub async fn report(&self, percent: f64, status: impl Into<String>) -> Result<()> {
        // Dropped forwarder (runtime stopping) makes reports no-ops.
        let _ = self.tx.send((percent.clamp(0.0, 100.0), status.into()));
        Ok(())
    }
}
