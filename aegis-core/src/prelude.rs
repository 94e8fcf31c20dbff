//! Convenient single-import surface for services built on the runtime.

pub use crate::codec::SerializationFormat;
pub use crate::config::AegisConfig;
pub use crate::domain::{
    EventType, InstanceId, MethodName, Priority, ServiceInstance, ServiceName, ServiceStatus,
    StickyActiveStatus,
};
pub use crate::election::{
    ElectionCoordinator, ElectionPhase, ElectionState, FailoverMode, FailoverPolicy,
    LeadershipHooks, NoopHooks,
};
pub use crate::error::{AegisError, Result};
pub use crate::kv::{KvBucketOptions, KvEntry, KvStore, KvStoreExt, PutOptions};
pub use crate::message::{
    Command, CommandProgress, CommandResult, CommandStatus, Event, RpcRequest, RpcResponse,
    Subject, SubjectPattern,
};
pub use crate::metrics::{Metrics, MetricsSnapshot};
pub use crate::patterns::{
    AegisClient, CommandAck, CommandHandler, EventHandler, ProgressReporter, RpcHandler,
};
pub use crate::registry::{KvServiceRegistry, RegistryEvent, RegistryWatch};
pub use crate::runtime::{ServiceRuntime, ServiceRuntimeBuilder};
pub use crate::transport::{InMemoryMessageBus, MessageBus, NatsMessageBus};
