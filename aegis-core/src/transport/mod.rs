//! Message transport: one connection abstraction over the broker.
//!
//! The [`MessageBus`] port covers the four capabilities everything else is
//! built on: subject-addressed pub/sub with wildcards, request/reply with
//! inbox correlation, durable work queues with explicit acknowledgement,
//! and watchable KV buckets. The broker wire protocol is touched only by
//! the adapters in this module.

pub mod in_memory;
pub mod nats;
pub mod traits;

pub use in_memory::InMemoryMessageBus;
pub use nats::NatsMessageBus;
pub use traits::{
    Acknowledge, BusSubscription, InboundMessage, MessageBus, QueueMessage, QueueSubscription,
};
