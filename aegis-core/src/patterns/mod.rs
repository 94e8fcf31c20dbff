//! Messaging patterns: RPC, events, and durable commands.
//!
//! Handlers are small capability interfaces registered on the runtime
//! builder before `start()`; the caller side lives in [`AegisClient`].

pub mod client;
pub mod handlers;

pub use client::{AegisClient, CommandAck, EventSubscription, COMMANDS_STREAM};
pub use handlers::{CommandHandler, EventHandler, ProgressReporter, RpcHandler};
