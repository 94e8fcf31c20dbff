//! Key-value bucket abstraction with optimistic concurrency.
//!
//! The [`KvStore`] port is the only shared authoritative state in the
//! system: registry entries and leader keys both live in a bucket. All
//! mutations go through CAS (`revision`) or create-only writes, so
//! concurrent writers can never lose updates silently.

pub mod memory;
pub mod nats;
pub mod traits;

pub use memory::MemoryKvStore;
pub use nats::NatsKvStore;
pub use traits::{
    KvBucketOptions, KvEntry, KvStatus, KvStore, KvStoreExt, KvWatch, KvWatchEvent,
    KvWatchEventKind, PutOptions,
};
