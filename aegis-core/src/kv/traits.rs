//! The typed KV bucket port.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

// Layer 3: Internal module imports
use crate::codec::{self, SerializationFormat};
use crate::error::Result;

/// One versioned entry in a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    /// Full key.
    pub key: String,
    /// Raw value bytes.
    pub value: Bytes,
    /// Monotonic revision assigned by the store.
    pub revision: u64,
    /// When the key was first created.
    pub created_at: DateTime<Utc>,
    /// When this revision was written.
    pub updated_at: DateTime<Utc>,
    /// Remaining TTL configured at write time, if any.
    pub ttl: Option<Duration>,
}

/// Options for a single put.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Fail with `AlreadyExists` if the key is present.
    pub create_only: bool,
    /// CAS: fail with `RevisionMismatch` unless the current revision
    /// matches.
    pub revision: Option<u64>,
    /// Expire the entry after this duration without refresh.
    pub ttl: Option<Duration>,
}

impl PutOptions {
    /// Create-only write (election / registration).
    pub fn create_only() -> Self {
        Self {
            create_only: true,
            ..Self::default()
        }
    }

    /// CAS write against a known revision.
    pub fn with_revision(revision: u64) -> Self {
        Self {
            revision: Some(revision),
            ..Self::default()
        }
    }

    /// Builder method: attach a TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options used when opening a bucket.
#[derive(Debug, Clone, Copy)]
pub struct KvBucketOptions {
    /// Whether entries in this bucket may carry TTLs.
    pub enable_ttl: bool,
    /// Revisions of history retained per key.
    pub history: usize,
    /// Replication factor (broker-side).
    pub replicas: usize,
    /// Bucket-wide maximum entry age; the TTL granularity offered by
    /// brokers without per-key expiry.
    pub max_age: Option<Duration>,
}

impl Default for KvBucketOptions {
    fn default() -> Self {
        Self {
            enable_ttl: true,
            history: 8,
            replicas: 1,
            max_age: None,
        }
    }
}

/// Kind of change observed by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvWatchEventKind {
    /// A revision was written.
    Put,
    /// The key was deleted or purged.
    Delete,
    /// The key's TTL elapsed; emitted exactly once per expiry.
    Expired,
}

/// One change observed by a watch.
#[derive(Debug, Clone)]
pub struct KvWatchEvent {
    /// What happened.
    pub kind: KvWatchEventKind,
    /// The affected key.
    pub key: String,
    /// The written entry for `Put`; `None` for `Delete`/`Expired`.
    pub entry: Option<KvEntry>,
    /// Bucket revision at which the change happened; watches are
    /// restartable from this checkpoint.
    pub revision: u64,
}

/// A lazy, pull-driven stream of watch events.
pub struct KvWatch {
    rx: mpsc::UnboundedReceiver<KvWatchEvent>,
}

impl KvWatch {
    /// Build a watch from its feeding channel.
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<KvWatchEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` once the bucket (or connection) is gone.
    pub async fn next(&mut self) -> Option<KvWatchEvent> {
        self.rx.recv().await
    }
}

/// Point-in-time bucket health snapshot.
#[derive(Debug, Clone)]
pub struct KvStatus {
    /// Bucket name.
    pub bucket: String,
    /// Live entries (excluding expired).
    pub entries: usize,
    /// Whether the backing connection is up.
    pub connected: bool,
}

/// Bucket operations shared by all adapters.
///
/// Implementations are cheaply cloneable handles onto shared state; the
/// registry and the election coordinator each hold their own clone.
#[async_trait]
pub trait KvStore: Clone + Send + Sync + 'static {
    /// Read one entry. Missing or expired keys are `None`, not errors.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Write one entry, returning the new revision.
    async fn put(&self, key: &str, value: Bytes, options: PutOptions) -> Result<u64>;

    /// Delete a key, optionally CAS-guarded by revision.
    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<()>;

    /// List keys under a prefix (empty prefix lists the bucket).
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Most recent revisions of a key, oldest first, at most `limit`.
    async fn history(&self, key: &str, limit: usize) -> Result<Vec<KvEntry>>;

    /// Remove a key and its history.
    async fn purge(&self, key: &str) -> Result<()>;

    /// Delete every key under a prefix; returns how many were removed.
    async fn clear(&self, prefix: &str) -> Result<usize>;

    /// Watch a key or prefix; restartable from a revision checkpoint.
    async fn watch(&self, prefix: &str, from_revision: Option<u64>) -> Result<KvWatch>;

    /// Bucket health snapshot.
    async fn status(&self) -> Result<KvStatus>;

    /// Whether a live entry exists for the key.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Batch read; missing keys are simply absent from the result.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, KvEntry>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(key).await? {
                found.insert(key.clone(), entry);
            }
        }
        Ok(found)
    }

    /// Batch write; returns the new revisions in input order.
    async fn put_many(&self, entries: Vec<(String, Bytes, PutOptions)>) -> Result<Vec<u64>> {
        let mut revisions = Vec::with_capacity(entries.len());
        for (key, value, options) in entries {
            revisions.push(self.put(&key, value, options).await?);
        }
        Ok(revisions)
    }

    /// Batch delete; the map records which keys existed.
    async fn delete_many(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(keys.len());
        for key in keys {
            let existed = self.exists(key).await?;
            self.delete(key, None).await?;
            outcome.insert(key.clone(), existed);
        }
        Ok(outcome)
    }
}

/// Typed helpers layered over the raw byte operations.
#[async_trait]
pub trait KvStoreExt: KvStore {
    /// Read and decode an entry; returns the value and its revision.
    async fn get_typed<T>(&self, key: &str) -> Result<Option<(T, u64)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            None => Ok(None),
            Some(entry) => {
                let value = codec::decode(&entry.value)?;
                Ok(Some((value, entry.revision)))
            }
        }
    }

    /// Encode and write a value.
    async fn put_typed<T>(
        &self,
        key: &str,
        value: &T,
        format: SerializationFormat,
        options: PutOptions,
    ) -> Result<u64>
    where
        T: Serialize + Sync,
    {
        let bytes = codec::encode(value, format)?;
        self.put(key, bytes, options).await
    }
}

impl<K: KvStore> KvStoreExt for K {}
