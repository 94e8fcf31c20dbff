//! JetStream KV bucket adapter.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_nats::jetstream;
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;

// Layer 3: Internal module imports
use super::traits::{
    KvBucketOptions, KvEntry, KvStatus, KvStore, KvWatch, KvWatchEvent, KvWatchEventKind,
    PutOptions,
};
use crate::error::{AegisError, Result};

/// KV bucket backed by a JetStream key-value store.
///
/// TTL granularity note: JetStream expires entries through the bucket-wide
/// `max_age`, so `PutOptions::ttl` selects expiry eligibility rather than a
/// per-key duration. Buckets holding TTL'd coordination keys (registry,
/// leader) are opened with `max_age` equal to that TTL.
#[derive(Clone)]
pub struct NatsKvStore {
    store: kv::Store,
    context: jetstream::Context,
    bucket: String,
}

impl NatsKvStore {
    /// Open the named bucket, creating it on first use.
    pub async fn open(
        context: &jetstream::Context,
        name: &str,
        options: KvBucketOptions,
    ) -> Result<Self> {
        let store = match context.get_key_value(name).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: name.to_string(),
                    history: options.history.max(1) as i64,
                    max_age: options.max_age.unwrap_or(Duration::ZERO),
                    num_replicas: options.replicas.max(1),
                    ..Default::default()
                })
                .await
                .map_err(|e| AegisError::transport(format!("create bucket {name}: {e}")))?,
        };
        Ok(Self {
            store,
            context: context.clone(),
            bucket: name.to_string(),
        })
    }

    fn to_entry(entry: kv::Entry) -> KvEntry {
        let created = DateTime::<Utc>::from_timestamp(
            entry.created.unix_timestamp(),
            entry.created.nanosecond(),
        )
        .unwrap_or_else(Utc::now);
        KvEntry {
            key: entry.key,
            value: entry.value,
            revision: entry.revision,
            created_at: created,
            updated_at: created,
            ttl: None,
        }
    }

    /// Sequence-guarded write to the bucket's stream: the publish carries
    /// `Nats-Expected-Last-Subject-Sequence`, so the server accepts it only
    /// while `expected` is still the key's latest revision. This is the
    /// mechanism `Store::update` uses for CAS puts; routing the tombstone
    /// (`KV-Operation: DEL`) through it as well gives deletes the same
    /// atomic guard.
    ///
    /// Only a rejected sequence guard maps to `RevisionMismatch`; every
    /// other failure keeps its transport cause.
    async fn publish_expecting(
        &self,
        key: &str,
        payload: Bytes,
        expected: u64,
        operation: Option<&'static str>,
    ) -> Result<u64> {
        let subject = format!("$KV.{}.{}", self.bucket, key);
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(
            "Nats-Expected-Last-Subject-Sequence",
            expected.to_string().as_str(),
        );
        if let Some(operation) = operation {
            headers.insert("KV-Operation", operation);
        }
        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .map_err(|e| AegisError::transport(format!("kv cas publish {key}: {e}")))?;
        match ack.await {
            Ok(ack) => Ok(ack.sequence),
            Err(err) if matches!(err.kind(), PublishErrorKind::WrongLastSequence) => {
                Err(AegisError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                })
            }
            Err(err) => Err(AegisError::transport(format!("kv cas ack {key}: {err}"))),
        }
    }
}

#[async_trait]
impl KvStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| AegisError::transport(format!("kv get {key}: {e}")))?;
        Ok(entry
            .filter(|entry| {
                !matches!(
                    entry.operation,
                    kv::Operation::Delete | kv::Operation::Purge
                )
            })
            .map(Self::to_entry))
    }

    async fn put(&self, key: &str, value: Bytes, options: PutOptions) -> Result<u64> {
        if options.create_only {
            // Only "key exists" is a lost race; anything else (connection
            // drop, server hiccup) keeps its transport cause so callers do
            // not mistake a broker failure for a registration conflict.
            return match self.store.create(key, value).await {
                Ok(revision) => Ok(revision),
                Err(err) if matches!(err.kind(), kv::CreateErrorKind::AlreadyExists) => {
                    Err(AegisError::AlreadyExists {
                        key: key.to_string(),
                    })
                }
                Err(err) => Err(AegisError::transport(format!("kv create {key}: {err}"))),
            };
        }
        if let Some(expected) = options.revision {
            // CAS update through the sequence-guarded publish; only a
            // rejected guard becomes RevisionMismatch. Leader renewal
            // depends on this distinction: transport blips are tolerated,
            // a lost CAS surrenders leadership.
            return self.publish_expecting(key, value, expected, None).await;
        }
        self.store
            .put(key, value)
            .await
            .map_err(|e| AegisError::transport(format!("kv put {key}: {e}")))
    }

    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<()> {
        match revision {
            // Atomic CAS delete: the tombstone publish is guarded by the
            // expected last sequence, so a stale caller can never remove an
            // entry written after its read.
            Some(expected) => self
                .publish_expecting(key, Bytes::new(), expected, Some("DEL"))
                .await
                .map(|_| ()),
            None => self
                .store
                .delete(key)
                .await
                .map_err(|e| AegisError::transport(format!("kv delete {key}: {e}"))),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stream = self
            .store
            .keys()
            .await
            .map_err(|e| AegisError::transport(format!("kv keys: {e}")))?;
        let mut keys = Vec::new();
        while let Some(item) = stream.next().await {
            if let Ok(key) = item {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn history(&self, key: &str, limit: usize) -> Result<Vec<KvEntry>> {
        let mut stream = self
            .store
            .history(key)
            .await
            .map_err(|e| AegisError::transport(format!("kv history {key}: {e}")))?;
        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            if let Ok(entry) = item {
                entries.push(Self::to_entry(entry));
            }
        }
        let skip = entries.len().saturating_sub(limit.max(1));
        Ok(entries.split_off(skip))
    }

    async fn purge(&self, key: &str) -> Result<()> {
        self.store
            .purge(key)
            .await
            .map_err(|e| AegisError::transport(format!("kv purge {key}: {e}")))
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        let keys = self.keys(prefix).await?;
        for key in &keys {
            self.purge(key).await?;
        }
        Ok(keys.len())
    }

    async fn watch(&self, prefix: &str, from_revision: Option<u64>) -> Result<KvWatch> {
        let target = if prefix.is_empty() {
            ">".to_string()
        } else if prefix.ends_with('.') {
            format!("{prefix}>")
        } else {
            prefix.to_string()
        };
        let mut watch = if from_revision.is_some() {
            self.store.watch_with_history(&target).await
        } else {
            self.store.watch(&target).await
        }
        .map_err(|e| AegisError::transport(format!("kv watch {target}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let checkpoint = from_revision.unwrap_or(0);
        tokio::spawn(async move {
            while let Some(item) = watch.next().await {
                let Ok(entry) = item else { continue };
                if entry.revision <= checkpoint {
                    continue;
                }
                let event = match entry.operation {
                    kv::Operation::Put => KvWatchEvent {
                        kind: KvWatchEventKind::Put,
                        key: entry.key.clone(),
                        revision: entry.revision,
                        entry: Some(Self::to_entry(entry)),
                    },
                    kv::Operation::Delete => KvWatchEvent {
                        kind: KvWatchEventKind::Delete,
                        key: entry.key,
                        entry: None,
                        revision: entry.revision,
                    },
                    // The server purges entries whose bucket max_age
                    // elapsed.
                    kv::Operation::Purge => KvWatchEvent {
                        kind: KvWatchEventKind::Expired,
                        key: entry.key,
                        entry: None,
                        revision: entry.revision,
                    },
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
        });
        Ok(KvWatch::new(rx))
    }

    async fn status(&self) -> Result<KvStatus> {
        let entries = self.keys("").await?.len();
        Ok(KvStatus {
            bucket: self.bucket.clone(),
            entries,
            connected: true,
        })
    }
}
