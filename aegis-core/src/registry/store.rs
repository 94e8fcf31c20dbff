//! KV-backed registry implementation.

// Layer 1: Standard library imports
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::watch::{RegistryEvent, RegistryWatch};
use crate::codec::SerializationFormat;
use crate::domain::{InstanceId, ServiceInstance, ServiceName};
use crate::error::{AegisError, Result};
use crate::kv::{KvStore, KvStoreExt, KvWatchEventKind, PutOptions};
use crate::message::subject::{registry_key, registry_prefix, REGISTRY_PREFIX};

/// Name of the KV bucket holding registry entries (and, in the shared
/// layout, the leader keys).
pub const REGISTRY_BUCKET: &str = "service_registry";

/// CAS retries before a contention error surfaces.
const CAS_RETRIES: usize = 3;

/// Registry operations over a KV bucket.
///
/// Cheaply cloneable; the election coordinator and the runtime each hold a
/// clone. The registry caches the last revision it observed per key so CAS
/// updates normally skip a read.
#[derive(Clone)]
pub struct KvServiceRegistry<K: KvStore> {
    kv: K,
    format: SerializationFormat,
    ttl: Duration,
    revisions: Arc<DashMap<String, u64>>,
}

impl<K: KvStore> KvServiceRegistry<K> {
    /// Build a registry over an open bucket.
    pub fn new(kv: K, format: SerializationFormat, ttl: Duration) -> Self {
        Self {
            kv,
            format,
            ttl,
            revisions: Arc::new(DashMap::new()),
        }
    }

    /// The registry TTL (also the client-side freshness horizon).
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create the entry for a new instance.
    ///
    /// Fails with `AlreadyExists` when the `(service, instance)` pair is
    /// already registered.
    pub async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let key = registry_key(&instance.service_name, &instance.instance_id);
        let revision = self
            .kv
            .put_typed(
                &key,
                instance,
                self.format,
                PutOptions::create_only().with_ttl(self.ttl),
            )
            .await?;
        self.revisions.insert(key, revision);
        debug!(service = %instance.service_name, instance = %instance.instance_id, "registered");
        Ok(())
    }

    /// CAS-update an entry, refreshing its TTL.
    ///
    /// Retries a bounded number of times on `RevisionMismatch` before
    /// surfacing the error.
    pub async fn update_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let key = registry_key(&instance.service_name, &instance.instance_id);
        let mut revision = match self.revisions.get(&key) {
            Some(cached) => *cached,
            None => self.current_revision(&key).await?,
        };

        let mut attempt = 0;
        loop {
            let result = self
                .kv
                .put_typed(
                    &key,
                    instance,
                    self.format,
                    PutOptions::with_revision(revision).with_ttl(self.ttl),
                )
                .await;
            match result {
                Ok(new_revision) => {
                    self.revisions.insert(key, new_revision);
                    return Ok(());
                }
                Err(err @ AegisError::RevisionMismatch { .. }) => {
                    attempt += 1;
                    if attempt >= CAS_RETRIES {
                        return Err(err);
                    }
                    revision = self.current_revision(&key).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Refresh `last_heartbeat` and the TTL.
    ///
    /// Idempotent: concurrent heartbeats retry on `RevisionMismatch` and the
    /// later timestamp wins. Fails with `NotFound` once the entry has
    /// expired; the caller must re-register.
    ///
    /// Returns the updated record plus whether this heartbeat recovered the
    /// instance from `Unhealthy`.
    pub async fn heartbeat(
        &self,
        service_name: &ServiceName,
        instance_id: &InstanceId,
    ) -> Result<(ServiceInstance, bool)> {
        let key = registry_key(service_name, instance_id);
        let mut last_err = None;
        for _ in 0..CAS_RETRIES {
            let Some((mut instance, revision)) =
                self.kv.get_typed::<ServiceInstance>(&key).await?
            else {
                return Err(AegisError::NotFound { key });
            };
            let recovered = instance.heartbeat();
            match self
                .kv
                .put_typed(
                    &key,
                    &instance,
                    self.format,
                    PutOptions::with_revision(revision).with_ttl(self.ttl),
                )
                .await
            {
                Ok(new_revision) => {
                    self.revisions.insert(key.clone(), new_revision);
                    return Ok((instance, recovered));
                }
                Err(err @ AegisError::RevisionMismatch { .. }) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(AegisError::NotFound { key }))
    }

    /// Unconditionally remove an entry.
    pub async fn deregister(
        &self,
        service_name: &ServiceName,
        instance_id: &InstanceId,
    ) -> Result<()> {
        let key = registry_key(service_name, instance_id);
        self.kv.delete(&key, None).await?;
        self.revisions.remove(&key);
        debug!(service = %service_name, instance = %instance_id, "deregistered");
        Ok(())
    }

    /// Read one entry.
    pub async fn get_instance(
        &self,
        service_name: &ServiceName,
        instance_id: &InstanceId,
    ) -> Result<Option<ServiceInstance>> {
        let key = registry_key(service_name, instance_id);
        match self.kv.get_typed::<ServiceInstance>(&key).await? {
            None => Ok(None),
            Some((instance, revision)) => {
                self.revisions.insert(key, revision);
                Ok(Some(instance))
            }
        }
    }

    /// List instances, optionally filtered by service.
    ///
    /// Entries whose heartbeat is older than the registry TTL are filtered
    /// client-side even if the bucket has not expired them yet.
    pub async fn list_instances(
        &self,
        service_name: Option<&ServiceName>,
    ) -> Result<Vec<ServiceInstance>> {
        let prefix = match service_name {
            Some(service) => registry_prefix(service),
            None => REGISTRY_PREFIX.to_string(),
        };
        let keys = self.kv.keys(&prefix).await?;
        let entries = self.kv.get_many(&keys).await?;
        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries.into_values() {
            match crate::codec::decode::<ServiceInstance>(&entry.value) {
                Ok(instance) if self.is_fresh(&instance) => instances.push(instance),
                Ok(stale) => {
                    debug!(instance = %stale.instance_id, "filtered stale registry entry");
                }
                Err(err) => warn!(%err, key = %entry.key, "undecodable registry entry"),
            }
        }
        instances.sort_by(|a, b| {
            (a.service_name.as_str(), a.instance_id.as_str())
                .cmp(&(b.service_name.as_str(), b.instance_id.as_str()))
        });
        Ok(instances)
    }

    /// Watch registry changes, optionally scoped to one service.
    pub async fn watch(&self, service_name: Option<&ServiceName>) -> Result<RegistryWatch> {
        let prefix = match service_name {
            Some(service) => registry_prefix(service),
            None => REGISTRY_PREFIX.to_string(),
        };
        let mut kv_watch = self.kv.watch(&prefix, None).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            while let Some(event) = kv_watch.next().await {
                let mapped = match event.kind {
                    KvWatchEventKind::Put => {
                        let Some(entry) = event.entry else { continue };
                        match crate::codec::decode::<ServiceInstance>(&entry.value) {
                            Ok(instance) => {
                                if known.insert(event.key.clone()) {
                                    RegistryEvent::Added(instance)
                                } else {
                                    RegistryEvent::Updated(instance)
                                }
                            }
                            Err(err) => {
                                warn!(%err, key = %event.key, "undecodable registry entry");
                                continue;
                            }
                        }
                    }
                    KvWatchEventKind::Delete | KvWatchEventKind::Expired => {
                        known.remove(&event.key);
                        let Some((service, instance)) = parse_registry_key(&event.key) else {
                            continue;
                        };
                        RegistryEvent::Removed {
                            service_name: service,
                            instance_id: instance,
                        }
                    }
                };
                if tx.send(mapped).is_err() {
                    return;
                }
            }
        });
        Ok(RegistryWatch::new(rx))
    }

    fn is_fresh(&self, instance: &ServiceInstance) -> bool {
        Utc::now()
            .signed_duration_since(instance.last_heartbeat)
            .to_std()
            .map(|age| age < self.ttl)
            .unwrap_or(true)
    }

    async fn current_revision(&self, key: &str) -> Result<u64> {
        match self.kv.get(key).await? {
            Some(entry) => Ok(entry.revision),
            None => Err(AegisError::NotFound {
                key: key.to_string(),
            }),
        }
    }
}

fn parse_registry_key(key: &str) -> Option<(ServiceName, InstanceId)> {
    let rest = key.strip_prefix(REGISTRY_PREFIX)?;
    let (service, instance) = rest.split_once('.')?;
    Some((
        ServiceName::new(service).ok()?,
        InstanceId::new(instance).ok()?,
    ))
}
