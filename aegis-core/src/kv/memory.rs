//! In-memory bucket with full revision, TTL, and watch semantics.
//!
//! This adapter backs the test suite and local development. It keeps the
//! same observable contract as the broker-backed bucket: strictly monotonic
//! revisions, create-only and CAS writes, and exactly-once `Expired` watch
//! events produced by a background sweeper.

// Layer 1: Standard library imports
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

// Layer 3: Internal module imports
use super::traits::{
    KvBucketOptions, KvEntry, KvStatus, KvStore, KvWatch, KvWatchEvent, KvWatchEventKind,
    PutOptions,
};
use crate::error::{AegisError, Result};

/// How often the sweeper scans for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(20);

/// Watch events retained for checkpoint replay.
const RETAINED_EVENTS: usize = 1024;

/// Cheaply cloneable handle onto one in-memory bucket.
#[derive(Clone)]
pub struct MemoryKvStore {
    inner: Arc<MemoryKvInner>,
}

struct MemoryKvInner {
    bucket: String,
    options: KvBucketOptions,
    revision: AtomicU64,
    state: Mutex<BucketState>,
}

#[derive(Default)]
struct BucketState {
    entries: HashMap<String, StoredEntry>,
    history: HashMap<String, VecDeque<KvEntry>>,
    log: VecDeque<KvWatchEvent>,
    watchers: Vec<Watcher>,
}

struct StoredEntry {
    entry: KvEntry,
    expires_at: Option<Instant>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<KvWatchEvent>,
}

impl MemoryKvStore {
    /// Create a bucket and start its TTL sweeper.
    pub fn new(bucket: impl Into<String>, options: KvBucketOptions) -> Self {
        let store = Self {
            inner: Arc::new(MemoryKvInner {
                bucket: bucket.into(),
                options,
                revision: AtomicU64::new(0),
                state: Mutex::new(BucketState::default()),
            }),
        };
        if options.enable_ttl {
            spawn_sweeper(Arc::downgrade(&store.inner));
        }
        store
    }

    fn next_revision(&self) -> u64 {
        self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Watch semantics: an exact key matches itself; a prefix ending in `.`
/// matches every key under it; the empty prefix matches the bucket.
fn watch_matches(prefix: &str, key: &str) -> bool {
    prefix.is_empty() || key == prefix || (prefix.ends_with('.') && key.starts_with(prefix))
}

fn spawn_sweeper(inner: Weak<MemoryKvInner>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(inner) = inner.upgrade() else {
                return; // bucket dropped
            };
            let now = Instant::now();
            let mut state = inner.state.lock();
            expire_due(&inner, &mut state, now);
        }
    });
}

/// Remove every entry whose deadline has passed and emit one `Expired`
/// event per key. Called under the bucket lock by the sweeper and by every
/// read/write path, so expiry is observed consistently regardless of sweep
/// timing.
fn expire_due(inner: &MemoryKvInner, state: &mut BucketState, now: Instant) {
    let expired: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, stored)| stored.expires_at.is_some_and(|deadline| deadline <= now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        state.entries.remove(&key);
        let revision = inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
        record_event(
            state,
            KvWatchEvent {
                kind: KvWatchEventKind::Expired,
                key,
                entry: None,
                revision,
            },
        );
    }
}

fn record_event(state: &mut BucketState, event: KvWatchEvent) {
    state
        .watchers
        .retain(|watcher| {
            if watch_matches(&watcher.prefix, &event.key) {
                watcher.tx.send(event.clone()).is_ok()
            } else {
                !watcher.tx.is_closed()
            }
        });
    state.log.push_back(event);
    while state.log.len() > RETAINED_EVENTS {
        state.log.pop_front();
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let mut state = self.inner.state.lock();
        expire_due(&self.inner, &mut state, Instant::now());
        Ok(state.entries.get(key).map(|stored| stored.entry.clone()))
    }

    async fn put(&self, key: &str, value: Bytes, options: PutOptions) -> Result<u64> {
        let mut state = self.inner.state.lock();
        expire_due(&self.inner, &mut state, Instant::now());

        let existing = state.entries.get(key);
        if options.create_only && existing.is_some() {
            return Err(AegisError::AlreadyExists {
                key: key.to_string(),
            });
        }
        if let Some(expected) = options.revision {
            match existing {
                Some(stored) if stored.entry.revision == expected => {}
                _ => {
                    return Err(AegisError::RevisionMismatch {
                        key: key.to_string(),
                        expected,
                    })
                }
            }
        }

        let now = Utc::now();
        let created_at = existing.map(|stored| stored.entry.created_at).unwrap_or(now);
        let revision = self.next_revision();
        let ttl = if self.inner.options.enable_ttl {
            options.ttl
        } else {
            None
        };
        let entry = KvEntry {
            key: key.to_string(),
            value,
            revision,
            created_at,
            updated_at: now,
            ttl,
        };

        let history = state.history.entry(key.to_string()).or_default();
        history.push_back(entry.clone());
        while history.len() > self.inner.options.history.max(1) {
            history.pop_front();
        }

        state.entries.insert(
            key.to_string(),
            StoredEntry {
                entry: entry.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        record_event(
            &mut state,
            KvWatchEvent {
                kind: KvWatchEventKind::Put,
                key: key.to_string(),
                entry: Some(entry),
                revision,
            },
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<()> {
        let mut state = self.inner.state.lock();
        expire_due(&self.inner, &mut state, Instant::now());

        if let Some(expected) = revision {
            match state.entries.get(key) {
                Some(stored) if stored.entry.revision == expected => {}
                _ => {
                    return Err(AegisError::RevisionMismatch {
                        key: key.to_string(),
                        expected,
                    })
                }
            }
        }
        if state.entries.remove(key).is_some() {
            let revision = self.next_revision();
            record_event(
                &mut state,
                KvWatchEvent {
                    kind: KvWatchEventKind::Delete,
                    key: key.to_string(),
                    entry: None,
                    revision,
                },
            );
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut state = self.inner.state.lock();
        expire_due(&self.inner, &mut state, Instant::now());
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn history(&self, key: &str, limit: usize) -> Result<Vec<KvEntry>> {
        let state = self.inner.state.lock();
        let Some(history) = state.history.get(key) else {
            return Ok(Vec::new());
        };
        let skip = history.len().saturating_sub(limit.max(1));
        Ok(history.iter().skip(skip).cloned().collect())
    }

    async fn purge(&self, key: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let existed = state.entries.remove(key).is_some();
        state.history.remove(key);
        if existed {
            let revision = self.next_revision();
            record_event(
                &mut state,
                KvWatchEvent {
                    kind: KvWatchEventKind::Delete,
                    key: key.to_string(),
                    entry: None,
                    revision,
                },
            );
        }
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        let mut state = self.inner.state.lock();
        expire_due(&self.inner, &mut state, Instant::now());
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.entries.remove(key);
            state.history.remove(key);
            let revision = self.next_revision();
            record_event(
                &mut state,
                KvWatchEvent {
                    kind: KvWatchEventKind::Delete,
                    key: key.clone(),
                    entry: None,
                    revision,
                },
            );
        }
        Ok(keys.len())
    }

    async fn watch(&self, prefix: &str, from_revision: Option<u64>) -> Result<KvWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        if let Some(checkpoint) = from_revision {
            for event in state
                .log
                .iter()
                .filter(|event| event.revision > checkpoint)
                .filter(|event| watch_matches(prefix, &event.key))
            {
                let _ = tx.send(event.clone());
            }
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(KvWatch::new(rx))
    }

    async fn status(&self) -> Result<KvStatus> {
        let mut state = self.inner.state.lock();
        expire_due(&self.inner, &mut state, Instant::now());
        Ok(KvStatus {
            bucket: self.inner.bucket.clone(),
            entries: state.entries.len(),
            connected: true,
        })
    }
}
