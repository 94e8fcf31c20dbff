//! Per-runtime metrics sink.
//!
//! Lock-free counters and last-writer-wins gauges; eventually consistent by
//! design. Each `ServiceRuntime` owns its own sink — there is no global
//! state.

// Layer 1: Standard library imports
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

// Layer 3: Internal module imports
// (none)

/// Well-known counter names.
pub mod counters {
    /// RPCs dispatched to a handler.
    pub const RPC_SERVED: &str = "rpc_served";
    /// RPCs that returned a structured failure.
    pub const RPC_FAILED: &str = "rpc_failed";
    /// RPCs rejected because the instance was standby.
    pub const RPC_NOT_ACTIVE: &str = "rpc_not_active";
    /// Events published.
    pub const EVENTS_PUBLISHED: &str = "events_published";
    /// Events delivered to handlers.
    pub const EVENTS_RECEIVED: &str = "events_received";
    /// Commands completed successfully.
    pub const COMMANDS_COMPLETED: &str = "commands_completed";
    /// Command deliveries that were nak'd for retry.
    pub const COMMANDS_RETRIED: &str = "commands_retried";
    /// Commands that exhausted their retries.
    pub const COMMANDS_DEAD_LETTERED: &str = "commands_dead_lettered";
    /// Registry heartbeats written.
    pub const HEARTBEATS: &str = "heartbeats";
    /// Registry heartbeat failures.
    pub const HEARTBEAT_FAILURES: &str = "heartbeat_failures";
    /// Elections won.
    pub const ELECTIONS_WON: &str = "elections_won";
    /// Elections lost (someone else holds or won the key).
    pub const ELECTIONS_LOST: &str = "elections_lost";
    /// Leadership losses after having been elected.
    pub const LEADERSHIP_LOST: &str = "leadership_lost";
    /// Supervised background task restarts.
    pub const TASK_RESTARTS: &str = "task_restarts";
}

/// Lock-free metrics sink.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: DashMap<&'static str, AtomicU64>,
    gauges: DashMap<&'static str, AtomicI64>,
}

impl Metrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a monotonic counter by one.
    pub fn incr(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Increment a monotonic counter.
    pub fn add(&self, name: &'static str, delta: u64) {
        self.counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a last-writer-wins gauge.
    pub fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauges
            .entry(name)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Read one counter (0 if never touched).
    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read one gauge (0 if never set).
    pub fn gauge(&self, name: &'static str) -> i64 {
        self.gauges
            .get(name)
            .map(|gauge| gauge.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time view of every counter and gauge.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Queryable snapshot of a [`Metrics`] sink.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Counter values by name.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values by name.
    pub gauges: BTreeMap<String, i64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr(counters::RPC_SERVED);
        metrics.incr(counters::RPC_SERVED);
        metrics.add(counters::RPC_SERVED, 3);
        assert_eq!(metrics.counter(counters::RPC_SERVED), 5);
        assert_eq!(metrics.counter(counters::RPC_FAILED), 0);
    }

    #[test]
    fn gauges_are_last_writer_wins() {
        let metrics = Metrics::new();
        metrics.set_gauge("inflight", 4);
        metrics.set_gauge("inflight", 2);
        assert_eq!(metrics.gauge("inflight"), 2);
    }

    #[test]
    fn snapshot_collects_everything() {
        let metrics = Metrics::new();
        metrics.incr(counters::ELECTIONS_WON);
        metrics.set_gauge("inflight", 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.get(counters::ELECTIONS_WON), Some(&1));
        assert_eq!(snapshot.gauges.get("inflight"), Some(&1));
    }
}
