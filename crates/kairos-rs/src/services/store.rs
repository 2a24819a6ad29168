//! Service State Store interface (§4.C): `get`/`put`/`getAlarm`/`setAlarm`
//! against two keys per service — `state` (the `ServiceConfig`) and
//! `metrics` (the `ServiceMetrics`) — plus the alarm primitive that
//! schedules the next active health-check cycle.
//!
//! The concrete durable backend (a hosting platform's KV/actor storage)
//! is an external collaborator (§1): this module specifies only the
//! interface the core requires of it, plus an in-memory implementation
//! used by tests and by deployments that don't need state to survive a
//! restart.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::models::backend::TimestampMs;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn put(&self, key: &str, value: Value);
    async fn get_alarm(&self) -> Option<TimestampMs>;
    async fn set_alarm(&self, at: TimestampMs);
}

#[derive(Default)]
pub struct InMemoryStateStore {
    values: RwLock<HashMap<String, Value>>,
    alarm: RwLock<Option<TimestampMs>>,
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, value: Value) {
        self.values.write().await.insert(key.to_string(), value);
    }

    async fn get_alarm(&self) -> Option<TimestampMs> {
        *self.alarm.read().await
    }

    async fn set_alarm(&self, at: TimestampMs) {
        *self.alarm.write().await = Some(at);
    }
}

/// Write coalescing counter (§4.C): config/metrics mutations are
/// buffered and flushed every `save_threshold` recorded metrics rather
/// than on every request; explicit admin config POSTs bypass this and
/// flush immediately.
pub struct WriteCoalescer {
    pub save_threshold: u64,
    pending: std::sync::atomic::AtomicU64,
}

impl WriteCoalescer {
    pub fn new(save_threshold: u64) -> Self {
        Self {
            save_threshold: save_threshold.max(1),
            pending: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Call once per recorded metric. Returns `true` when the pending
    /// count has reached `save_threshold` and a flush should happen now.
    pub fn record(&self) -> bool {
        use std::sync::atomic::Ordering;
        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        if previous + 1 >= self.save_threshold {
            self.pending.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips_a_value() {
        let store = InMemoryStateStore::default();
        store.put("state", serde_json::json!({"a": 1})).await;
        assert_eq!(store.get("state").await, Some(serde_json::json!({"a": 1})));
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn alarm_primitive_stores_the_scheduled_time() {
        let store = InMemoryStateStore::default();
        assert!(store.get_alarm().await.is_none());
        store.set_alarm(1_000).await;
        assert_eq!(store.get_alarm().await, Some(1_000));
    }

    #[test]
    fn coalescer_flushes_at_threshold() {
        let coalescer = WriteCoalescer::new(3);
        assert!(!coalescer.record());
        assert!(!coalescer.record());
        assert!(coalescer.record());
        assert!(!coalescer.record());
    }
}
