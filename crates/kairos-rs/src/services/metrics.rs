//! Per-backend, per-pool and per-service counters (§4.H).
//!
//! Kept deliberately separate from the path-router's `metrics_store`
//! time-series machinery: that module answers "what happened over the
//! last N hours" for a dashboard; this one answers "what is the
//! current rate" for the admin snapshot and steering decisions, and is
//! cheap enough to update on every request without a retention policy.

use std::collections::{HashMap, HashSet};

use ahash::AHashMap;
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Counter {
    pub requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_response_ms: f64,
}

impl Counter {
    pub fn record(&mut self, success: bool, response_ms: f64) {
        self.requests += 1;
        if success {
            self.successful += 1;
            self.total_response_ms += response_ms;
        } else {
            self.failed += 1;
        }
    }

    /// `totalResponseMs / successful`, per §3 — failed attempts
    /// contribute to `requests` and `failed` but not to this average.
    pub fn avg_response_ms(&self) -> f64 {
        if self.successful == 0 {
            0.0
        } else {
            self.total_response_ms / self.successful as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SteeringDecisionCounts {
    pub traffic_steering: HashMap<String, u64>,
    pub endpoint_steering: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMetrics {
    pub overall: Counter,
    pub per_pool: HashMap<String, Counter>,
    pub per_backend: HashMap<String, Counter>,
    pub affinity_hits: u64,
    pub affinity_misses: u64,
    pub dns_failover_count: u64,
    pub dns_recovery_count: u64,
    pub steering_decisions: SteeringDecisionCounts,
}

impl ServiceMetrics {
    pub fn record_attempt(&mut self, pool_id: &str, backend_id: &str, success: bool, response_ms: f64) {
        self.overall.record(success, response_ms);
        self.per_pool.entry(pool_id.to_string()).or_default().record(success, response_ms);
        self.per_backend.entry(backend_id.to_string()).or_default().record(success, response_ms);
    }

    pub fn record_traffic_decision(&mut self, policy: &str) {
        *self.steering_decisions.traffic_steering.entry(policy.to_string()).or_insert(0) += 1;
    }

    pub fn record_endpoint_decision(&mut self, policy: &str) {
        *self.steering_decisions.endpoint_steering.entry(policy.to_string()).or_insert(0) += 1;
    }

    pub fn record_affinity(&mut self, hit: bool) {
        if hit {
            self.affinity_hits += 1;
        } else {
            self.affinity_misses += 1;
        }
    }

    pub fn record_dns_failover(&mut self) {
        self.dns_failover_count += 1;
    }

    pub fn record_dns_recovery(&mut self) {
        self.dns_recovery_count += 1;
    }

    /// Drops per-pool/per-backend counters for ids no longer present in
    /// the config, as required after an admin config patch removes a
    /// pool or backend (§4.I).
    pub fn retain_ids(&mut self, pool_ids: &HashSet<String>, backend_ids: &HashSet<String>) {
        self.per_pool.retain(|id, _| pool_ids.contains(id));
        self.per_backend.retain(|id, _| backend_ids.contains(id));
    }
}

/// Process-wide metrics registry keyed by service identity, behind one
/// lock since admin snapshot reads are infrequent relative to the
/// per-service locks guarding request-path mutation.
#[derive(Default)]
pub struct MetricsRegistry {
    services: RwLock<AHashMap<String, ServiceMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_attempt(
        &self,
        service: &str,
        pool_id: &str,
        backend_id: &str,
        success: bool,
        response_ms: f64,
    ) {
        let mut services = self.services.write().await;
        services
            .entry(service.to_string())
            .or_default()
            .record_attempt(pool_id, backend_id, success, response_ms);
    }

    pub async fn snapshot(&self, service: &str) -> Option<ServiceMetrics> {
        self.services.read().await.get(service).cloned()
    }

    pub async fn retain_ids(&self, service: &str, pool_ids: &HashSet<String>, backend_ids: &HashSet<String>) {
        let mut services = self.services.write().await;
        if let Some(metrics) = services.get_mut(service) {
            metrics.retain_ids(pool_ids, backend_ids);
        }
    }

    pub async fn snapshot_all(&self) -> HashMap<String, ServiceMetrics> {
        self.services
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tracks_averages() {
        let mut counter = Counter::default();
        counter.record(true, 100.0);
        counter.record(true, 300.0);
        counter.record(false, 9_999.0);
        assert_eq!(counter.requests, 3);
        assert_eq!(counter.successful, 2);
        assert_eq!(counter.failed, 1);
        assert_eq!(counter.avg_response_ms(), 200.0);
    }

    #[tokio::test]
    async fn registry_accumulates_per_backend_and_pool() {
        let registry = MetricsRegistry::new();
        registry.record_attempt("a.example.com", "p1", "b1", true, 50.0).await;
        registry.record_attempt("a.example.com", "p1", "b1", false, 150.0).await;
        let snapshot = registry.snapshot("a.example.com").await.unwrap();
        assert_eq!(snapshot.overall.requests, 2);
        assert_eq!(snapshot.per_backend.get("b1").unwrap().requests, 2);
    }
}
