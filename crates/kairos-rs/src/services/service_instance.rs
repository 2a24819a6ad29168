//! One service identity's mutable state and its serial execution lock.
//!
//! Every request (and every health transition) against a given
//! hostname pattern runs through this one `Mutex`, per the concurrency
//! model: a service's configuration, its affinity map and its backend
//! health are only ever touched from inside the critical section this
//! type guards, so the steering policies and health manager can stay
//! plain, synchronous, non-atomic code. The affinity map lives beside
//! `ServiceConfig` rather than inside it: it is purely in-memory and
//! rebuilt empty on cold start (§5), never persisted.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use crate::models::backend::now_ms;
use crate::models::service::ServiceConfig;
use crate::services::affinity::AffinityMap;
use crate::services::health_manager;
use crate::services::metrics::ServiceMetrics;
use crate::services::store::{StateStore, WriteCoalescer};

pub struct ServiceState {
    pub config: ServiceConfig,
    pub affinity: AffinityMap,
}

/// Owns one service's [`ServiceState`] behind a lock. `identity` is the
/// hostname pattern string returned by hostname resolution (shared by
/// every concrete hostname a wildcard/regex pattern matches).
pub struct ServiceInstance {
    pub identity: String,
    state: Mutex<ServiceState>,
    store: Arc<dyn StateStore>,
    coalescer: WriteCoalescer,
}

impl ServiceInstance {
    pub fn new(identity: impl Into<String>, config: ServiceConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            identity: identity.into(),
            state: Mutex::new(ServiceState {
                config,
                affinity: AffinityMap::default(),
            }),
            store,
            coalescer: WriteCoalescer::new(100),
        }
    }

    /// Acquires the serial-execution lock. Every caller — the proxy
    /// handler, the retry controller, the active-probe ticker, and the
    /// admin config-update handler — goes through this single entry
    /// point.
    pub async fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().await
    }

    /// Runs the circuit half-open tick and the passive revival sweep
    /// across every pool's backends. Called at the start of each
    /// request's backend selection, so quarantine/circuit transitions
    /// never depend on a separate background task for this service.
    pub async fn tick_health(&self) {
        let mut state = self.state.lock().await;
        let passive = state.config.passive_health_checks.clone();
        for pool in state.config.pools.iter_mut() {
            for backend in pool.backends.iter_mut() {
                health_manager::tick_circuit(backend);
            }
            health_manager::sweep_passive_revival(&mut pool.backends, &passive);
        }
    }

    /// Replaces this service's configuration wholesale — used by the
    /// admin config-update endpoint's deep-merge result — and persists
    /// it immediately, per §4.C ("Explicit configuration POSTs are
    /// persisted immediately").
    pub async fn replace_config(&self, new_config: ServiceConfig) {
        let mut state = self.state.lock().await;
        state.config = new_config;
        self.persist_config(&state.config).await;
    }

    /// Called after every recorded request metric. Flushes config and
    /// metrics to the store once `save_threshold` metrics have
    /// accumulated since the last flush (§4.C write coalescing).
    pub async fn maybe_flush(&self, metrics: &ServiceMetrics) {
        if self.coalescer.record() {
            let state = self.state.lock().await;
            self.persist_config(&state.config).await;
            self.persist_metrics(metrics).await;
        }
    }

    async fn persist_config(&self, config: &ServiceConfig) {
        if let Ok(value) = serde_json::to_value(json!({ "config": config })) {
            self.store.put("state", value).await;
        }
    }

    async fn persist_metrics(&self, metrics: &ServiceMetrics) {
        if let Ok(value) = serde_json::to_value(metrics) {
            self.store.put("metrics", value).await;
        }
    }

    /// Schedules this service's next active-probe cycle via the
    /// store's alarm primitive (§4.C), independent of the in-process
    /// ticker task, so a restart can recover the schedule from storage.
    pub async fn schedule_next_probe(&self, interval_ms: u64) {
        self.store.set_alarm(now_ms() + interval_ms).await;
    }

    pub fn now(&self) -> u64 {
        now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::{Backend, Pool};
    use crate::models::service::{LoadBalancer, ServiceConfig};
    use crate::services::store::InMemoryStateStore;

    fn sample_config() -> ServiceConfig {
        ServiceConfig {
            pools: vec![Pool {
                id: "p1".to_string(),
                minimum_origins: 1,
                endpoint_steering: Default::default(),
                geo: None,
                enabled: true,
                backends: vec![Backend::new("a", "https://a")],
                current_round_robin_index: 0,
            }],
            load_balancer: LoadBalancer {
                hostname: "a.example.com".to_string(),
                default_pool_ids: vec!["p1".to_string()],
                fallback_pool_id: None,
                traffic_steering: Default::default(),
                session_affinity: None,
                zero_downtime_failover: Default::default(),
                region_pools: Default::default(),
                country_pools: Default::default(),
                dns_failover_state: Default::default(),
                failover_pool_ids: vec![],
                recovery_threshold: 3,
                consecutive_healthy_probes: 0,
            },
            passive_health_checks: Default::default(),
            active_health_checks: Default::default(),
            retry_policy: Default::default(),
            host_header_rewrite: Default::default(),
            observability: Default::default(),
            ssl: Default::default(),
        }
    }

    #[tokio::test]
    async fn lock_serializes_access_to_config() {
        let instance = ServiceInstance::new(
            "a.example.com",
            sample_config(),
            Arc::new(InMemoryStateStore::default()),
        );
        {
            let guard = instance.lock().await;
            assert_eq!(guard.config.pools.len(), 1);
        }
        instance.replace_config(sample_config()).await;
        let guard = instance.lock().await;
        assert_eq!(guard.config.load_balancer.hostname, "a.example.com");
    }

    #[tokio::test]
    async fn replace_config_persists_immediately() {
        let store = Arc::new(InMemoryStateStore::default());
        let instance = ServiceInstance::new("a.example.com", sample_config(), store.clone());
        instance.replace_config(sample_config()).await;
        assert!(store.get("state").await.is_some());
    }
}
