//! Per-hostname service configuration: pools, traffic steering, retry
//! policy, host-header rewrite, SSL options and observability flags.
//!
//! One [`ServiceConfig`] is owned by exactly one service identity (a
//! hostname pattern, see [`crate::services::hostname_resolver`]) and
//! mutated only under that service's serial execution guarantee.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::backend::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficSteering {
    Off,
    Random,
    Geo,
    Dynamic,
    Proximity,
    LeastOutstandingRequests,
    DnsFailover,
}

impl Default for TrafficSteering {
    fn default() -> Self {
        TrafficSteering::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityType {
    Cookie,
    IpCookie,
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAffinity {
    pub affinity_type: AffinityType,
    /// Cookie or header name carrying the session key, when applicable.
    pub name: String,
    #[serde(default = "default_affinity_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default)]
    pub update_on_revival: bool,
}

fn default_affinity_ttl_ms() -> u64 {
    23 * 60 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroDowntimeFailover {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trigger_codes")]
    pub trigger_codes: Vec<u16>,
}

fn default_trigger_codes() -> Vec<u16> {
    vec![521, 522, 523, 525, 526]
}

impl Default for ZeroDowntimeFailover {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_codes: default_trigger_codes(),
        }
    }
}

/// The per-hostname logical front-end: which pools exist, in what
/// priority, and how traffic is steered between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub hostname: String,
    pub default_pool_ids: Vec<String>,
    pub fallback_pool_id: Option<String>,
    #[serde(default)]
    pub traffic_steering: TrafficSteering,
    #[serde(default)]
    pub session_affinity: Option<SessionAffinity>,
    #[serde(default)]
    pub zero_downtime_failover: ZeroDowntimeFailover,
    #[serde(default)]
    pub region_pools: HashMap<String, String>,
    #[serde(default)]
    pub country_pools: HashMap<String, String>,

    /// `dns_failover` steering state: `primary` or `failover`.
    #[serde(default)]
    pub dns_failover_state: DnsFailoverState,
    #[serde(default)]
    pub failover_pool_ids: Vec<String>,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default)]
    pub consecutive_healthy_probes: u32,
}

fn default_recovery_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsFailoverState {
    Primary,
    Failover,
}

impl Default for DnsFailoverState {
    fn default() -> Self {
        DnsFailoverState::Primary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub retry_non_idempotent_on_timeout: bool,
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_retry_timeout_ms() -> u64 {
    10_000
}
fn default_retryable_status_codes() -> Vec<u16> {
    vec![500, 502, 503, 504, 521, 522, 523, 525, 526]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            retry_timeout_ms: default_retry_timeout_ms(),
            retry_non_idempotent_on_timeout: true,
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveHealthChecks {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_failure_timeout_ms")]
    pub failure_timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_failures() -> u32 {
    3
}
fn default_failure_timeout_ms() -> u64 {
    30_000
}

impl Default for PassiveHealthChecks {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: default_max_failures(),
            failure_timeout_ms: default_failure_timeout_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_min_requests() -> u32 {
    10
}
fn default_error_rate_threshold() -> f64 {
    50.0
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            min_requests: default_min_requests(),
            error_rate_threshold: default_error_rate_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthChecks {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_method")]
    pub method: String,
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_expected_codes")]
    pub expected_codes: Vec<u16>,
    #[serde(default)]
    pub body_contains: Option<String>,
    #[serde(default = "default_consecutive_up")]
    pub consecutive_up: u32,
    #[serde(default = "default_consecutive_down")]
    pub consecutive_down: u32,
}

fn default_interval_ms() -> u64 {
    60_000
}
fn default_probe_method() -> String {
    "GET".to_string()
}
fn default_probe_path() -> String {
    "/".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_expected_codes() -> Vec<u16> {
    vec![200]
}
fn default_consecutive_up() -> u32 {
    1
}
fn default_consecutive_down() -> u32 {
    1
}

impl Default for ActiveHealthChecks {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
            method: default_probe_method(),
            path: default_probe_path(),
            timeout_ms: default_probe_timeout_ms(),
            expected_codes: default_expected_codes(),
            body_contains: None,
            consecutive_up: default_consecutive_up(),
            consecutive_down: default_consecutive_down(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostHeaderRewrite {
    Preserve,
    BackendHostname,
    Literal { value: String },
}

impl Default for HostHeaderRewrite {
    fn default() -> Self {
        HostHeaderRewrite::Preserve
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observability {
    #[serde(default = "default_response_header_name")]
    pub response_header_name: String,
    #[serde(default = "default_true")]
    pub emit_backend_used: bool,
    #[serde(default)]
    pub emit_pool_header: bool,
    #[serde(default)]
    pub emit_region_header: bool,
}

fn default_response_header_name() -> String {
    "X-Backend-Used".to_string()
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            response_header_name: default_response_header_name(),
            emit_backend_used: true,
            emit_pool_header: false,
            emit_region_header: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslOptions {
    #[serde(default)]
    pub skip_certificate_verification: bool,
    #[serde(default)]
    pub allow_self_signed_certificates: bool,
    #[serde(default)]
    pub skip_hostname_verification: bool,
}

fn default_true() -> bool {
    true
}

/// The unit of ownership for one service identity: everything needed
/// to route, steer, retry and report for one hostname pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub pools: Vec<Pool>,
    pub load_balancer: LoadBalancer,
    #[serde(default)]
    pub passive_health_checks: PassiveHealthChecks,
    #[serde(default)]
    pub active_health_checks: ActiveHealthChecks,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub host_header_rewrite: HostHeaderRewrite,
    #[serde(default)]
    pub observability: Observability,
    #[serde(default)]
    pub ssl: SslOptions,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err(format!(
                "service {} has no pools configured",
                self.load_balancer.hostname
            ));
        }
        for pool in &self.pools {
            pool.validate()?;
        }
        let pool_ids: std::collections::HashSet<&str> =
            self.pools.iter().map(|p| p.id.as_str()).collect();
        for id in &self.load_balancer.default_pool_ids {
            if !pool_ids.contains(id.as_str()) {
                return Err(format!("default_pool_ids references unknown pool {}", id));
            }
        }
        if let Some(fallback) = &self.load_balancer.fallback_pool_id {
            if !pool_ids.contains(fallback.as_str()) {
                return Err(format!(
                    "fallback_pool_id references unknown pool {}",
                    fallback
                ));
            }
        }
        Ok(())
    }

    pub fn pool(&self, id: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.id == id)
    }

    pub fn pool_mut(&mut self, id: &str) -> Option<&mut crate::models::backend::Pool> {
        self.pools.iter_mut().find(|p| p.id == id)
    }

    /// Deep-merges an admin config patch onto this config (§4.I).
    /// Object fields the patch omits keep their current value; `pools`
    /// and each pool's `backends` are merged by `id` rather than
    /// replaced wholesale — a patch array's id set becomes the new
    /// member set for that list, with matching ids merged onto their
    /// existing entry and non-matching ids added fresh.
    pub fn merge_patch(&self, patch: serde_json::Value) -> Result<ServiceConfig, String> {
        let current = serde_json::to_value(self).map_err(|e| e.to_string())?;
        let merged = merge_json(current, patch);
        serde_json::from_value(merged).map_err(|e| e.to_string())
    }
}

fn merge_json(base: serde_json::Value, patch: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                if key == "pools" || key == "backends" {
                    let existing = base_map.remove(&key).unwrap_or(Value::Array(Vec::new()));
                    base_map.insert(key, merge_by_id(existing, patch_val));
                } else {
                    let merged = match base_map.remove(&key) {
                        Some(existing_val) => merge_json(existing_val, patch_val),
                        None => patch_val,
                    };
                    base_map.insert(key, merged);
                }
            }
            Value::Object(base_map)
        }
        (_, patch) => patch,
    }
}

/// Merges a `pools`- or `backends`-shaped array by its `id` field: the
/// patch's id set becomes the new member set, each id merged onto its
/// existing entry (if any) so omitted sub-fields keep their value.
fn merge_by_id(existing: serde_json::Value, patch: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    let existing_items = match existing {
        Value::Array(items) => items,
        _ => Vec::new(),
    };
    let patch_items = match patch {
        Value::Array(items) => items,
        other => return other,
    };
    let merged: Vec<Value> = patch_items
        .into_iter()
        .map(|patch_item| {
            let id = patch_item.get("id").and_then(|v| v.as_str()).map(str::to_string);
            match id {
                Some(id) => {
                    let existing_item = existing_items
                        .iter()
                        .find(|item| item.get("id").and_then(|v| v.as_str()) == Some(id.as_str()))
                        .cloned();
                    match existing_item {
                        Some(existing_item) => merge_json(existing_item, patch_item),
                        None => patch_item,
                    }
                }
                None => patch_item,
            }
        })
        .collect();
    Value::Array(merged)
}

#[cfg(test)]
mod merge_tests {
    use super::*;
    use crate::models::backend::{Backend, Pool};
    use serde_json::json;

    fn sample_config() -> ServiceConfig {
        ServiceConfig {
            pools: vec![Pool {
                id: "default".to_string(),
                minimum_origins: 1,
                endpoint_steering: Default::default(),
                geo: None,
                enabled: true,
                backends: vec![Backend::new("b1", "https://b1.example"), Backend::new("b2", "https://b2.example")],
                current_round_robin_index: 0,
            }],
            load_balancer: LoadBalancer {
                hostname: "a.example.com".to_string(),
                default_pool_ids: vec!["default".to_string()],
                fallback_pool_id: None,
                traffic_steering: TrafficSteering::Off,
                session_affinity: None,
                zero_downtime_failover: ZeroDowntimeFailover::default(),
                region_pools: HashMap::new(),
                country_pools: HashMap::new(),
                dns_failover_state: DnsFailoverState::Primary,
                failover_pool_ids: Vec::new(),
                recovery_threshold: 3,
                consecutive_healthy_probes: 0,
            },
            passive_health_checks: PassiveHealthChecks::default(),
            active_health_checks: ActiveHealthChecks::default(),
            retry_policy: RetryPolicy::default(),
            host_header_rewrite: HostHeaderRewrite::default(),
            observability: Observability::default(),
            ssl: SslOptions::default(),
        }
    }

    #[test]
    fn patch_updates_one_backend_weight_without_touching_the_other() {
        let config = sample_config();
        let patch = json!({
            "pools": [{
                "id": "default",
                "backends": [
                    {"id": "b1", "url": "https://b1.example", "weight": 5},
                    {"id": "b2", "url": "https://b2.example"}
                ]
            }]
        });
        let merged = config.merge_patch(patch).unwrap();
        let pool = merged.pool("default").unwrap();
        assert_eq!(pool.backends.iter().find(|b| b.id == "b1").unwrap().weight, 5);
        assert_eq!(pool.backends.iter().find(|b| b.id == "b2").unwrap().weight, 1);
    }

    #[test]
    fn patch_omitting_a_backend_drops_it() {
        let config = sample_config();
        let patch = json!({
            "pools": [{
                "id": "default",
                "backends": [{"id": "b1", "url": "https://b1.example"}]
            }]
        });
        let merged = config.merge_patch(patch).unwrap();
        let pool = merged.pool("default").unwrap();
        assert_eq!(pool.backends.len(), 1);
        assert_eq!(pool.backends[0].id, "b1");
    }

    #[test]
    fn patch_leaves_load_balancer_untouched_when_omitted() {
        let config = sample_config();
        let patch = json!({ "pools": [{"id": "default", "backends": []}] });
        let merged = config.merge_patch(patch).unwrap();
        assert_eq!(merged.load_balancer.hostname, "a.example.com");
    }
}
