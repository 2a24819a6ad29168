//! Backend and pool data model.
//!
//! A [`Backend`] is a concrete upstream origin plus the dynamic health
//! state the selector and health manager mutate on every request and
//! probe. A [`Pool`] is an ordered bag of backends sharing one endpoint
//! steering policy and a minimum-healthy threshold.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the epoch. Stored instead of `SystemTime` so the
/// type round-trips through JSON without a serde adapter.
pub type TimestampMs = u64;

pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed
    }
}

/// Per-class error tallies used by the health manager and exposed in
/// the admin `/backends` snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub connection: u64,
    pub timeout: u64,
    pub http5xx: u64,
    pub http523: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    pub region: Option<String>,
}

/// An upstream origin: static identity/weight plus the dynamic health
/// and circuit-breaker state the request path mutates.
///
/// `healthy`, `consecutive_failures`, `circuit_state` and friends are
/// mutated only from within the owning [`crate::services::service_instance::ServiceInstance`]'s
/// serial execution — see the concurrency model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub geo: Option<GeoLocation>,

    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub last_failure_at: Option<TimestampMs>,
    #[serde(default)]
    pub last_success_at: Option<TimestampMs>,

    #[serde(default)]
    pub circuit_state: CircuitState,
    #[serde(default)]
    pub circuit_opened_at: Option<TimestampMs>,
    #[serde(default)]
    pub circuit_failure_count: u32,
    #[serde(default)]
    pub circuit_success_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<TimestampMs>,

    #[serde(default)]
    pub outstanding_requests: u32,
    #[serde(default)]
    pub connections_active: u32,

    #[serde(default)]
    pub error_counts: ErrorCounts,
    #[serde(default)]
    pub avg_response_ms: f64,

    /// Active-probe counters; independent of the passive counters above.
    #[serde(default)]
    pub consecutive_up: u32,
    #[serde(default)]
    pub consecutive_down: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Backend {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight: 1,
            priority: 0,
            enabled: true,
            geo: None,
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            circuit_state: CircuitState::Closed,
            circuit_opened_at: None,
            circuit_failure_count: 0,
            circuit_success_count: 0,
            next_retry_at: None,
            outstanding_requests: 0,
            connections_active: 0,
            error_counts: ErrorCounts::default(),
            avg_response_ms: 0.0,
            consecutive_up: 0,
            consecutive_down: 0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("backend id must not be empty".to_string());
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(format!(
                "backend {} url must start with http:// or https://: {}",
                self.id, self.url
            ));
        }
        if self.weight == 0 {
            return Err(format!("backend {} weight must be positive", self.id));
        }
        Ok(())
    }

    /// Derived health score in `[0, 100]`; informational only, never
    /// consulted to gate selection — `healthy` is the binary source of
    /// truth (see invariant in §3 of the data model).
    pub fn health_score(&self) -> u8 {
        if !self.healthy {
            return 0;
        }
        let total_errors = self.error_counts.connection
            + self.error_counts.timeout
            + self.error_counts.http5xx
            + self.error_counts.http523;
        let denom = (total_errors + self.consecutive_successes as u64 + 1) as f64;
        let error_rate = total_errors as f64 / denom;
        let latency_penalty = (self.avg_response_ms / 5000.0).min(1.0);
        let score = (1.0 - error_rate) * 0.6 + (1.0 - latency_penalty) * 0.4;
        (score.clamp(0.0, 1.0) * 100.0) as u8
    }

    /// Whether `circuitState = open` has passed its recovery timeout and
    /// should be attempted as half-open on the next selection.
    pub fn circuit_ready_for_half_open(&self, now: TimestampMs) -> bool {
        matches!(self.circuit_state, CircuitState::Open)
            && self.next_retry_at.map(|t| now >= t).unwrap_or(false)
    }

    /// Passive-revival eligibility: unhealthy but quarantine elapsed.
    pub fn passively_revivable(&self, now: TimestampMs, failure_timeout_ms: u64) -> bool {
        !self.healthy
            && self
                .last_failure_at
                .map(|t| now.saturating_sub(t) > failure_timeout_ms)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSteering {
    RoundRobin,
    Random,
    Hash,
    LeastOutstandingRequests,
    LeastConnections,
}

impl Default for EndpointSteering {
    fn default() -> Self {
        EndpointSteering::RoundRobin
    }
}

/// An ordered set of backends with a local endpoint steering policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    #[serde(default = "default_minimum_origins")]
    pub minimum_origins: u32,
    #[serde(default)]
    pub endpoint_steering: EndpointSteering,
    #[serde(default)]
    pub geo: Option<GeoLocation>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub backends: Vec<Backend>,

    /// Monotone counter mod pool size; reset to 0 whenever a backend's
    /// weight changes, so it never drifts against a since-changed
    /// weight distribution.
    #[serde(default)]
    pub current_round_robin_index: u64,
}

fn default_minimum_origins() -> u32 {
    1
}

impl Pool {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("pool id must not be empty".to_string());
        }
        if self.minimum_origins == 0 {
            return Err(format!("pool {} minimum_origins must be >= 1", self.id));
        }
        for backend in &self.backends {
            backend.validate()?;
        }
        Ok(())
    }

    /// A pool is healthy iff it has at least `minimum_origins` healthy,
    /// enabled backends.
    pub fn is_healthy(&self) -> bool {
        self.healthy_enabled_count() >= self.minimum_origins as usize
    }

    pub fn healthy_enabled_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.enabled && b.healthy)
            .count()
    }

    pub fn total_weight(&self) -> u32 {
        self.backends
            .iter()
            .filter(|b| b.enabled && b.healthy)
            .map(|b| b.weight)
            .sum()
    }
}
