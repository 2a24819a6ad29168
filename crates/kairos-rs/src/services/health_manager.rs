//! Passive health, circuit breaker transitions and active probes.
//!
//! All functions here take `&mut Backend`/`&mut Pool` directly rather
//! than wrapping an `Arc<CircuitBreaker>` behind atomics: every caller
//! already holds the owning service's serial-execution lock, so the
//! atomics the path-router's circuit breaker used for cross-task safety
//! are unnecessary weight.

use log::{debug, info, warn};

use crate::models::backend::{now_ms, Backend, CircuitState, TimestampMs};
use crate::models::service::{ActiveHealthChecks, CircuitBreakerConfig, PassiveHealthChecks};

/// Records a successful attempt against `backend`: resets the failure
/// streak, closes a half-open circuit after `success_threshold`
/// consecutive successes, and marks the backend healthy again if it
/// had been passively quarantined.
pub fn record_success(backend: &mut Backend, response_ms: f64, cfg: &PassiveHealthChecks) {
    backend.consecutive_failures = 0;
    backend.consecutive_successes = backend.consecutive_successes.saturating_add(1);
    backend.last_success_at = Some(now_ms());
    backend.avg_response_ms = ewma(backend.avg_response_ms, response_ms);

    if !backend.healthy {
        backend.healthy = true;
        info!("backend {} marked healthy after a successful attempt", backend.id);
    }

    if backend.circuit_state == CircuitState::HalfOpen {
        backend.circuit_success_count = backend.circuit_success_count.saturating_add(1);
        if backend.circuit_success_count >= cfg.circuit_breaker.success_threshold {
            close_circuit(backend);
        }
    }
}

/// Records a failed attempt against `backend`, classified by the
/// caller (forwarder/retry controller) before this is invoked. Applies
/// the `max_failures` passive threshold and, if the circuit breaker is
/// enabled, the failure-count/error-rate breaker thresholds.
pub fn record_failure(backend: &mut Backend, cfg: &PassiveHealthChecks) {
    let now = now_ms();
    backend.consecutive_successes = 0;
    backend.consecutive_failures = backend.consecutive_failures.saturating_add(1);
    backend.last_failure_at = Some(now);

    if cfg.enabled && backend.consecutive_failures >= cfg.max_failures && backend.healthy {
        backend.healthy = false;
        warn!(
            "backend {} marked unhealthy after {} consecutive failures",
            backend.id, backend.consecutive_failures
        );
    }

    if cfg.circuit_breaker.enabled {
        maybe_open_circuit(backend, &cfg.circuit_breaker, now);
    }
}

fn maybe_open_circuit(backend: &mut Backend, cfg: &CircuitBreakerConfig, now: TimestampMs) {
    if backend.circuit_state == CircuitState::Open {
        return;
    }
    backend.circuit_failure_count = backend.circuit_failure_count.saturating_add(1);

    let total_requests = backend.circuit_failure_count + backend.circuit_success_count;
    let error_rate = if total_requests > 0 {
        backend.circuit_failure_count as f64 / total_requests as f64 * 100.0
    } else {
        0.0
    };

    let threshold_tripped = backend.circuit_failure_count >= cfg.failure_threshold
        || (total_requests >= cfg.min_requests && error_rate >= cfg.error_rate_threshold);

    if threshold_tripped {
        backend.circuit_state = CircuitState::Open;
        backend.circuit_opened_at = Some(now);
        backend.next_retry_at = Some(now + cfg.recovery_timeout_ms);
        backend.circuit_success_count = 0;
        warn!("circuit opened for backend {}", backend.id);
    }
}

fn close_circuit(backend: &mut Backend) {
    backend.circuit_state = CircuitState::Closed;
    backend.circuit_opened_at = None;
    backend.next_retry_at = None;
    backend.circuit_failure_count = 0;
    backend.circuit_success_count = 0;
    info!("circuit closed for backend {}", backend.id);
}

/// Transitions an open circuit to half-open once its recovery timeout
/// has passed, allowing exactly the probing attempt through. Called
/// before selection considers a backend eligible.
pub fn tick_circuit(backend: &mut Backend) {
    let now = now_ms();
    if backend.circuit_ready_for_half_open(now) {
        backend.circuit_state = CircuitState::HalfOpen;
        backend.circuit_success_count = 0;
        debug!("circuit half-open for backend {}", backend.id);
    }
}

/// Whether a request may currently be routed to `backend` given its
/// circuit state: closed and half-open both admit traffic (half-open
/// admits the single probing attempt); open does not.
pub fn circuit_admits_traffic(backend: &Backend) -> bool {
    !matches!(backend.circuit_state, CircuitState::Open)
}

/// Passive revival sweep: backends quarantined longer than
/// `failure_timeout_ms` become eligible for selection again, where a
/// subsequent success/failure will confirm or re-quarantine them.
pub fn sweep_passive_revival(backends: &mut [Backend], cfg: &PassiveHealthChecks) {
    if !cfg.enabled {
        return;
    }
    let now = now_ms();
    for backend in backends {
        if backend.passively_revivable(now, cfg.failure_timeout_ms) {
            backend.healthy = true;
            backend.consecutive_failures = 0;
            debug!("backend {} passively revived after quarantine", backend.id);
        }
    }
}

fn ewma(previous: f64, sample: f64) -> f64 {
    if previous <= 0.0 {
        sample
    } else {
        previous * 0.8 + sample * 0.2
    }
}

/// Outcome of one active probe, classified by the caller after issuing
/// the HTTP request described by `active_probe_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Up,
    Down,
}

/// `(method, url, timeout_ms)` for the next active probe against
/// `backend`, per the service's [`ActiveHealthChecks`] configuration.
pub fn active_probe_request(backend: &Backend, cfg: &ActiveHealthChecks) -> (String, String, u64) {
    let url = format!("{}{}", backend.url.trim_end_matches('/'), cfg.path);
    (cfg.method.clone(), url, cfg.timeout_ms)
}

/// Applies one active-probe outcome, tracking the consecutive up/down
/// streaks independently of the passive failure counters and flipping
/// `healthy` once the configured streak length is reached.
pub fn record_active_probe(backend: &mut Backend, outcome: ProbeOutcome, cfg: &ActiveHealthChecks) {
    match outcome {
        ProbeOutcome::Up => {
            backend.consecutive_up = backend.consecutive_up.saturating_add(1);
            backend.consecutive_down = 0;
            if !backend.healthy && backend.consecutive_up >= cfg.consecutive_up {
                backend.healthy = true;
                info!("backend {} marked healthy by active probe", backend.id);
            }
        }
        ProbeOutcome::Down => {
            backend.consecutive_down = backend.consecutive_down.saturating_add(1);
            backend.consecutive_up = 0;
            if backend.healthy && backend.consecutive_down >= cfg.consecutive_down {
                backend.healthy = false;
                warn!("backend {} marked unhealthy by active probe", backend.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_failures_trip_unhealthy_at_threshold() {
        let mut backend = Backend::new("a", "https://a");
        let cfg = PassiveHealthChecks {
            enabled: true,
            max_failures: 3,
            failure_timeout_ms: 30_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        };
        record_failure(&mut backend, &cfg);
        record_failure(&mut backend, &cfg);
        assert!(backend.healthy);
        record_failure(&mut backend, &cfg);
        assert!(!backend.healthy);
    }

    #[test]
    fn success_resets_failure_streak_and_revives() {
        let mut backend = Backend::new("a", "https://a");
        backend.healthy = false;
        backend.consecutive_failures = 5;
        let cfg = PassiveHealthChecks::default();
        record_success(&mut backend, 50.0, &cfg);
        assert!(backend.healthy);
        assert_eq!(backend.consecutive_failures, 0);
    }

    #[test]
    fn circuit_opens_after_failure_threshold_then_half_opens_after_timeout() {
        let mut backend = Backend::new("a", "https://a");
        let mut cb = CircuitBreakerConfig::default();
        cb.enabled = true;
        cb.failure_threshold = 2;
        cb.recovery_timeout_ms = 0;
        let cfg = PassiveHealthChecks {
            enabled: true,
            max_failures: 100,
            failure_timeout_ms: 30_000,
            circuit_breaker: cb,
        };
        record_failure(&mut backend, &cfg);
        assert_eq!(backend.circuit_state, CircuitState::Closed);
        record_failure(&mut backend, &cfg);
        assert_eq!(backend.circuit_state, CircuitState::Open);

        tick_circuit(&mut backend);
        assert_eq!(backend.circuit_state, CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let mut backend = Backend::new("a", "https://a");
        backend.circuit_state = CircuitState::HalfOpen;
        let mut cb = CircuitBreakerConfig::default();
        cb.success_threshold = 2;
        let cfg = PassiveHealthChecks {
            circuit_breaker: cb,
            ..PassiveHealthChecks::default()
        };
        record_success(&mut backend, 10.0, &cfg);
        assert_eq!(backend.circuit_state, CircuitState::HalfOpen);
        record_success(&mut backend, 10.0, &cfg);
        assert_eq!(backend.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn passive_revival_sweep_clears_quarantine_after_timeout() {
        let mut backend = Backend::new("a", "https://a");
        backend.healthy = false;
        backend.last_failure_at = Some(0);
        let cfg = PassiveHealthChecks {
            enabled: true,
            failure_timeout_ms: 1,
            ..PassiveHealthChecks::default()
        };
        let mut backends = vec![backend];
        sweep_passive_revival(&mut backends, &cfg);
        assert!(backends[0].healthy);
    }

    #[test]
    fn active_probe_streak_flips_health() {
        let mut backend = Backend::new("a", "https://a");
        backend.healthy = false;
        let cfg = ActiveHealthChecks {
            consecutive_up: 2,
            ..ActiveHealthChecks::default()
        };
        record_active_probe(&mut backend, ProbeOutcome::Up, &cfg);
        assert!(!backend.healthy);
        record_active_probe(&mut backend, ProbeOutcome::Up, &cfg);
        assert!(backend.healthy);
    }
}
