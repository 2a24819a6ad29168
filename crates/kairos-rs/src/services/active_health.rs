//! Timer-driven active health probes (§4.E), independent of request
//! traffic. One probe cycle visits every backend of one service
//! sequentially — the service is already single-threaded, so there is
//! nothing to gain from probing its own backends concurrently, and
//! sequencing keeps one slow origin from racing another's probe
//! against the same `ServiceConfig` lock.

use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;

use crate::models::service::ActiveHealthChecks;
use crate::services::health_manager::{self, ProbeOutcome};
use crate::services::service_instance::ServiceInstance;

/// Runs one probe cycle against every pool/backend of `instance`,
/// applying each outcome under the instance's serial-execution lock.
/// Used both by the periodic ticker and by the admin `/health-check`
/// force-probe endpoint (§4.I).
pub async fn run_probe_cycle(instance: &ServiceInstance, client: &Client) {
    let mut state = instance.lock().await;
    if !state.config.active_health_checks.enabled {
        return;
    }
    let cfg = state.config.active_health_checks.clone();
    for pool in state.config.pools.iter_mut() {
        for backend in pool.backends.iter_mut() {
            let outcome = probe_once(client, &health_manager::active_probe_request(backend, &cfg), &cfg).await;
            health_manager::record_active_probe(backend, outcome, &cfg);
        }
    }
}

async fn probe_once(client: &Client, (method, url, timeout_ms): &(String, String, u64), cfg: &ActiveHealthChecks) -> ProbeOutcome {
    let method = method.parse::<reqwest::Method>().unwrap_or(reqwest::Method::GET);
    let request = client.request(method, url).timeout(Duration::from_millis(*timeout_ms));

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            debug!("active probe to {url} failed: {err}");
            return ProbeOutcome::Down;
        }
    };

    let status = response.status().as_u16();
    if !cfg.expected_codes.contains(&status) {
        warn!("active probe to {url} returned unexpected status {status}");
        return ProbeOutcome::Down;
    }

    if let Some(needle) = &cfg.body_contains {
        let body = response.text().await.unwrap_or_default();
        if !body.contains(needle.as_str()) {
            return ProbeOutcome::Down;
        }
    }

    ProbeOutcome::Up
}

/// Spawns the per-service probe ticker: sleeps `interval_ms`, runs a
/// cycle, repeats forever. Probing a disabled service is a cheap no-op
/// check inside [`run_probe_cycle`] rather than an early return here,
/// so enabling active health checks later via the admin API takes
/// effect on the ticker's very next tick without a restart.
pub fn spawn_ticker(instance: std::sync::Arc<ServiceInstance>, client: Client) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval_ms = {
                let state = instance.lock().await;
                state.config.active_health_checks.interval_ms.max(1_000)
            };
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            run_probe_cycle(&instance, &client).await;
        }
    })
}
