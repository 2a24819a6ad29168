//! The `/__lb_admin__/` control surface (§4.I).
//!
//! Four endpoints, all scoped to one service identity:
//!
//! - `GET  /__lb_admin__/{identity}/config`       current `ServiceConfig`
//! - `POST /__lb_admin__/{identity}/config`       deep-merge patch, persisted immediately
//! - `GET  /__lb_admin__/{identity}/metrics`      counters snapshot
//! - `GET  /__lb_admin__/{identity}/backends`     live backend health + metrics
//! - `POST /__lb_admin__/{identity}/health-check` force one active-probe cycle
//!
//! Unlike the teacher's route-CRUD admin surface, there is no create/
//! delete for services themselves — the service set is fixed at process
//! start from `DEFAULT_BACKENDS` (or the seeded config), and only the
//! pools/backends/policies *within* a service are mutable at runtime.

use actix_web::{web, HttpResponse, Result};
use serde_json::json;

use crate::models::error::GatewayError;
use crate::services::active_health;
use crate::services::proxy::GatewayState;

async fn find_instance(
    state: &GatewayState,
    identity: &str,
) -> Result<std::sync::Arc<crate::services::service_instance::ServiceInstance>, GatewayError> {
    state
        .registry
        .instance_by_identity(identity)
        .await
        .ok_or_else(|| GatewayError::NoMatchingService {
            hostname: identity.to_string(),
        })
}

pub async fn get_config(
    state: web::Data<GatewayState>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let instance = find_instance(&state, &path.into_inner()).await?;
    let guard = instance.lock().await;
    Ok(HttpResponse::Ok().json(&guard.config))
}

/// Applies a deep-merge patch (§4.C) and persists the result
/// immediately, bypassing the request-path write-coalescing that
/// covers metrics flushes.
pub async fn patch_config(
    state: web::Data<GatewayState>,
    path: web::Path<String>,
    patch: web::Json<serde_json::Value>,
) -> Result<HttpResponse, GatewayError> {
    let identity = path.into_inner();
    let instance = find_instance(&state, &identity).await?;

    let mut merged = {
        let guard = instance.lock().await;
        let mut merged = guard
            .config
            .merge_patch(patch.into_inner())
            .map_err(|message| GatewayError::AdminBadRequest { message })?;
        reset_round_robin_on_weight_change(&guard.config, &mut merged);
        merged
    };
    merged
        .validate()
        .map_err(|message| GatewayError::AdminBadRequest { message })?;

    let pool_ids: std::collections::HashSet<String> =
        merged.pools.iter().map(|p| p.id.clone()).collect();
    let backend_ids: std::collections::HashSet<String> = merged
        .pools
        .iter()
        .flat_map(|p| p.backends.iter().map(|b| b.id.clone()))
        .collect();

    instance.replace_config(merged).await;
    state.metrics.retain_ids(&identity, &pool_ids, &backend_ids).await;

    let guard = instance.lock().await;
    Ok(HttpResponse::Ok().json(&guard.config))
}

/// Any weight change within a pool invalidates the meaning of its
/// `current_round_robin_index` — the weighted prefix-sum walk that
/// round robin uses (§9) no longer lines up with the same backend at
/// the same index once weights shift, so the index is reset to 0
/// rather than left to point partway into a now-different distribution.
fn reset_round_robin_on_weight_change(old: &crate::models::service::ServiceConfig, merged: &mut crate::models::service::ServiceConfig) {
    for pool in &mut merged.pools {
        let Some(old_pool) = old.pool(&pool.id) else { continue };
        let changed = pool.backends.iter().any(|b| {
            old_pool
                .backends
                .iter()
                .find(|ob| ob.id == b.id)
                .map(|ob| ob.weight != b.weight)
                .unwrap_or(false)
        });
        if changed {
            pool.current_round_robin_index = 0;
        }
    }
}

pub async fn get_metrics(
    state: web::Data<GatewayState>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let identity = path.into_inner();
    find_instance(&state, &identity).await?;
    let snapshot = state.metrics.snapshot(&identity).await.unwrap_or_default();
    Ok(HttpResponse::Ok().json(&snapshot))
}

pub async fn get_all_metrics(state: web::Data<GatewayState>) -> Result<HttpResponse, GatewayError> {
    let snapshot = state.metrics.snapshot_all().await;
    Ok(HttpResponse::Ok().json(&snapshot))
}

/// Lists every backend's live health view alongside its metrics
/// counter, for the "what does the load balancer currently think"
/// dashboard-style question §4.I asks this endpoint to answer.
pub async fn get_backends(
    state: web::Data<GatewayState>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let identity = path.into_inner();
    let instance = find_instance(&state, &identity).await?;
    let metrics = state.metrics.snapshot(&identity).await.unwrap_or_default();

    let guard = instance.lock().await;
    let pools: Vec<serde_json::Value> = guard
        .config
        .pools
        .iter()
        .map(|pool| {
            let backends: Vec<serde_json::Value> = pool
                .backends
                .iter()
                .map(|b| {
                    let counter = metrics.per_backend.get(&b.id).cloned().unwrap_or_default();
                    json!({
                        "id": b.id,
                        "url": b.url,
                        "weight": b.weight,
                        "priority": b.priority,
                        "enabled": b.enabled,
                        "healthy": b.healthy,
                        "circuit_state": b.circuit_state,
                        "outstanding_requests": b.outstanding_requests,
                        "avg_response_ms": b.avg_response_ms,
                        "requests": counter.requests,
                        "successful": counter.successful,
                        "failed": counter.failed,
                    })
                })
                .collect();
            json!({
                "id": pool.id,
                "enabled": pool.enabled,
                "minimum_origins": pool.minimum_origins,
                "healthy": pool.is_healthy(),
                "backends": backends,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "pools": pools })))
}

/// Forces one active-probe cycle outside the ticker's own schedule, for
/// operators who want an immediate answer after changing a backend's
/// `enabled` flag rather than waiting out `interval_ms`.
pub async fn force_health_check(
    state: web::Data<GatewayState>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let identity = path.into_inner();
    let instance = find_instance(&state, &identity).await?;
    let ssl = {
        let guard = instance.lock().await;
        guard.config.ssl.clone()
    };
    let client = state
        .clients
        .get_or_build(&ssl)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    active_health::run_probe_cycle(&instance, &client).await;
    let guard = instance.lock().await;
    Ok(HttpResponse::Ok().json(&guard.config))
}

pub fn configure_admin(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/__lb_admin__")
            .route("/metrics", web::get().to(get_all_metrics))
            .route("/{identity}/config", web::get().to(get_config))
            .route("/{identity}/config", web::post().to(patch_config))
            .route("/{identity}/metrics", web::get().to(get_metrics))
            .route("/{identity}/backends", web::get().to(get_backends))
            .route("/{identity}/health-check", web::post().to(force_health_check)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::{Backend, Pool};
    use crate::models::service::{LoadBalancer, ServiceConfig};

    fn config_with_weight(weight: u32) -> ServiceConfig {
        ServiceConfig {
            pools: vec![Pool {
                id: "default".to_string(),
                minimum_origins: 1,
                endpoint_steering: Default::default(),
                geo: None,
                enabled: true,
                backends: vec![Backend {
                    weight,
                    ..Backend::new("b1", "https://b1.example")
                }],
                current_round_robin_index: 0,
            }],
            load_balancer: LoadBalancer {
                hostname: "a.example.com".to_string(),
                default_pool_ids: vec!["default".to_string()],
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

    #[test]
    fn weight_change_resets_round_robin_index() {
        let old = config_with_weight(1);
        let mut merged = config_with_weight(5);
        merged.pools[0].current_round_robin_index = 7;
        reset_round_robin_on_weight_change(&old, &mut merged);
        assert_eq!(merged.pools[0].current_round_robin_index, 0);
    }

    #[test]
    fn unchanged_weight_keeps_round_robin_index() {
        let old = config_with_weight(3);
        let mut merged = config_with_weight(3);
        merged.pools[0].current_round_robin_index = 7;
        reset_round_robin_on_weight_change(&old, &mut merged);
        assert_eq!(merged.pools[0].current_round_robin_index, 7);
    }
}
