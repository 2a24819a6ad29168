//! Backend selection pipeline: session affinity, traffic steering
//! (between pools) and endpoint steering (within a pool).
//!
//! Unlike the path router's dynamic-dispatch `LoadBalancer` trait this
//! replaces, steering policies here are finite tagged enums with pure
//! selector functions — the design notes call this out explicitly
//! ("implement as tagged variants with a pure selector function, not
//! interface hierarchies"), and it falls out naturally once the
//! round-robin index and affinity map live on `ServiceConfig` itself,
//! mutated under one per-service lock instead of internal atomics.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::Rng;

use crate::models::backend::{Backend, EndpointSteering, Pool};
use crate::models::service::{LoadBalancer, ServiceConfig, TrafficSteering};
use crate::services::health_manager;

#[derive(Debug, Clone)]
pub struct Selection {
    pub pool_id: String,
    pub backend_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub client_ip: Option<&'a str>,
    pub country: Option<&'a str>,
    pub region: Option<&'a str>,
}

/// Stage 2a: choose a healthy pool according to the service's traffic
/// steering policy. Returns `None` only when no pool is healthy and no
/// fallback is configured (`NoHealthyPool`).
pub fn select_pool<'a>(
    config: &'a ServiceConfig,
    ctx: &RequestContext,
) -> Option<&'a Pool> {
    let lb = &config.load_balancer;
    let healthy_pools: Vec<&Pool> = config
        .pools
        .iter()
        .filter(|p| p.enabled && p.is_healthy())
        .collect();

    let chosen = match lb.traffic_steering {
        TrafficSteering::Off => lb
            .default_pool_ids
            .iter()
            .find_map(|id| healthy_pools.iter().find(|p| &p.id == id))
            .copied(),
        TrafficSteering::Random => weighted_random_pool(&healthy_pools),
        TrafficSteering::Geo => select_geo_pool(config, &healthy_pools, ctx)
            .or_else(|| weighted_random_pool(&healthy_pools)),
        TrafficSteering::Proximity => select_proximity_pool(&healthy_pools, ctx)
            .or_else(|| weighted_random_pool(&healthy_pools)),
        TrafficSteering::Dynamic => {
            // RTT is measured lazily elsewhere; absent a cache, fall
            // back to the declared priority order.
            lb.default_pool_ids
                .iter()
                .find_map(|id| healthy_pools.iter().find(|p| &p.id == id))
                .copied()
        }
        TrafficSteering::LeastOutstandingRequests => {
            least_outstanding_pool(&healthy_pools)
        }
        TrafficSteering::DnsFailover => select_dns_failover_pool(config, &healthy_pools),
    };

    chosen.or_else(|| {
        lb.fallback_pool_id
            .as_ref()
            .and_then(|id| config.pools.iter().find(|p| &p.id == id && p.enabled))
    })
}

fn select_geo_pool<'a>(
    config: &'a ServiceConfig,
    healthy: &[&'a Pool],
    ctx: &RequestContext,
) -> Option<&'a Pool> {
    let lb = &config.load_balancer;
    if let Some(country) = ctx.country {
        if let Some(pool_id) = lb.country_pools.get(country) {
            if let Some(p) = healthy.iter().find(|p| &p.id == pool_id) {
                return Some(*p);
            }
        }
    }
    if let Some(region) = ctx.region {
        if let Some(pool_id) = lb.region_pools.get(region) {
            if let Some(p) = healthy.iter().find(|p| &p.id == pool_id) {
                return Some(*p);
            }
        }
    }
    None
}

/// Proximity steering needs the requester's own coordinates, which in
/// this deployment come from a collaborator (geo-IP lookup) outside
/// the core's scope. Without them there is nothing to compare pool
/// geo against, so this always falls through to weighted random,
/// matching the documented tie rule for an unresolvable distance.
fn select_proximity_pool<'a>(_healthy: &[&'a Pool], _ctx: &RequestContext) -> Option<&'a Pool> {
    None
}

fn least_outstanding_pool<'a>(healthy: &[&'a Pool]) -> Option<&'a Pool> {
    weighted_random_by(healthy, |p| {
        let outstanding: u32 = p.backends.iter().map(|b| b.outstanding_requests).sum();
        let weight: u32 = p.backends.iter().map(|b| b.weight).sum();
        weight as f64 / (outstanding as f64 + 1.0)
    })
}

fn select_dns_failover_pool<'a>(config: &'a ServiceConfig, healthy: &[&'a Pool]) -> Option<&'a Pool> {
    let lb = &config.load_balancer;
    use crate::models::service::DnsFailoverState;
    match lb.dns_failover_state {
        DnsFailoverState::Primary => lb
            .default_pool_ids
            .iter()
            .find_map(|id| healthy.iter().find(|p| &p.id == id))
            .copied(),
        DnsFailoverState::Failover => lb
            .failover_pool_ids
            .iter()
            .find_map(|id| healthy.iter().find(|p| &p.id == id))
            .copied(),
    }
}

fn weighted_random_pool<'a>(healthy: &[&'a Pool]) -> Option<&'a Pool> {
    weighted_random_by(healthy, |p| p.backends.len().max(1) as f64)
}

fn weighted_random_by<'a, F: Fn(&Pool) -> f64>(healthy: &[&'a Pool], score: F) -> Option<&'a Pool> {
    if healthy.is_empty() {
        return None;
    }
    let total: f64 = healthy.iter().map(|p| score(p)).sum();
    if total <= 0.0 {
        return healthy.first().copied();
    }
    let mut pick = rand::thread_rng().gen_range(0.0..total);
    for pool in healthy {
        let w = score(pool);
        if pick < w {
            return Some(pool);
        }
        pick -= w;
    }
    healthy.last().copied()
}

/// Stage 2b: choose a backend within `pool` per its endpoint steering
/// policy. Mutates `pool.current_round_robin_index` for the
/// round-robin policy ("select then increment", never
/// increment-then-select).
pub fn select_backend<'a>(
    pool: &'a mut Pool,
    ctx: &RequestContext,
    exclude_backend_id: Option<&str>,
) -> Option<Selection> {
    let candidates: Vec<usize> = pool
        .backends
        .iter()
        .enumerate()
        .filter(|(_, b)| {
            b.enabled
                && b.healthy
                && health_manager::circuit_admits_traffic(b)
                && Some(b.id.as_str()) != exclude_backend_id
        })
        .map(|(i, _)| i)
        .collect();

    if candidates.is_empty() {
        // Rotation requires a different backend; if none is available,
        // fall back to retrying the excluded one if it is otherwise
        // selectable (only it remains).
        if exclude_backend_id.is_some() {
            return select_backend(pool, ctx, None);
        }
        return None;
    }

    let chosen_index = match pool.endpoint_steering {
        EndpointSteering::RoundRobin => {
            let total_weight: u32 = candidates.iter().map(|&i| pool.backends[i].weight).sum();
            if total_weight == 0 {
                return None;
            }
            let walk = (pool.current_round_robin_index % total_weight as u64) as u32;
            pool.current_round_robin_index = pool.current_round_robin_index.wrapping_add(1);
            pick_by_weight_walk(&candidates, &pool.backends, walk)
        }
        EndpointSteering::Random => {
            pick_weighted_random(&candidates, &pool.backends, |b| b.weight as f64)
        }
        EndpointSteering::Hash => {
            let hash = ctx.client_ip.map(hash_str).unwrap_or(0);
            candidates[(hash as usize) % candidates.len()]
        }
        EndpointSteering::LeastOutstandingRequests => pick_weighted_random(
            &candidates,
            &pool.backends,
            |b| b.weight as f64 / (b.outstanding_requests as f64 + 1.0),
        ),
        EndpointSteering::LeastConnections => pick_least_connections(&candidates, &pool.backends),
    };

    let backend = &pool.backends[chosen_index];
    Some(Selection {
        pool_id: pool.id.clone(),
        backend_id: backend.id.clone(),
    })
}

/// Prefix-sum walk over backend weights (total-weight walk), per §4.D:
/// "pick index in [0, Σw); walk prefix sums".
fn pick_by_weight_walk(candidates: &[usize], backends: &[Backend], mut walk: u32) -> usize {
    for &i in candidates {
        let w = backends[i].weight;
        if walk < w {
            return i;
        }
        walk -= w;
    }
    *candidates.last().unwrap()
}

fn pick_weighted_random<F: Fn(&Backend) -> f64>(
    candidates: &[usize],
    backends: &[Backend],
    score: F,
) -> usize {
    let total: f64 = candidates.iter().map(|&i| score(&backends[i])).sum();
    if total <= 0.0 {
        return candidates[0];
    }
    let mut pick = rand::thread_rng().gen_range(0.0..total);
    for &i in candidates {
        let w = score(&backends[i]);
        if pick < w {
            return i;
        }
        pick -= w;
    }
    *candidates.last().unwrap()
}

/// Minimum `connectionsActive`; ties broken by lower priority, then
/// declared order, per §4.D's tie-break rule.
fn pick_least_connections(candidates: &[usize], backends: &[Backend]) -> usize {
    *candidates
        .iter()
        .min_by(|&&a, &&b| {
            let ba = &backends[a];
            let bb = &backends[b];
            ba.connections_active
                .cmp(&bb.connections_active)
                .then(ba.priority.cmp(&bb.priority))
                .then(a.cmp(&b))
        })
        .unwrap()
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::Backend;

    fn pool_with(backends: Vec<Backend>, steering: EndpointSteering) -> Pool {
        Pool {
            id: "p1".to_string(),
            minimum_origins: 1,
            endpoint_steering: steering,
            geo: None,
            enabled: true,
            backends,
            current_round_robin_index: 0,
        }
    }

    #[test]
    fn round_robin_selects_then_increments_alternating() {
        let mut pool = pool_with(
            vec![Backend::new("a", "https://a"), Backend::new("b", "https://b")],
            EndpointSteering::RoundRobin,
        );
        let ctx = RequestContext { client_ip: None, country: None, region: None };
        let seq: Vec<String> = (0..4)
            .map(|_| select_backend(&mut pool, &ctx, None).unwrap().backend_id)
            .collect();
        assert_eq!(seq, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn least_connections_breaks_ties_by_priority_then_order() {
        let mut a = Backend::new("a", "https://a");
        a.connections_active = 2;
        a.priority = 1;
        let mut b = Backend::new("b", "https://b");
        b.connections_active = 2;
        b.priority = 0;
        let mut pool = pool_with(vec![a, b], EndpointSteering::LeastConnections);
        let ctx = RequestContext { client_ip: None, country: None, region: None };
        let sel = select_backend(&mut pool, &ctx, None).unwrap();
        assert_eq!(sel.backend_id, "b");
    }

    #[test]
    fn rotation_excludes_the_given_backend_when_an_alternative_exists() {
        let mut pool = pool_with(
            vec![Backend::new("a", "https://a"), Backend::new("b", "https://b")],
            EndpointSteering::RoundRobin,
        );
        let ctx = RequestContext { client_ip: None, country: None, region: None };
        let sel = select_backend(&mut pool, &ctx, Some("a")).unwrap();
        assert_eq!(sel.backend_id, "b");
    }

    #[test]
    fn no_candidates_returns_none() {
        let mut b = Backend::new("a", "https://a");
        b.healthy = false;
        let mut pool = pool_with(vec![b], EndpointSteering::RoundRobin);
        let ctx = RequestContext { client_ip: None, country: None, region: None };
        assert!(select_backend(&mut pool, &ctx, None).is_none());
    }
}
