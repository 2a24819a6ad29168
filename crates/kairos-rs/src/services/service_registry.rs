//! Hostname resolution plus the registry of live [`ServiceInstance`]s.
//!
//! The registry owns the compiled [`HostnameResolver`] and an
//! `ahash`-backed map from resolved service identity to its
//! `Arc<ServiceInstance>`. Lookups never block on each other: the map
//! itself is read-locked only for the duration of a clone of the `Arc`,
//! and all per-service mutation happens behind that service's own lock.

use std::sync::Arc;

use ahash::AHashMap;
use tokio::sync::RwLock;

use crate::models::error::GatewayError;
use crate::models::service::ServiceConfig;
use crate::models::settings::{EnvFlags, ServiceSeed};
use crate::services::hostname_resolver::{HostnameResolveError, HostnameResolver};
use crate::services::service_instance::ServiceInstance;
use crate::services::store::InMemoryStateStore;

impl From<HostnameResolveError> for GatewayError {
    fn from(err: HostnameResolveError) -> Self {
        match err {
            HostnameResolveError::NoMatchingService { hostname } => {
                GatewayError::NoMatchingService { hostname }
            }
            HostnameResolveError::InvalidPattern { pattern, reason } => GatewayError::ConfigInvalid {
                message: format!("invalid hostname pattern {pattern}: {reason}"),
            },
        }
    }
}

pub struct ServiceRegistry {
    resolver: HostnameResolver,
    instances: RwLock<AHashMap<String, Arc<ServiceInstance>>>,
}

impl ServiceRegistry {
    /// Builds the registry from a resolved, pre-validated set of
    /// `(pattern, ServiceConfig)` pairs. Each pattern becomes one
    /// compiled resolver entry and one [`ServiceInstance`], seeded
    /// eagerly rather than lazily — there is no `uninitialised` state
    /// in this design, unlike a lazily-provisioned KV-backed store:
    /// every configured service is ready the moment the registry exists.
    pub fn new(services: Vec<(String, ServiceConfig)>) -> Result<Self, GatewayError> {
        let patterns: Vec<String> = services.iter().map(|(p, _)| p.clone()).collect();
        let resolver = HostnameResolver::new(&patterns)?;

        let mut instances = AHashMap::with_capacity(services.len());
        for (pattern, config) in services {
            let store = Arc::new(InMemoryStateStore::default());
            instances.insert(
                pattern.clone(),
                Arc::new(ServiceInstance::new(pattern, config, store)),
            );
        }

        Ok(Self {
            resolver,
            instances: RwLock::new(instances),
        })
    }

    /// Resolves `hostname`, returning the owning [`ServiceInstance`]
    /// and the capture groups from the matched pattern (used by the
    /// forwarder to expand `$1..$9` backend URL templates for
    /// regex-pattern services).
    pub async fn resolve(
        &self,
        hostname: &str,
    ) -> Result<(Arc<ServiceInstance>, Vec<String>), GatewayError> {
        let (identity, captures) = self.resolver.resolve(hostname)?;
        let instances = self.instances.read().await;
        let instance = instances
            .get(identity)
            .cloned()
            .ok_or_else(|| GatewayError::NoMatchingService {
                hostname: hostname.to_string(),
            })?;
        Ok((instance, captures))
    }

    pub async fn instance_by_identity(&self, identity: &str) -> Option<Arc<ServiceInstance>> {
        self.instances.read().await.get(identity).cloned()
    }

    pub async fn all_identities(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }
}

/// Turns a flat list of `(hostname_pattern, backend_url)` seeds (the
/// normalised `DEFAULT_BACKENDS` shape) into one-pool-per-service
/// `ServiceConfig`s with sane defaults, for the common case where the
/// environment-variable configuration format is used instead of a full
/// admin-authored `ServiceConfig` JSON document. The process-wide
/// `SSL_*` flags (§6) become the seeded services' initial `SslOptions`;
/// an admin config patch can still override them per service later.
pub fn seeds_to_service_configs(
    seeds: Vec<ServiceSeed>,
    flags: &EnvFlags,
) -> Vec<(String, ServiceConfig)> {
    use crate::models::backend::{Backend, Pool};
    use crate::models::service::{LoadBalancer, SslOptions};

    let ssl = SslOptions {
        skip_certificate_verification: flags.ssl_skip_certificate_verification,
        allow_self_signed_certificates: flags.ssl_allow_self_signed_certificates,
        skip_hostname_verification: flags.ssl_skip_hostname_verification,
    };

    seeds
        .into_iter()
        .map(|seed| {
            let backends: Vec<Backend> = seed
                .backends
                .iter()
                .enumerate()
                .map(|(i, url)| Backend::new(format!("backend-{i}"), url.clone()))
                .collect();
            let pool = Pool {
                id: "default".to_string(),
                minimum_origins: 1,
                endpoint_steering: Default::default(),
                geo: None,
                enabled: true,
                backends,
                current_round_robin_index: 0,
            };
            let config = ServiceConfig {
                pools: vec![pool],
                load_balancer: LoadBalancer {
                    hostname: seed.hostname.clone(),
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
                ssl: ssl.clone(),
            };
            (seed.hostname, config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_hostname_to_its_instance() {
        let configs = seeds_to_service_configs(
            vec![ServiceSeed {
                hostname: "a.example.com".to_string(),
                backends: vec!["https://a.origin".to_string()],
            }],
            &EnvFlags::default(),
        );
        let registry = ServiceRegistry::new(configs).unwrap();
        let (instance, _) = registry.resolve("a.example.com").await.unwrap();
        assert_eq!(instance.identity, "a.example.com");
    }

    #[tokio::test]
    async fn unregistered_hostname_is_no_matching_service() {
        let configs = seeds_to_service_configs(
            vec![ServiceSeed {
                hostname: "a.example.com".to_string(),
                backends: vec!["https://a.origin".to_string()],
            }],
            &EnvFlags::default(),
        );
        let registry = ServiceRegistry::new(configs).unwrap();
        let result = registry.resolve("b.example.com").await;
        assert!(matches!(result, Err(GatewayError::NoMatchingService { .. })));
    }
}
