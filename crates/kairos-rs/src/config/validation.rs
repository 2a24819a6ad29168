//! Configuration validation with detailed error reporting.
//!
//! [`ServiceConfig::validate`] catches the errors that would make a
//! service unusable (no pools, dangling pool ids). This module layers
//! categorized, non-fatal feedback on top of that — duplicate hostname
//! patterns, unreachable `minimum_origins`, insecure backend schemes,
//! retry/backoff sanity — the way the teacher's validator separates
//! hard errors from warnings and recommendations.

use std::collections::HashSet;

use log::{info, warn};

use crate::models::service::ServiceConfig;

/// Result of validating one or more service configurations, categorized
/// by severity (errors, warnings, recommendations).
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_recommendation(&mut self, recommendation: String) {
        self.recommendations.push(recommendation);
    }

    fn merge(&mut self, other: ValidationResult) {
        if !other.is_valid {
            self.is_valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.recommendations.extend(other.recommendations);
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates every `(hostname_pattern, ServiceConfig)` pair plus
    /// cross-service concerns (duplicate patterns) before the registry
    /// is built. Structural errors (empty pools, dangling pool ids) are
    /// still caught by [`ServiceConfig::validate`] — this adds the
    /// categorized layer on top so startup can log a full report
    /// instead of failing on the first problem found.
    pub fn validate_comprehensive(services: &[(String, ServiceConfig)]) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_basic_structure(services, &mut result);
        Self::validate_duplicate_patterns(services, &mut result);
        for (pattern, config) in services {
            result.merge(Self::validate_service(pattern, config));
        }

        Self::log_validation_results(&result);
        result
    }

    fn validate_basic_structure(services: &[(String, ServiceConfig)], result: &mut ValidationResult) {
        if services.is_empty() {
            result.add_error(
                "no services configured - the gateway will not handle any requests".to_string(),
            );
        }
        for (pattern, config) in services {
            if let Err(error) = config.validate() {
                result.add_error(format!("service {pattern}: {error}"));
            }
        }
    }

    /// Duplicate hostname patterns are caught here rather than in
    /// [`crate::services::hostname_resolver::HostnameResolver`], which
    /// silently keeps the first-declared entry per §5's precedence
    /// rule — a duplicate is very likely an operator mistake even
    /// though resolution itself tolerates it.
    fn validate_duplicate_patterns(services: &[(String, ServiceConfig)], result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for (pattern, _) in services {
            if !seen.insert(pattern.as_str()) {
                result.add_warning(format!(
                    "duplicate hostname pattern {pattern} - only the first declaration is reachable"
                ));
            }
        }
    }

    fn validate_service(pattern: &str, config: &ServiceConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        Self::validate_security(pattern, config, &mut result);
        Self::validate_pool_reachability(pattern, config, &mut result);
        Self::validate_retry_policy(pattern, config, &mut result);
        result
    }

    fn validate_security(pattern: &str, config: &ServiceConfig, result: &mut ValidationResult) {
        let mut http_backends = 0;
        let mut https_backends = 0;
        for pool in &config.pools {
            for backend in &pool.backends {
                if backend.url.starts_with("http://") {
                    http_backends += 1;
                } else if backend.url.starts_with("https://") {
                    https_backends += 1;
                }
            }
        }
        if http_backends > 0 && https_backends == 0 {
            result.add_warning(format!(
                "service {pattern}: all backends use http:// - consider https:// for production"
            ));
        }
        if config.ssl.skip_certificate_verification {
            result.add_warning(format!(
                "service {pattern}: ssl.skip_certificate_verification is enabled"
            ));
        }
    }

    /// A pool whose `minimum_origins` exceeds its configured backend
    /// count can never be considered healthy (§4.B), which silently
    /// fails every request through it — worth flagging even though it
    /// is not a hard structural error.
    fn validate_pool_reachability(pattern: &str, config: &ServiceConfig, result: &mut ValidationResult) {
        for pool in &config.pools {
            if pool.minimum_origins as usize > pool.backends.len() {
                result.add_error(format!(
                    "service {pattern}: pool {} requires minimum_origins={} but only has {} backends configured",
                    pool.id,
                    pool.minimum_origins,
                    pool.backends.len()
                ));
            }
            if pool.backends.iter().filter(|b| b.enabled).count() == 0 {
                result.add_warning(format!(
                    "service {pattern}: pool {} has no enabled backends",
                    pool.id
                ));
            }
        }
    }

    fn validate_retry_policy(pattern: &str, config: &ServiceConfig, result: &mut ValidationResult) {
        let policy = &config.retry_policy;
        if policy.max_retries == 0 {
            result.add_recommendation(format!(
                "service {pattern}: retry_policy.max_retries is 0 - no failover will occur on upstream errors"
            ));
        }
        if policy.base_delay_ms > policy.retry_timeout_ms {
            result.add_warning(format!(
                "service {pattern}: retry_policy.base_delay_ms ({}) exceeds retry_timeout_ms ({}) - backoff will always be capped",
                policy.base_delay_ms, policy.retry_timeout_ms
            ));
        }
    }

    fn log_validation_results(result: &ValidationResult) {
        if !result.is_valid {
            for error in &result.errors {
                warn!("config error: {error}");
            }
        }
        for warning in &result.warnings {
            warn!("config warning: {warning}");
        }
        for recommendation in &result.recommendations {
            info!("config recommendation: {recommendation}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::{Backend, Pool};
    use crate::models::service::LoadBalancer;

    fn sample(hostname: &str, backend_url: &str, minimum_origins: u32) -> (String, ServiceConfig) {
        let config = ServiceConfig {
            pools: vec![Pool {
                id: "default".to_string(),
                minimum_origins,
                endpoint_steering: Default::default(),
                geo: None,
                enabled: true,
                backends: vec![Backend::new("b1", backend_url)],
                current_round_robin_index: 0,
            }],
            load_balancer: LoadBalancer {
                hostname: hostname.to_string(),
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
        };
        (hostname.to_string(), config)
    }

    #[test]
    fn empty_service_list_is_an_error() {
        let result = ConfigValidator::validate_comprehensive(&[]);
        assert!(!result.is_valid);
    }

    #[test]
    fn unreachable_minimum_origins_is_an_error() {
        let services = vec![sample("a.example.com", "https://a.origin", 2)];
        let result = ConfigValidator::validate_comprehensive(&services);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("minimum_origins")));
    }

    #[test]
    fn http_only_backend_is_a_warning_not_an_error() {
        let services = vec![sample("a.example.com", "http://a.origin", 1)];
        let result = ConfigValidator::validate_comprehensive(&services);
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("http://")));
    }

    #[test]
    fn duplicate_hostname_pattern_is_a_warning() {
        let services = vec![
            sample("a.example.com", "https://a.origin", 1),
            sample("a.example.com", "https://b.origin", 1),
        ];
        let result = ConfigValidator::validate_comprehensive(&services);
        assert!(result.warnings.iter().any(|w| w.contains("duplicate hostname pattern")));
    }
}
