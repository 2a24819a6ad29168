//! Top-level settings: the `DEFAULT_BACKENDS` sum type and the
//! environment flags that govern process-wide behaviour.
//!
//! `DEFAULT_BACKENDS` is parsed once into a normalised list of
//! [`ServiceSeed`] entries (§9 "Configuration as sum type") and handed
//! to the [`crate::services::service_registry::ServiceRegistry`] to
//! seed service instances on first access.

use serde::{Deserialize, Serialize};

/// One of the three shapes `DEFAULT_BACKENDS` may take, normalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSeed {
    pub hostname: String,
    pub backends: Vec<String>,
}

/// Parses the sum-type `DEFAULT_BACKENDS` JSON string into a flat list
/// of service seeds. Accepts:
/// - `{"services":[{"hostname":..,"backends":[..]},...]}`
/// - a bare top-level array of the same per-entry shape
/// - a single `{"hostname":..,"backends":[..]}` object
pub fn parse_default_backends(raw: &str) -> Result<Vec<ServiceSeed>, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("DEFAULT_BACKENDS is not valid JSON: {e}"))?;

    #[derive(Deserialize)]
    struct Wrapper {
        services: Vec<ServiceSeed>,
    }

    if let Ok(wrapper) = serde_json::from_value::<Wrapper>(value.clone()) {
        return Ok(wrapper.services);
    }
    if let Ok(list) = serde_json::from_value::<Vec<ServiceSeed>>(value.clone()) {
        return Ok(list);
    }
    if let Ok(single) = serde_json::from_value::<ServiceSeed>(value) {
        return Ok(vec![single]);
    }
    Err("DEFAULT_BACKENDS did not match any accepted shape".to_string())
}

/// Process-wide environment flags (§6 "Environment flags").
#[derive(Debug, Clone, Default)]
pub struct EnvFlags {
    pub debug: bool,
    pub force_env: bool,
    pub dns_first: bool,
    pub ssl_skip_certificate_verification: bool,
    pub ssl_allow_self_signed_certificates: bool,
    pub ssl_skip_hostname_verification: bool,
}

impl EnvFlags {
    pub fn from_env() -> Self {
        Self {
            debug: env_bool("DEBUG"),
            force_env: env_bool("FORCE_ENV"),
            dns_first: env_bool("DNS_FIRST"),
            ssl_skip_certificate_verification: env_bool("SSL_SKIP_CERTIFICATE_VERIFICATION"),
            ssl_allow_self_signed_certificates: env_bool("SSL_ALLOW_SELF_SIGNED_CERTIFICATES"),
            ssl_skip_hostname_verification: env_bool("SSL_SKIP_HOSTNAME_VERIFICATION"),
        }
    }
}

fn env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => false,
    }
}

/// Resolved process configuration: the environment flags plus the
/// parsed service seeds used to bootstrap the registry.
#[derive(Debug, Clone)]
pub struct Settings {
    pub flags: EnvFlags,
    pub services: Vec<ServiceSeed>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if self.services.is_empty() {
            return Err("no services configured in DEFAULT_BACKENDS".to_string());
        }
        for service in &self.services {
            if service.hostname.trim().is_empty() {
                return Err("service hostname pattern must not be empty".to_string());
            }
            if service.backends.is_empty() {
                return Err(format!(
                    "service {} has no backends configured",
                    service.hostname
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_services_shape() {
        let raw = r#"{"services":[{"hostname":"a.example.com","backends":["https://a.origin"]}]}"#;
        let seeds = parse_default_backends(raw).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].hostname, "a.example.com");
    }

    #[test]
    fn parses_bare_array_shape() {
        let raw = r#"[{"hostname":"a.example.com","backends":["https://a.origin"]}]"#;
        let seeds = parse_default_backends(raw).unwrap();
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn parses_single_object_shape() {
        let raw = r#"{"hostname":"a.example.com","backends":["https://a.origin"]}"#;
        let seeds = parse_default_backends(raw).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].backends[0], "https://a.origin");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_default_backends("not json").is_err());
    }
}
