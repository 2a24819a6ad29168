//! Request orchestration: the single pipeline every proxied request
//! runs through, from hostname resolution to the final response.
//!
//! Ties together hostname resolution, Stage 1 session affinity, Stage
//! 2a/2b backend steering (via the retry controller), and observability
//! header construction. Everything that mutates per-service state goes
//! through [`ServiceInstance::lock`] exactly once per request, holding
//! the guard only long enough to make the Stage 1 decision — the retry
//! controller re-acquires the config separately for its own selection
//! and mutation.

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::web::Bytes;
use actix_web::HttpRequest;
use reqwest::Client;
use tokio::sync::RwLock;

use crate::models::backend::now_ms;
use crate::models::error::{FailureClass, GatewayError};
use crate::models::service::SslOptions;
use crate::services::affinity::{self, AffinitySources};
use crate::services::forwarder;
use crate::services::hostname_resolver;
use crate::services::load_balancer::{RequestContext, Selection};
use crate::services::metrics::MetricsRegistry;
use crate::services::retry::{self, ForwardRequest};
use crate::services::service_registry::ServiceRegistry;

/// Caches one `reqwest::Client` per distinct [`SslOptions`], since
/// certificate/hostname verification is fixed at client-construction
/// time. Keyed on the options' `Debug` rendering rather than adding
/// `Hash`/`Eq` to a config type that otherwise has no use for them.
#[derive(Default)]
pub struct ClientCache {
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientCache {
    pub async fn get_or_build(&self, ssl: &SslOptions) -> Result<Client, reqwest::Error> {
        let key = format!("{ssl:?}");
        if let Some(client) = self.clients.read().await.get(&key) {
            return Ok(client.clone());
        }
        let client = forwarder::build_client(ssl)?;
        self.clients.write().await.insert(key, client.clone());
        Ok(client)
    }
}

/// Everything the proxy route handler needs, owned once at process
/// start and shared behind `web::Data`.
pub struct GatewayState {
    pub registry: ServiceRegistry,
    pub metrics: Arc<MetricsRegistry>,
    pub clients: ClientCache,
}

pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Runs the full per-request pipeline for one inbound hostname/request
/// pair and returns the response to relay to the client.
pub async fn handle(
    state: &GatewayState,
    hostname: &str,
    req: &HttpRequest,
    body: Bytes,
) -> Result<ProxyResponse, GatewayError> {
    let (instance, captures) = state.registry.resolve(hostname).await?;
    instance.tick_health().await;

    let client_ip = req
        .connection_info()
        .realip_remote_addr()
        .map(|s| s.to_string());
    let affinity_cookie_name = {
        let guard = instance.lock().await;
        guard
            .config
            .load_balancer
            .session_affinity
            .as_ref()
            .map(|a| a.name.clone())
    };
    let cookie_value = affinity_cookie_name
        .as_deref()
        .and_then(|name| req.cookie(name))
        .map(|c| c.value().to_string());
    let header_value = {
        let guard = instance.lock().await;
        guard
            .config
            .load_balancer
            .session_affinity
            .as_ref()
            .and_then(|a| req.headers().get(a.name.as_str()))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };

    let mut new_cookie: Option<String> = None;
    let mut session_key_value: Option<String> = None;
    let mut preselected: Option<Selection> = None;
    let mut affinity_hit = None;

    {
        let mut guard = instance.lock().await;
        if let Some(affinity_cfg) = guard.config.load_balancer.session_affinity.clone() {
            let sources = AffinitySources {
                cookie: cookie_value.as_deref(),
                header: header_value.as_deref(),
                client_ip: client_ip.as_deref(),
            };
            if let Some(session_key) = affinity::resolve_session_key(&affinity_cfg, &sources) {
                let now = now_ms();
                match guard.affinity.get_live(&session_key.value, now) {
                    Some(entry) => {
                        let still_usable = guard
                            .config
                            .pool(&entry.pool_id)
                            .and_then(|p| p.backends.iter().find(|b| b.id == entry.backend_id))
                            .map(|b| b.enabled && b.healthy)
                            .unwrap_or(false);
                        if still_usable {
                            preselected = Some(Selection {
                                pool_id: entry.pool_id,
                                backend_id: entry.backend_id,
                            });
                            affinity_hit = Some(true);
                        } else {
                            guard.affinity.remove(&session_key.value);
                            affinity_hit = Some(false);
                        }
                    }
                    None => affinity_hit = Some(false),
                }
                if session_key.freshly_generated {
                    new_cookie = Some(session_key.value.clone());
                }
                session_key_value = Some(session_key.value);
            }
        }
    }

    let original_host = req
        .connection_info()
        .host()
        .to_string();
    let method = req.method().clone();
    let headers = forwarder::convert_headers(req.headers());
    let mut headers = add_forwarded_headers(headers, req, &client_ip);
    if let Some(value) = &new_cookie {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(reqwest::header::COOKIE, v);
        }
    }

    let ssl = {
        let guard = instance.lock().await;
        guard.config.ssl.clone()
    };
    let client = state
        .clients
        .get_or_build(&ssl)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let ctx_country = req
        .headers()
        .get("x-geo-country")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let ctx_region = req
        .headers()
        .get("x-geo-region")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let request = ForwardRequest {
        method,
        headers,
        body,
        original_host,
    };

    let result = {
        let mut guard = instance.lock().await;
        let ctx = RequestContext {
            client_ip: client_ip.as_deref(),
            country: ctx_country.as_deref(),
            region: ctx_region.as_deref(),
        };
        let captures = captures.clone();
        let target_url_template = move |backend: &crate::models::backend::Backend| {
            hostname_resolver::expand_backend_url(&backend.url, &captures)
        };
        retry::forward_with_retry(&client, &mut guard.config, target_url_template, request, &ctx, preselected).await
    };

    let observability = {
        let guard = instance.lock().await;
        guard.config.observability.clone()
    };

    match result {
        Ok(forward_result) => {
            record_affinity_outcome(
                &instance,
                &affinity_cookie_name,
                affinity_hit,
                &session_key_value,
                &forward_result,
            )
            .await;
            let success = forward_result.outcome.is_success();
            state
                .metrics
                .record_attempt(
                    &instance.identity,
                    &forward_result.pool_id,
                    &forward_result.backend_id,
                    success,
                    forward_result.outcome.elapsed.as_secs_f64() * 1000.0,
                )
                .await;
            let snapshot = state.metrics.snapshot(&instance.identity).await;
            if let Some(metrics) = snapshot {
                instance.maybe_flush(&metrics).await;
            }

            if !success {
                let (class, message) = forward_result
                    .outcome
                    .failure
                    .clone()
                    .expect("failure class set on unsuccessful outcome");
                // §4.F point 6: a non-retryable 4xx/5xx is recorded as a
                // failure above but still relayed to the client exactly
                // as the backend sent it. Anything else (no concrete
                // upstream response, or a retryable class that exhausted
                // every attempt) has no verbatim response to forward and
                // falls back to the synthetic 503 diagnostic.
                let forward_verbatim = matches!(class, FailureClass::UpstreamNonRetryable)
                    && forward_result.outcome.status.is_some();
                if !forward_verbatim {
                    return Err(GatewayError::Upstream {
                        message,
                        class,
                        status: forward_result.outcome.status,
                    });
                }
            }

            let mut response_headers = Vec::new();
            if observability.emit_backend_used {
                response_headers.push((observability.response_header_name.clone(), forward_result.backend_id.clone()));
            }
            if observability.emit_pool_header {
                response_headers.push(("X-LB-Pool".to_string(), forward_result.pool_id.clone()));
            }
            if let Some(cookie_name) = &affinity_cookie_name {
                if let Some(value) = &new_cookie {
                    response_headers.push(("Set-Cookie".to_string(), format!("{cookie_name}={value}; Path=/; HttpOnly")));
                }
            }
            let status = forward_result.outcome.status.unwrap_or(200);
            let body = forward_result.outcome.body.unwrap_or_default();
            if let Some(upstream_headers) = &forward_result.outcome.headers {
                for (name, value) in upstream_headers {
                    if let Ok(value_str) = value.to_str() {
                        response_headers.push((name.to_string(), value_str.to_string()));
                    }
                }
            }

            Ok(ProxyResponse {
                status,
                headers: response_headers,
                body,
            })
        }
        Err(err) => {
            state
                .metrics
                .record_attempt(&instance.identity, "unknown", "unknown", false, 0.0)
                .await;
            Err(err)
        }
    }
}

/// Persists or refreshes the affinity entry after the retry controller
/// has settled on a final backend. A cache miss that succeeded creates
/// a new entry for whichever session key this request resolved
/// (cookie, IP or header); a hit only needs refreshing when
/// `update_on_revival` is set, since otherwise the existing TTL already
/// covers it.
async fn record_affinity_outcome(
    instance: &Arc<crate::services::service_instance::ServiceInstance>,
    affinity_name: &Option<String>,
    affinity_hit: Option<bool>,
    session_key: &Option<String>,
    forward_result: &retry::ForwardResult,
) {
    if affinity_name.is_none() {
        return;
    }
    if !forward_result.outcome.is_success() {
        return;
    }
    let key = match session_key {
        Some(key) => key,
        None => return,
    };
    let mut guard = instance.lock().await;
    let affinity_cfg = match guard.config.load_balancer.session_affinity.clone() {
        Some(cfg) => cfg,
        None => return,
    };
    let now = now_ms();
    let should_write = match affinity_hit {
        Some(true) => affinity_cfg.update_on_revival,
        Some(false) | None => true,
    };
    if should_write {
        guard.affinity.insert(
            key.clone(),
            forward_result.pool_id.clone(),
            forward_result.backend_id.clone(),
            affinity_cfg.ttl_ms,
            now,
        );
    }
}

fn add_forwarded_headers(
    mut headers: reqwest::header::HeaderMap,
    req: &HttpRequest,
    client_ip: &Option<String>,
) -> reqwest::header::HeaderMap {
    if let Some(ip) = client_ip {
        if let Ok(v) = HeaderValue::from_str(ip) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), v.clone());
            headers.insert(HeaderName::from_static("x-real-ip"), v);
        }
    }
    let scheme = req.connection_info().scheme().to_string();
    if let Ok(v) = HeaderValue::from_str(&scheme) {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), v);
    }
    let host = req.connection_info().host().to_string();
    if let Ok(v) = HeaderValue::from_str(&host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), v);
    }
    headers
}
