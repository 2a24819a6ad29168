//! Retry/failover controller: the loop that turns one inbound request
//! into one or more forwarding attempts, applying idempotency rules,
//! backoff, backend rotation and zero-downtime failover.

use std::time::Duration;

use actix_web::http::Method as ActixMethod;
use actix_web::web::Bytes;
use reqwest::{header::HeaderMap as ReqwestHeaderMap, Client, Method as ReqwestMethod};
use tokio::time::sleep;

use crate::models::backend::Backend;
use crate::models::error::{FailureClass, GatewayError};
use crate::models::service::{BackoffStrategy, RetryPolicy, ServiceConfig};
use crate::services::forwarder::{self, AttemptOutcome};
use crate::services::health_manager;
use crate::services::load_balancer::{self, RequestContext, Selection};

pub struct ForwardRequest {
    pub method: ActixMethod,
    pub headers: ReqwestHeaderMap,
    pub body: Bytes,
    /// The client's original `Host`, used by [`forwarder::resolve_host_header`]
    /// for the `preserve` rewrite mode and as the fallback for
    /// `backend_hostname` when a backend URL fails to parse.
    pub original_host: String,
}

pub struct ForwardResult {
    pub outcome: AttemptOutcome,
    pub backend_id: String,
    pub pool_id: String,
    pub attempts: u32,
}

/// Runs the retry/failover loop for one request against `config`,
/// returning the final attempt outcome (success or the last failure)
/// plus which backend served it.
///
/// Mirrors §4.G's pseudocode: select, attempt, classify, decide
/// retry-or-stop, rotate backend, back off, repeat up to
/// `retry_policy.max_retries` additional attempts after the first.
pub async fn forward_with_retry(
    client: &Client,
    config: &mut ServiceConfig,
    target_url_template: impl Fn(&Backend) -> String,
    request: ForwardRequest,
    ctx: &RequestContext<'_>,
    preselected: Option<Selection>,
) -> Result<ForwardResult, GatewayError> {
    let policy = config.retry_policy.clone();
    let host_header_rewrite = config.host_header_rewrite.clone();
    let non_idempotent = forwarder::is_non_idempotent(&request.method);
    let reqwest_method: ReqwestMethod = forwarder::convert_method(&request.method);

    let mut last_backend_id: Option<String> = None;
    let mut attempts_made: u32 = 0;
    let mut last_outcome: Option<AttemptOutcome> = None;
    let mut last_selection: Option<Selection> = None;
    let mut forced_rotation = false;

    for attempt_index in 0..=policy.max_retries {
        let affinity_pick = if attempt_index == 0 {
            preselected.as_ref().and_then(|sel| {
                let pool = config.pool(&sel.pool_id)?;
                let backend = pool.backends.iter().find(|b| b.id == sel.backend_id)?;
                (backend.enabled && backend.healthy).then(|| sel.clone())
            })
        } else {
            None
        };

        let (pool, selection) = if let Some(sel) = affinity_pick {
            let pool_id = sel.pool_id.clone();
            (
                config
                    .pool_mut(&pool_id)
                    .expect("affinity pool must still exist"),
                sel,
            )
        } else {
            let pool = select_pool_mut(config, ctx).ok_or_else(|| GatewayError::NoHealthyPool {
                service: config.load_balancer.hostname.clone(),
            })?;
            let exclude = if forced_rotation {
                last_backend_id.as_deref()
            } else {
                None
            };
            let selection = load_balancer::select_backend(pool, ctx, exclude).ok_or_else(|| {
                GatewayError::NoHealthyBackend {
                    service: config.load_balancer.hostname.clone(),
                }
            })?;
            (pool, selection)
        };

        let backend = pool
            .backends
            .iter_mut()
            .find(|b| b.id == selection.backend_id)
            .expect("selected backend must exist in its own pool");

        health_manager::tick_circuit(backend);
        let target_url = target_url_template(backend);

        let mut attempt_headers = request.headers.clone();
        let backend_host = reqwest::Url::parse(&backend.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            }));
        let host_value = forwarder::resolve_host_header(
            &host_header_rewrite,
            backend_host.as_deref(),
            &request.original_host,
        );
        if let Ok(value) = reqwest::header::HeaderValue::from_str(host_value) {
            attempt_headers.insert(reqwest::header::HOST, value);
        }

        forwarder::begin_attempt(backend);
        let timeout = Duration::from_millis(policy.retry_timeout_ms);
        let outcome = forwarder::forward_once(
            client,
            reqwest_method.clone(),
            &target_url,
            attempt_headers,
            request.body.clone(),
            timeout,
        )
        .await;
        forwarder::end_attempt(backend);

        attempts_made = attempt_index + 1;
        last_backend_id = Some(backend.id.clone());
        last_selection = Some(selection);

        if outcome.is_success() {
            health_manager::record_success(
                backend,
                outcome.elapsed.as_millis() as f64,
                &config.passive_health_checks,
            );
            last_outcome = Some(outcome);
            break;
        }

        let (class, _message) = outcome.failure.as_ref().unwrap();
        health_manager::record_failure(backend, &config.passive_health_checks);

        let should_force_failover = config.load_balancer.zero_downtime_failover.enabled
            && outcome
                .status
                .map(|s| {
                    config
                        .load_balancer
                        .zero_downtime_failover
                        .trigger_codes
                        .contains(&s)
                })
                .unwrap_or(false);

        let retryable =
            is_retryable_for_request(*class, non_idempotent, &policy, outcome.status) || should_force_failover;
        let attempts_remaining = attempt_index < policy.max_retries;

        if !retryable || !attempts_remaining {
            last_outcome = Some(outcome);
            break;
        }

        forced_rotation = true;
        last_outcome = Some(outcome);

        let delay = backoff_delay(&policy, attempt_index);
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
    }

    let outcome = last_outcome.expect("loop always runs at least once");
    let selection = last_selection.expect("loop always runs at least once");
    Ok(ForwardResult {
        outcome,
        backend_id: selection.backend_id,
        pool_id: selection.pool_id,
        attempts: attempts_made,
    })
}

fn select_pool_mut<'a>(
    config: &'a mut ServiceConfig,
    ctx: &RequestContext,
) -> Option<&'a mut crate::models::backend::Pool> {
    let pool_id = load_balancer::select_pool(config, ctx)?.id.clone();
    config.pool_mut(&pool_id)
}

/// Idempotency-aware retry decision from §4.G: connection errors are
/// never retried for non-idempotent requests (the request may already
/// have been applied upstream); timeouts are retried only if the
/// policy allows it for non-idempotent requests; the 523-family and
/// ordinary retryable 5xx classes are retried for any idempotent
/// method, but for a non-idempotent one only when `status >= 502` —
/// a bare 500 is ambiguous about whether the backend already applied
/// the request, so it is not safe to replay.
fn is_retryable_for_request(
    class: FailureClass,
    non_idempotent: bool,
    policy: &RetryPolicy,
    status: Option<u16>,
) -> bool {
    if !class.is_retryable() {
        return false;
    }
    match class {
        FailureClass::Connection => !non_idempotent,
        FailureClass::Timeout => !non_idempotent || policy.retry_non_idempotent_on_timeout,
        FailureClass::Upstream5xxRetryable | FailureClass::Upstream523Family => {
            !non_idempotent || status.map(|s| s >= 502).unwrap_or(false)
        }
        FailureClass::UpstreamNonRetryable => false,
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt_index: u32) -> Duration {
    let ms = match policy.backoff_strategy {
        BackoffStrategy::Constant => policy.base_delay_ms,
        BackoffStrategy::Exponential => policy.base_delay_ms.saturating_mul(1u64 << attempt_index.min(16)),
    };
    Duration::from_millis(ms.min(policy.retry_timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_not_retried_for_non_idempotent() {
        let policy = RetryPolicy::default();
        assert!(!is_retryable_for_request(FailureClass::Connection, true, &policy, None));
        assert!(is_retryable_for_request(FailureClass::Connection, false, &policy, None));
    }

    #[test]
    fn timeout_retried_for_non_idempotent_when_policy_allows() {
        let mut policy = RetryPolicy::default();
        policy.retry_non_idempotent_on_timeout = true;
        assert!(is_retryable_for_request(FailureClass::Timeout, true, &policy, None));
        policy.retry_non_idempotent_on_timeout = false;
        assert!(!is_retryable_for_request(FailureClass::Timeout, true, &policy, None));
    }

    #[test]
    fn non_retryable_upstream_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!is_retryable_for_request(
            FailureClass::UpstreamNonRetryable,
            false,
            &policy,
            Some(404)
        ));
    }

    #[test]
    fn non_idempotent_5xx_retried_only_above_502_threshold() {
        let policy = RetryPolicy::default();
        assert!(!is_retryable_for_request(
            FailureClass::Upstream5xxRetryable,
            true,
            &policy,
            Some(500)
        ));
        assert!(is_retryable_for_request(
            FailureClass::Upstream5xxRetryable,
            true,
            &policy,
            Some(502)
        ));
        assert!(is_retryable_for_request(
            FailureClass::Upstream5xxRetryable,
            false,
            &policy,
            Some(500)
        ));
    }

    #[test]
    fn exponential_backoff_grows_and_caps_at_retry_timeout() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            backoff_strategy: BackoffStrategy::Exponential,
            retry_timeout_ms: 1000,
            ..RetryPolicy::default()
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 10), Duration::from_millis(1000));
    }
}
