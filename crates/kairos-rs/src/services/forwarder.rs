//! Builds and issues one forwarding attempt against a chosen backend.
//!
//! Header conversion and method mapping are adapted from the
//! path-router's HTTP handler: skip hop-by-hop headers, regenerate the
//! client-facing `User-Agent` default, and convert method/header types
//! between actix-web's request side and reqwest's client side.

use std::time::{Duration, Instant};

use actix_web::http::{header::HeaderMap as ActixHeaderMap, Method as ActixMethod};
use actix_web::web::Bytes;
use reqwest::{
    header::{HeaderMap as ReqwestHeaderMap, HeaderName, HeaderValue},
    Client, Method as ReqwestMethod,
};

use crate::models::backend::Backend;
use crate::models::error::FailureClass;
use crate::models::service::{HostHeaderRewrite, SslOptions};

const SKIP_REQUEST_HEADERS: &[&str] = &["host", "connection", "upgrade", "proxy-connection"];

/// One forwarding attempt's outcome: either a response actix-web can
/// relay directly, or a classified failure the retry controller uses
/// to decide whether to try again.
pub struct AttemptOutcome {
    pub status: Option<u16>,
    pub headers: Option<ReqwestHeaderMap>,
    pub body: Option<Bytes>,
    pub elapsed: Duration,
    pub failure: Option<(FailureClass, String)>,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Builds one `reqwest::Client` per distinct SSL policy, since
/// certificate verification is a client-construction-time setting in
/// reqwest, not a per-request one. Services sharing the same
/// [`SslOptions`] can share a client; callers key their cache on the
/// options' `Debug` output or an equivalent hash.
pub fn build_client(ssl: &SslOptions) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(32);

    if ssl.skip_certificate_verification || ssl.allow_self_signed_certificates {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if ssl.skip_hostname_verification {
        builder = builder.danger_accept_invalid_hostnames(true);
    }

    builder.build()
}

/// Resolves the `Host` header to send upstream per the service's
/// rewrite mode.
pub fn resolve_host_header<'a>(
    rewrite: &'a HostHeaderRewrite,
    backend_host: Option<&'a str>,
    original_host: &'a str,
) -> &'a str {
    match rewrite {
        HostHeaderRewrite::Preserve => original_host,
        HostHeaderRewrite::BackendHostname => backend_host.unwrap_or(original_host),
        HostHeaderRewrite::Literal { value } => value.as_str(),
    }
}

pub fn convert_method(method: &ActixMethod) -> ReqwestMethod {
    match *method {
        ActixMethod::GET => ReqwestMethod::GET,
        ActixMethod::POST => ReqwestMethod::POST,
        ActixMethod::PUT => ReqwestMethod::PUT,
        ActixMethod::DELETE => ReqwestMethod::DELETE,
        ActixMethod::HEAD => ReqwestMethod::HEAD,
        ActixMethod::OPTIONS => ReqwestMethod::OPTIONS,
        ActixMethod::CONNECT => ReqwestMethod::CONNECT,
        ActixMethod::PATCH => ReqwestMethod::PATCH,
        ActixMethod::TRACE => ReqwestMethod::TRACE,
        _ => ReqwestMethod::GET,
    }
}

/// A request is idempotency-sensitive for retry purposes iff its
/// method is POST, PUT or PATCH (§4.G idempotency policy).
pub fn is_non_idempotent(method: &ActixMethod) -> bool {
    matches!(*method, ActixMethod::POST | ActixMethod::PUT | ActixMethod::PATCH)
}

pub fn convert_headers(original: &ActixHeaderMap) -> ReqwestHeaderMap {
    let mut headers = ReqwestHeaderMap::with_capacity(original.len());
    for (key, value) in original {
        let key_str = key.as_str().to_ascii_lowercase();
        if SKIP_REQUEST_HEADERS.iter().any(|skip| key_str.starts_with(skip)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_ref()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    headers
        .entry(reqwest::header::USER_AGENT)
        .or_insert_with(|| HeaderValue::from_static("kairos-lb/1.0"));
    headers
}

/// Issues one attempt against `backend` and classifies the result.
/// Never retries internally — the retry controller owns the retry
/// loop; this function always returns after exactly one HTTP attempt
/// (or the failure to make one).
pub async fn forward_once(
    client: &Client,
    method: ReqwestMethod,
    target_url: &str,
    headers: ReqwestHeaderMap,
    body: Bytes,
    timeout: Duration,
) -> AttemptOutcome {
    let started = Instant::now();
    let request = client
        .request(method, target_url)
        .headers(headers)
        .body(body)
        .timeout(timeout);

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let elapsed = started.elapsed();
            let response_headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();
            if (200..400).contains(&status) {
                AttemptOutcome {
                    status: Some(status),
                    headers: Some(response_headers),
                    body: Some(body),
                    elapsed,
                    failure: None,
                }
            } else {
                // Captured regardless of class so a non-retryable 4xx can
                // still be relayed to the client verbatim (§4.F point 6)
                // even though it is recorded as a failure.
                let class = classify_status(status);
                AttemptOutcome {
                    status: Some(status),
                    headers: Some(response_headers),
                    body: Some(body),
                    elapsed,
                    failure: Some((class, format!("upstream returned {status}"))),
                }
            }
        }
        Err(err) => {
            let elapsed = started.elapsed();
            let (class, message) = if err.is_timeout() {
                (FailureClass::Timeout, "request timed out".to_string())
            } else if err.is_connect() {
                (FailureClass::Connection, err.to_string())
            } else {
                // Any other transport-level failure (body streaming errors,
                // connection reset mid-response, etc.) is treated the same
                // as a failed connection: both are retryable by class.
                (FailureClass::Connection, err.to_string())
            };
            AttemptOutcome {
                status: None,
                headers: None,
                body: None,
                elapsed,
                failure: Some((class, message)),
            }
        }
    }
}

/// Classifies a status outside `[200,400)` into a failure class: the
/// 521/522/523/525/526 "origin unreachable" family gets its own class
/// since zero-downtime failover forces an immediate pool switch on
/// these codes, distinct from an ordinary retryable 5xx; any other
/// 4xx/5xx is non-retryable and forwarded to the client verbatim.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        521 | 522 | 523 | 525 | 526 => FailureClass::Upstream523Family,
        500 | 502 | 503 | 504 => FailureClass::Upstream5xxRetryable,
        _ => FailureClass::UpstreamNonRetryable,
    }
}

/// Mutates `backend`'s in-flight counters around one attempt. The
/// caller is expected to call `begin`/`end` even when the attempt
/// itself is handled elsewhere, so `outstanding_requests` stays
/// accurate for the least-outstanding-requests steering policies.
pub fn begin_attempt(backend: &mut Backend) {
    backend.outstanding_requests = backend.outstanding_requests.saturating_add(1);
    backend.connections_active = backend.connections_active.saturating_add(1);
}

pub fn end_attempt(backend: &mut Backend) {
    backend.outstanding_requests = backend.outstanding_requests.saturating_sub(1);
    backend.connections_active = backend.connections_active.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_523_family_distinctly_from_ordinary_5xx() {
        assert_eq!(classify_status(523), FailureClass::Upstream523Family);
        assert_eq!(classify_status(502), FailureClass::Upstream5xxRetryable);
    }

    #[test]
    fn post_put_patch_are_non_idempotent() {
        assert!(is_non_idempotent(&ActixMethod::POST));
        assert!(is_non_idempotent(&ActixMethod::PUT));
        assert!(is_non_idempotent(&ActixMethod::PATCH));
        assert!(!is_non_idempotent(&ActixMethod::GET));
    }

    #[test]
    fn host_rewrite_literal_overrides_original() {
        let rewrite = HostHeaderRewrite::Literal { value: "override.example".to_string() };
        let result = resolve_host_header(&rewrite, Some("backend.origin"), "client.example");
        assert_eq!(result, "override.example");
    }

    #[test]
    fn host_rewrite_backend_hostname_falls_back_when_unparsed() {
        let result = resolve_host_header(&HostHeaderRewrite::BackendHostname, None, "client.example");
        assert_eq!(result, "client.example");
    }

    #[test]
    fn begin_and_end_attempt_keep_counters_balanced() {
        let mut backend = Backend::new("a", "https://a");
        begin_attempt(&mut backend);
        assert_eq!(backend.outstanding_requests, 1);
        end_attempt(&mut backend);
        assert_eq!(backend.outstanding_requests, 0);
    }
}
