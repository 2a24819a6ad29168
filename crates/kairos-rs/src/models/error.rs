//! Gateway-wide error taxonomy and its HTTP response mapping.
//!
//! Every fallible path in the load balancer core — hostname resolution,
//! backend selection, forwarding, and the admin plane — resolves to one
//! variant of [`GatewayError`]. The [`actix_web::error::ResponseError`]
//! impl is the single place that turns a classified failure into the
//! JSON body and status code a client actually sees.

use actix_web::HttpResponse;
use actix_web::http::header::{HeaderName, HeaderValue};
use serde_json::json;

/// Classified failure kinds from the retry/failover pipeline (see the
/// error taxonomy table). Attached to [`GatewayError::Upstream`] so the
/// retry controller can apply idempotency rules without re-deriving the
/// class from the status code a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Connection,
    Timeout,
    Upstream5xxRetryable,
    Upstream523Family,
    UpstreamNonRetryable,
}

impl FailureClass {
    /// The value written to the `X-Fallback-Reason` response header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            FailureClass::Connection => "connection",
            FailureClass::Timeout => "timeout",
            FailureClass::Upstream5xxRetryable => "upstream_5xx_retryable",
            FailureClass::Upstream523Family => "upstream_523_family",
            FailureClass::UpstreamNonRetryable => "upstream_non_retryable",
        }
    }

    /// Whether this class is retryable at all, ignoring method idempotency.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::UpstreamNonRetryable)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no service matches hostname {hostname}")]
    NoMatchingService { hostname: String },

    #[error("service {service} has no healthy pool")]
    NoHealthyPool { service: String },

    #[error("service {service} has no healthy backend")]
    NoHealthyBackend { service: String },

    #[error("upstream request failed: {message}")]
    Upstream {
        message: String,
        class: FailureClass,
        status: Option<u16>,
    },

    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("admin request rejected: {message}")]
    AdminBadRequest { message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::NoMatchingService { .. } => "no_matching_service",
            GatewayError::NoHealthyPool { .. } => "no_healthy_pool",
            GatewayError::NoHealthyBackend { .. } => "no_healthy_backend",
            GatewayError::Upstream { class, .. } => class.as_header_value(),
            GatewayError::ConfigInvalid { .. } => "config_invalid",
            GatewayError::AdminBadRequest { .. } => "admin_bad_request",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// `X-Fallback-Reason` value for a failed forward/retry cycle, if any.
    pub fn fallback_reason(&self) -> Option<&'static str> {
        match self {
            GatewayError::Upstream { class, .. } => Some(class.as_header_value()),
            GatewayError::NoHealthyPool { .. } | GatewayError::NoHealthyBackend { .. } => {
                Some("no_healthy_backend")
            }
            _ => None,
        }
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        let error_message = self.to_string();
        let body = json!({
            "error": error_message,
            "type": self.error_type(),
        });

        let mut builder = match self {
            GatewayError::NoMatchingService { .. } => HttpResponse::NotFound(),
            GatewayError::NoHealthyPool { .. } | GatewayError::NoHealthyBackend { .. } => {
                HttpResponse::ServiceUnavailable()
            }
            GatewayError::Upstream { status, .. } => match status {
                Some(code) if *code >= 400 => {
                    HttpResponse::build(
                        actix_web::http::StatusCode::from_u16(*code)
                            .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY),
                    )
                }
                _ => HttpResponse::ServiceUnavailable(),
            },
            GatewayError::ConfigInvalid { .. } => HttpResponse::ServiceUnavailable(),
            GatewayError::AdminBadRequest { .. } => HttpResponse::BadRequest(),
            GatewayError::Internal(_) => HttpResponse::InternalServerError(),
        };

        let mut response = builder.json(body);
        if let Some(reason) = self.fallback_reason() {
            if let Ok(value) = HeaderValue::from_str(reason) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-fallback-reason"), value);
            }
        }
        response
    }
}
