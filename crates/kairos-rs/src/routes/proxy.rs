//! The catch-all proxy route: every request that isn't `/health`,
//! `/ready`, `/live` or under `/__lb_admin__/` lands here, keyed purely
//! on its `Host` header (§2, §4.A).

use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse, Result};

use crate::models::error::GatewayError;
use crate::services::proxy::{self, GatewayState};

pub async fn handle(
    state: web::Data<GatewayState>,
    req: HttpRequest,
    body: Bytes,
) -> Result<HttpResponse, GatewayError> {
    let hostname = req
        .connection_info()
        .host()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string();

    let response = proxy::handle(&state, &hostname, &req, body).await?;

    let mut builder = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(response.status)
            .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY),
    );
    for (name, value) in &response.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    Ok(builder.body(response.body))
}

pub fn configure_proxy(cfg: &mut web::ServiceConfig) {
    cfg.default_service(web::route().to(handle));
}
