//! Baseline security headers applied to every response, proxied or
//! admin. Kept as a plain [`actix_web::middleware::DefaultHeaders`]
//! wrap rather than a bespoke `Transform`, since the policy never
//! varies per request.

use actix_web::middleware::DefaultHeaders;

pub fn security_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "no-referrer"))
}
