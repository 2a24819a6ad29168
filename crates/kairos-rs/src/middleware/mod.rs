//! Cross-cutting HTTP middleware. Authentication/authorisation, CSRF
//! and session handling are explicitly out of scope for the core (§1):
//! the core consumes a boolean *authorised* decision from an external
//! gateway. What remains here is the ambient response-header hardening
//! every route (proxied or admin) gets for free.

pub mod security;
