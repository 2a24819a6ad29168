//! Core of a multi-tenant, hostname-sharded HTTP load balancer.
//!
//! One [`services::service_instance::ServiceInstance`] owns the mutable
//! state for a single hostname pattern; the
//! [`services::service_registry::ServiceRegistry`] resolves an inbound
//! `Host` header to that instance and serialises all of its mutations.
//! From there, selection ([`services::load_balancer`]), health
//! ([`services::health_manager`], [`services::active_health`]),
//! forwarding ([`services::forwarder`]) and retry/failover
//! ([`services::retry`]) compose into the single request pipeline in
//! [`services::proxy`].

pub mod config;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
