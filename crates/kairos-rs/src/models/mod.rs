//! Data models and domain types for the load balancer core.
//!
//! - [`error`] — the gateway-wide error taxonomy and its HTTP mapping.
//! - [`backend`] — `Backend` and `Pool`, the unit the selector picks.
//! - [`service`] — `ServiceConfig`, the per-hostname unit of ownership.
//! - [`settings`] — process-wide `DEFAULT_BACKENDS` and environment flags.

pub mod backend;
pub mod error;
pub mod service;
pub mod settings;
