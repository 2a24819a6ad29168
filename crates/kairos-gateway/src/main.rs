//! Kairos hostname-sharded HTTP load balancer.
//!
//! High-performance multi-tenant HTTP load balancer built with Rust and
//! Actix Web. This binary loads `DEFAULT_BACKENDS`, validates it, builds
//! one [`ServiceInstance`] per hostname pattern, spawns each service's
//! active-health ticker, and serves the proxy + admin HTTP surface.

use std::sync::Arc;

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, App, HttpServer};
use log::{error, info, warn};
use tokio::signal;

use kairos_rs::config::settings::load_settings;
use kairos_rs::config::validation::ConfigValidator;
use kairos_rs::logs::logger::configure_logger;
use kairos_rs::middleware::security::security_headers;
use kairos_rs::routes::{admin, health, proxy as proxy_routes};
use kairos_rs::services::active_health;
use kairos_rs::services::metrics::MetricsRegistry;
use kairos_rs::services::proxy::{ClientCache, GatewayState};
use kairos_rs::services::service_registry::{seeds_to_service_configs, ServiceRegistry};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger(std::env::var("DEBUG").is_ok());

    let settings = load_settings().unwrap_or_else(|e| {
        error!("failed to load settings: {e}");
        std::process::exit(1);
    });
    info!("loaded {} service seed(s) from DEFAULT_BACKENDS", settings.services.len());

    let services = seeds_to_service_configs(settings.services.clone(), &settings.flags);

    let validation = ConfigValidator::validate_comprehensive(&services);
    if !validation.is_valid {
        for error in &validation.errors {
            error!("config error: {error}");
        }
        std::process::exit(1);
    }
    for warning in &validation.warnings {
        warn!("config warning: {warning}");
    }

    let registry = ServiceRegistry::new(services).unwrap_or_else(|e| {
        error!("failed to build service registry: {e}");
        std::process::exit(1);
    });

    let state = Arc::new(GatewayState {
        registry,
        metrics: Arc::new(MetricsRegistry::new()),
        clients: ClientCache::default(),
    });

    for identity in state.registry.all_identities().await {
        if let Some(instance) = state.registry.instance_by_identity(&identity).await {
            let ssl = {
                let guard = instance.lock().await;
                guard.config.ssl.clone()
            };
            let client = state
                .clients
                .get_or_build(&ssl)
                .await
                .expect("building the active-health client must not fail at startup");
            active_health::spawn_ticker(instance, client);
        }
    }

    let governor_conf = GovernorConfigBuilder::default()
        .per_second(100)
        .burst_size(200)
        .finish()
        .expect("static governor configuration is always valid");

    let host = std::env::var("KAIROS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("KAIROS_PORT")
        .unwrap_or_else(|_| "5900".to_string())
        .parse::<u16>()
        .unwrap_or(5900);

    info!("starting kairos gateway on {host}:{port}");

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(actix_web::web::Data::from(app_state.clone()))
            .wrap(Governor::new(&governor_conf))
            .wrap(Logger::new(
                r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T"#,
            ))
            .wrap(actix_web::middleware::Compress::default())
            .wrap(security_headers())
            .configure(health::configure_health)
            .configure(admin::configure_admin)
            .configure(proxy_routes::configure_proxy)
    })
    .bind((host.as_str(), port))?
    .run();

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped gracefully"),
                Err(e) => error!("server error: {e}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, stopping server...");
        }
    }

    Ok(())
}
