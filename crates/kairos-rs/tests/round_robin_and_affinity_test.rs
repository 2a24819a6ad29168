use std::sync::Arc;

use actix_web::{test, web, App};

use kairos_rs::models::backend::{Backend, Pool};
use kairos_rs::models::service::{AffinityType, LoadBalancer, ServiceConfig, SessionAffinity};
use kairos_rs::routes::proxy as proxy_routes;
use kairos_rs::services::metrics::MetricsRegistry;
use kairos_rs::services::proxy::{ClientCache, GatewayState};
use kairos_rs::services::service_registry::ServiceRegistry;

fn base_config(hostname: &str, backends: Vec<Backend>) -> ServiceConfig {
    ServiceConfig {
        pools: vec![Pool {
            id: "default".to_string(),
            minimum_origins: 1,
            endpoint_steering: Default::default(),
            geo: None,
            enabled: true,
            backends,
            current_round_robin_index: 0,
        }],
        load_balancer: LoadBalancer {
            hostname: hostname.to_string(),
            default_pool_ids: vec!["default".to_string()],
            fallback_pool_id: None,
            traffic_steering: Default::default(),
            session_affinity: None,
            zero_downtime_failover: Default::default(),
            region_pools: Default::default(),
            country_pools: Default::default(),
            dns_failover_state: Default::default(),
            failover_pool_ids: vec![],
            recovery_threshold: 3,
            consecutive_healthy_probes: 0,
        },
        passive_health_checks: Default::default(),
        active_health_checks: Default::default(),
        retry_policy: Default::default(),
        host_header_rewrite: Default::default(),
        observability: Default::default(),
        ssl: Default::default(),
    }
}

fn build_state(configs: Vec<(String, ServiceConfig)>) -> Arc<GatewayState> {
    let registry = ServiceRegistry::new(configs).unwrap();
    Arc::new(GatewayState {
        registry,
        metrics: Arc::new(MetricsRegistry::new()),
        clients: ClientCache::default(),
    })
}

/// Two equal-weight backends, a real origin for each, round-robin
/// endpoint steering: alternating requests must alternate backends.
#[actix_web::test]
async fn round_robin_alternates_between_equal_weight_backends() {
    let origin_a = test::start(|| {
        actix_web::App::new().route(
            "/",
            web::get().to(|| async { actix_web::HttpResponse::Ok().body("a") }),
        )
    });
    let origin_b = test::start(|| {
        actix_web::App::new().route(
            "/",
            web::get().to(|| async { actix_web::HttpResponse::Ok().body("b") }),
        )
    });

    let backends = vec![
        Backend::new("a", format!("http://{}", origin_a.addr())),
        Backend::new("b", format!("http://{}", origin_b.addr())),
    ];
    let config = base_config("rr.example.com", backends);
    let state = build_state(vec![("rr.example.com".to_string(), config)]);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(proxy_routes::configure_proxy),
    )
    .await;

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("Host", "rr.example.com"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body = test::read_body(resp).await;
        bodies.push(String::from_utf8_lossy(&body).to_string());
    }

    assert_eq!(bodies, vec!["a", "b", "a", "b"]);
}

/// A wildcard pattern resolves every matching hostname to the same
/// service identity, so the round-robin state they share keeps
/// alternating across hostnames rather than resetting per-hostname.
#[actix_web::test]
async fn wildcard_pattern_shares_round_robin_state_across_hostnames() {
    let origin_a = test::start(|| {
        actix_web::App::new().route(
            "/",
            web::get().to(|| async { actix_web::HttpResponse::Ok().body("a") }),
        )
    });
    let origin_b = test::start(|| {
        actix_web::App::new().route(
            "/",
            web::get().to(|| async { actix_web::HttpResponse::Ok().body("b") }),
        )
    });

    let backends = vec![
        Backend::new("a", format!("http://{}", origin_a.addr())),
        Backend::new("b", format!("http://{}", origin_b.addr())),
    ];
    let config = base_config("*.example.com", backends);
    let state = build_state(vec![("*.example.com".to_string(), config)]);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(proxy_routes::configure_proxy),
    )
    .await;

    let hostnames = ["tenant1.example.com", "tenant2.example.com", "tenant3.example.com"];
    let mut bodies = Vec::new();
    for host in hostnames {
        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("Host", host))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body = test::read_body(resp).await;
        bodies.push(String::from_utf8_lossy(&body).to_string());
    }

    assert_eq!(bodies, vec!["a", "b", "a"]);
}

/// Cookie session affinity sticks every subsequent request carrying the
/// minted cookie to the same backend, even though round robin would
/// otherwise alternate.
#[actix_web::test]
async fn cookie_affinity_keeps_requests_on_the_same_backend() {
    let origin_a = test::start(|| {
        actix_web::App::new().route(
            "/",
            web::get().to(|| async { actix_web::HttpResponse::Ok().body("a") }),
        )
    });
    let origin_b = test::start(|| {
        actix_web::App::new().route(
            "/",
            web::get().to(|| async { actix_web::HttpResponse::Ok().body("b") }),
        )
    });

    let backends = vec![
        Backend::new("a", format!("http://{}", origin_a.addr())),
        Backend::new("b", format!("http://{}", origin_b.addr())),
    ];
    let mut config = base_config("sticky.example.com", backends);
    config.load_balancer.session_affinity = Some(SessionAffinity {
        affinity_type: AffinityType::Cookie,
        name: "lb_session".to_string(),
        ttl_ms: 60_000,
        update_on_revival: false,
    });
    let state = build_state(vec![("sticky.example.com".to_string(), config)]);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(state))
            .configure(proxy_routes::configure_proxy),
    )
    .await;

    let first_req = test::TestRequest::get()
        .uri("/")
        .insert_header(("Host", "sticky.example.com"))
        .to_request();
    let first_resp = test::call_service(&app, first_req).await;
    assert_eq!(first_resp.status(), 200);
    let set_cookie = first_resp
        .headers()
        .get("set-cookie")
        .expect("affinity cookie must be minted on the first response")
        .to_str()
        .unwrap()
        .to_string();
    let cookie = set_cookie
        .split(';')
        .next()
        .unwrap()
        .trim_start_matches("lb_session=")
        .to_string();
    let first_body = test::read_body(first_resp).await;
    let first_backend = String::from_utf8_lossy(&first_body).to_string();

    for _ in 0..3 {
        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("Host", "sticky.example.com"))
            .cookie(actix_web::cookie::Cookie::new("lb_session", cookie.clone()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body = test::read_body(resp).await;
        assert_eq!(String::from_utf8_lossy(&body), first_backend);
    }
}
