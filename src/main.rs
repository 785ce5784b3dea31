use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use chatcore_server::auth::{AuthVerifier, HttpAuthVerifier};
use chatcore_server::bus::MessageBus;
use chatcore_server::config::Config;
use chatcore_server::presence::PresenceStore;
use chatcore_server::replay::ReplayCoordinator;
use chatcore_server::repository::MessageRepository;
use chatcore_server::state::AppState;
use chatcore_server::websocket::Hub;
use chatcore_server::worker::DeliveryWorker;
use chatcore_server::{db, handlers, websocket};

/// Middleware that restricts access to the metrics endpoint to loopback connections only.
///
/// When `ConnectInfo` is not available (e.g. in direct oneshot tests), access is
/// denied, the metrics route is not registered in the test app anyway, so this
/// branch is unreachable in practice.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        Some(_) => StatusCode::NOT_FOUND.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Waits for ctrl-c or SIGTERM, then returns so graceful shutdown can begin.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing, JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "chatcore_server=info,tower_http=info,sqlx=warn"
            .parse()
            .unwrap()
    });

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Chat delivery core starting...");

    let config = Config::from_env().expect("Failed to load configuration");
    info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    info!("Database migrations applied");

    db::health_check(&pool)
        .await
        .expect("Database health check failed");
    info!("Database health check passed");

    let presence = PresenceStore::connect(&config.redis_url, config.presence_ttl.as_secs())
        .await
        .expect("Failed to connect presence store");
    let bus = MessageBus::connect(&config.redis_url)
        .await
        .expect("Failed to connect message bus");
    info!("Presence store and message bus connected");

    let repository = MessageRepository::new(pool.clone());
    let replay = ReplayCoordinator::new(repository.clone(), bus.clone(), config.replay_skew);
    let hub = Hub::new(bus.clone());
    let auth_verifier: Arc<dyn AuthVerifier> =
        Arc::new(HttpAuthVerifier::new(config.auth_verifier_url.clone()));

    let config = Arc::new(config);

    let app_state = AppState {
        pool: pool.clone(),
        presence: presence.clone(),
        bus: bus.clone(),
        hub,
        repository: repository.clone(),
        replay,
        auth_verifier,
        config: config.clone(),
    };

    // The delivery worker runs as its own background task, draining the
    // ingest queue independently of the HTTP/WS listener so graceful
    // shutdown can stop new connections first and let the worker finish
    // in-flight messages before the process exits (spec §5).
    let worker_shutdown = tokio_util::sync::CancellationToken::new();
    let worker = DeliveryWorker::new(
        bus.clone(),
        presence,
        repository,
        format!("worker-{}", std::process::id()),
        config.msg_deadline,
        config.notify_debounce,
    );
    let worker_handle = {
        let shutdown = worker_shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };
    info!("Delivery worker started");

    // CORS: permissive in dev, origin-restricted in production.
    let cors = if config.is_dev {
        info!("CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!(
                "CORS: no ALLOWED_ORIGINS configured, all cross-origin requests will be denied"
            );
        } else {
            info!(
                "CORS: production mode, allowing origins: {:?}",
                config.allowed_origins
            );
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    };

    let addr = config.server_addr();

    // Prometheus metrics layer
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // ── Rate limiting ───────────────────────────────────────────────────
    // Global limit: 10 requests/second per IP, burst of 20.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("Invalid global governor configuration"),
    );

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/send-message", post(handlers::gateway::send_message))
        .route(
            "/api/chat/fetch-undelivered",
            post(handlers::chat::fetch_undelivered),
        )
        .route(
            "/api/chat/conversations-with-undelivered-count",
            get(handlers::chat::conversations_with_undelivered_count),
        )
        // ── Global rate limit (10 req/s per IP, burst 20) ─────────────────
        .layer(GovernorLayer {
            config: governor_conf,
        })
        // ── Security response headers ─────────────────────────────────────
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        // ── Prometheus + CORS ──────────────────────────────────────────────
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(app_state);

    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>` in
    // request extensions, needed by:
    //  - GovernorLayer's PeerIpKeyExtractor (per-IP rate limiting)
    //  - require_loopback middleware on /metrics
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server failed to start");

    // New connections have stopped; let the worker drain in-flight ingest
    // entries before tearing down its infra clients (spec §5).
    info!("Shutting down: stopping delivery worker");
    worker_shutdown.cancel();
    let _ = worker_handle.await;

    pool.close().await;
    info!("Shutdown complete");
}
