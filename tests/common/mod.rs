// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chatcore_server::auth::{AuthVerifier, StaticAuthVerifier};
use chatcore_server::bus::MessageBus;
use chatcore_server::config::Config;
use chatcore_server::handlers;
use chatcore_server::presence::PresenceStore;
use chatcore_server::replay::ReplayCoordinator;
use chatcore_server::repository::MessageRepository;
use chatcore_server::state::AppState;
use chatcore_server::websocket::{websocket_handler, Hub};
use chatcore_server::worker::DeliveryWorker;

pub fn test_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

/// Connect to the test database specified by `DATABASE_URL`, `None` if it
/// isn't set, the same gating convention `repository`/`worker`/`replay`'s own
/// unit tests use.
pub async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    PgPool::connect(&url).await.ok()
}

fn test_config() -> Config {
    Config {
        database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
        redis_url: test_redis_url(),
        auth_verifier_url: "http://127.0.0.1:9000/verify".to_string(),
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        is_dev: true,
        allowed_origins: Vec::new(),
        presence_ttl: Duration::from_secs(5),
        presence_refresh_interval: Duration::from_secs(2),
        auth_deadline: Duration::from_secs(2),
        dead_after: Duration::from_secs(3),
        msg_deadline: Duration::from_secs(5),
        replay_skew: Duration::from_millis(200),
        notify_debounce: Duration::from_secs(60),
    }
}

/// Every collaborator the test harness wires up, handed back alongside the
/// router so tests can drive the delivery worker and presence/bus directly
/// instead of only through HTTP.
pub struct TestApp {
    pub router: Router,
    pub pool: PgPool,
    pub presence: PresenceStore,
    pub bus: MessageBus,
    pub repository: MessageRepository,
    pub config: Arc<Config>,
}

/// Build the full application router wired to a real Postgres/Redis backend
/// and a deterministic `StaticAuthVerifier` seeded with exactly the
/// `(user_id, token)` pairs the caller passes in. Returns `None` if Redis is
/// unavailable, the same gating convention the rest of the integration
/// suite uses for infra dependencies.
///
/// Each test mints its own unique user ids rather than sharing a fixed pair,
/// so concurrently-running tests never observe each other's fan-out
/// traffic on the same `user_id` channel.
pub async fn create_test_app(
    pool: PgPool,
    verifier_pairs: impl IntoIterator<Item = (String, String)>,
) -> Option<TestApp> {
    let redis_url = test_redis_url();
    let config = test_config();

    let presence = PresenceStore::connect(&redis_url, config.presence_ttl.as_secs())
        .await
        .ok()?;
    let bus = MessageBus::connect(&redis_url).await.ok()?;
    let repository = MessageRepository::new(pool.clone());
    let replay = ReplayCoordinator::new(repository.clone(), bus.clone(), config.replay_skew);
    let hub = Hub::new(bus.clone());
    let auth_verifier: Arc<dyn AuthVerifier> = Arc::new(StaticAuthVerifier::new(verifier_pairs));
    let config = Arc::new(config);

    let state = AppState {
        pool: pool.clone(),
        presence: presence.clone(),
        bus: bus.clone(),
        hub,
        repository: repository.clone(),
        replay,
        auth_verifier,
        config: config.clone(),
    };

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(websocket_handler))
        .route("/api/send-message", post(handlers::gateway::send_message))
        .route(
            "/api/chat/fetch-undelivered",
            post(handlers::chat::fetch_undelivered),
        )
        .route(
            "/api/chat/conversations-with-undelivered-count",
            get(handlers::chat::conversations_with_undelivered_count),
        )
        .with_state(state);

    Some(TestApp {
        router,
        pool,
        presence,
        bus,
        repository,
        config,
    })
}

/// Bind `app.router` to an ephemeral loopback port and serve it in the
/// background. Returns the bound address and a handle the test can abort
/// when it's done; there's no graceful-shutdown path here because tests
/// never need to observe drain behavior, only `main.rs`'s does.
pub async fn spawn_server(router: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind ephemeral test listener");
    let addr = listener.local_addr().expect("listener has a local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .expect("test server failed");
    });
    (addr, handle)
}

/// Run a `DeliveryWorker` against the same backend a `TestApp` was built
/// from, in the background, until the returned token is cancelled.
pub fn spawn_worker(app: &TestApp, consumer_name: &str) -> (CancellationToken, JoinHandle<()>) {
    let worker = DeliveryWorker::new(
        app.bus.clone(),
        app.presence.clone(),
        app.repository.clone(),
        consumer_name.to_string(),
        app.config.msg_deadline,
        app.config.notify_debounce,
    );
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };
    (shutdown, handle)
}

pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/ws")
}

pub fn http_url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

/// A fresh `(user_id, token)` pair, unique per call, so tests running
/// concurrently against the same Postgres/Redis instance never share a
/// `user_id` and never observe each other's presence or fan-out traffic.
pub fn unique_identity(label: &str) -> (String, String) {
    let id = uuid::Uuid::new_v4();
    (format!("{label}-{id}"), format!("token-{id}"))
}
