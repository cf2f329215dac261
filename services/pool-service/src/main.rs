//! Account Pool Service
//!
//! Single-binary Rust service that:
//! 1. Loads the account store and keeps every account's session fresh
//! 2. Hands out exclusive, per-capability account leases over HTTP
//! 3. Reclaims timed-out leases and replenishes the pool by registering
//!    new accounts when it runs low

mod admin;
mod auth;
mod config;
mod error;
mod leases;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::{
    Dispatcher, HealthStatus, RegistrationOrchestrator, Scheduler, SessionValidator,
    refresh_channel, spawn_lease_reaper, spawn_registration_task, spawn_validator,
};
use account_store::AccountStore;
use anyhow::{Context, Result};
use automation::HttpAutomation;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::auth::{ApiKeys, require_api_key};
use crate::config::Config;
use crate::leases::{LeaseState, build_lease_router};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State for the health and metrics handlers
#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes.
///
/// `max_connections` caps concurrent requests across every route. Lease and
/// admin routes require an API key when `api_keys` is non-empty; `/health`
/// and `/metrics` stay open for health checks and scrapers.
fn build_router(
    state: AppState,
    leases: LeaseState,
    admin: AdminState,
    api_keys: ApiKeys,
    max_connections: usize,
) -> Router {
    let protected = build_lease_router(leases)
        .merge(build_admin_router(admin))
        .layer(axum::middleware::from_fn_with_state(
            api_keys,
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(protected)
        .layer(axum::middleware::from_fn(track_request))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting account-pool-service");

    // Install before the pool emits its first counter
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store_path = %config.store.path.display(),
        automation_url = %config.automation.base_url,
        registration_enabled = config.registration.enabled,
        api_key_required = !config.server.api_keys.is_empty(),
        "configuration loaded"
    );

    let store = Arc::new(
        AccountStore::load(config.store.path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to load account store from {}",
                    config.store.path.display()
                )
            })?,
    );
    info!(accounts = store.len().await, "account store loaded");

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let mut automation = HttpAutomation::new(
        http_client,
        config.automation.base_url.clone(),
        Duration::from_secs(config.automation.timeout_secs),
    );
    if let Some(api_key) = config.automation.api_key.clone() {
        automation = automation.with_api_key(api_key);
    }
    let automation = Arc::new(automation);

    let (refresh_queue, refresh_rx) = refresh_channel(config.validator.queue_capacity);
    let replenish = Arc::new(Notify::new());

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        config.scheduler_config(),
        refresh_queue,
        replenish.clone(),
    ));
    let validator = Arc::new(SessionValidator::new(
        store.clone(),
        automation.clone(),
        config.validator_config(),
    ));
    let orchestrator = Arc::new(RegistrationOrchestrator::new(
        store.clone(),
        automation.clone(),
        automation.clone(),
        validator.clone(),
        config.registration_config(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        scheduler.clone(),
        automation,
        config.pool.max_switch_tries,
    ));

    let mut background = vec![
        spawn_validator(
            validator,
            refresh_rx,
            Duration::from_secs(config.validator.sweep_interval_secs),
        ),
        spawn_lease_reaper(
            scheduler.clone(),
            Duration::from_secs(config.pool.reaper_interval_secs),
        ),
    ];
    if config.registration.enabled {
        background.push(spawn_registration_task(
            orchestrator.clone(),
            replenish,
            Duration::from_secs(config.registration.check_interval_secs),
        ));
    } else {
        info!("automatic registration disabled");
    }

    let app = build_router(
        AppState {
            scheduler: scheduler.clone(),
            prometheus: prometheus_handle,
            started_at: Instant::now(),
        },
        LeaseState::new(scheduler.clone(), dispatcher),
        AdminState::new(scheduler, orchestrator),
        ApiKeys::new(config.server.api_keys.clone()),
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    for task in background {
        task.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health. 200 while any account can serve chat, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.scheduler.pool_status().await;
    let code = match status.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    let mut body = serde_json::json!(status);
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();

    (code, [(CONTENT_TYPE, "application/json")], body.to_string())
}

/// Prometheus text exposition. Account gauges are refreshed per scrape.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::publish_pool_gauges(&state.scheduler.pool_status().await);
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Count every request by method and status.
async fn track_request(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::record_request(
        response.status().as_u16(),
        &method,
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{RegistrationConfig, SchedulerConfig, ValidatorConfig};
    use account_store::{Account, AccountStatus};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn active(id: &str) -> Account {
        let mut account = Account::new(format!("{id}@example.com"), "cred");
        account.id = id.to_string();
        account.status = AccountStatus::Active;
        account.session = Some(format!("sess-{id}"));
        account
    }

    /// Router over an in-memory store. The automation backend is unreachable.
    async fn test_router(accounts: Vec<Account>, prometheus: PrometheusHandle) -> Router {
        test_router_with_keys(accounts, prometheus, ApiKeys::default()).await
    }

    async fn test_router_with_keys(
        accounts: Vec<Account>,
        prometheus: PrometheusHandle,
        api_keys: ApiKeys,
    ) -> Router {
        let store = Arc::new(AccountStore::in_memory());
        for account in accounts {
            store.upsert(account).await.unwrap();
        }
        let (queue, _rx) = refresh_channel(16);
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            SchedulerConfig::default(),
            queue,
            Arc::new(Notify::new()),
        ));
        let automation = Arc::new(HttpAutomation::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Duration::from_secs(1),
        ));
        let validator = Arc::new(SessionValidator::new(
            store.clone(),
            automation.clone(),
            ValidatorConfig::default(),
        ));
        let orchestrator = Arc::new(RegistrationOrchestrator::new(
            store,
            automation.clone(),
            automation.clone(),
            validator,
            RegistrationConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(scheduler.clone(), automation, 3));

        build_router(
            AppState {
                scheduler: scheduler.clone(),
                prometheus,
                started_at: Instant::now(),
            },
            LeaseState::new(scheduler.clone(), dispatcher),
            AdminState::new(scheduler, orchestrator),
            api_keys,
            1000,
        )
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok_with_available_accounts() {
        let (_recorder, handle) = metrics::isolated_recorder();
        let app = test_router(vec![active("a"), active("b")], handle).await;

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["total"], 2);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_is_503_when_no_account_can_serve() {
        let (_recorder, handle) = metrics::isolated_recorder();
        let mut expired = active("a");
        expired.status = AccountStatus::AuthExpired;
        expired.session = None;
        let app = test_router(vec![expired], handle).await;

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["auth_expired"], 1);
    }

    #[tokio::test]
    async fn empty_pool_is_unhealthy() {
        let (_recorder, handle) = metrics::isolated_recorder();
        let app = test_router(vec![], handle).await;

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_publishes_pool_gauges() {
        let (recorder, handle) = metrics::isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);
        let app = test_router(vec![active("a")], handle).await;

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("text/plain"));

        let body = body_string(response).await;
        assert!(
            body.contains("pool_accounts{status=\"active\"} 1"),
            "gauges must be published on scrape, got:\n{body}"
        );
    }

    #[tokio::test]
    async fn requests_are_counted_by_status() {
        let (recorder, handle) = metrics::isolated_recorder();
        let _guard = ::metrics::set_default_local_recorder(&recorder);
        let app = test_router(vec![], handle.clone()).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/leases")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"capability":"chat"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let output = handle.render();
        assert!(output.contains("pool_api_requests_total"), "got:\n{output}");
        assert!(output.contains("status=\"503\""));
        assert!(output.contains("method=\"POST\""));
        assert!(output.contains("pool_acquire_total"));
    }

    #[tokio::test]
    async fn routes_from_every_router_are_mounted() {
        let (_recorder, handle) = metrics::isolated_recorder();
        let app = test_router(vec![active("a")], handle).await;

        let admin = app
            .clone()
            .oneshot(get_request("/admin/pool"))
            .await
            .unwrap();
        assert_eq!(admin.status(), StatusCode::OK);

        let unknown = app.oneshot(get_request("/nope")).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_key_guards_lease_and_admin_routes() {
        let (_recorder, handle) = metrics::isolated_recorder();
        let keys = ApiKeys::new(auth::parse_key_list("pool-key"));
        let app = test_router_with_keys(vec![active("a")], handle, keys).await;

        let health = app.clone().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let scrape = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(scrape.status(), StatusCode::OK);

        let anonymous = app
            .clone()
            .oneshot(get_request("/admin/pool"))
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let lease = |auth: &str| {
            Request::builder()
                .method("POST")
                .uri("/leases")
                .header("content-type", "application/json")
                .header("authorization", auth)
                .body(Body::from(r#"{"capability":"chat"}"#))
                .unwrap()
        };
        let rejected = app.clone().oneshot(lease("Bearer wrong")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
        let accepted = app.clone().oneshot(lease("Bearer pool-key")).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);

        let admin = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pool")
                    .header("authorization", "Bearer pool-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(admin.status(), StatusCode::OK);
    }
}
