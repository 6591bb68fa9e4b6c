//! ClickUp MCP Gateway
//!
//! Single-binary Rust service that:
//! 1. Runs the OAuth authorization code flow against ClickUp and stores the tokens
//! 2. Authenticates callers with a gateway API key
//! 3. Forwards their requests to the ClickUp MCP endpoint with the stored bearer token
//! 4. Refreshes the token once on upstream 401 and retries, deduplicated across instances

mod config;
mod cors;
mod error;
mod metrics;
mod oauth;
mod pages;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use clickup_auth::{AuthorizationFlowManager, FileBackend, TokenStore};
use metrics_exporter_prometheus::PrometheusHandle;
use token_refresh::{RefreshCoordinator, RefreshSettings};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::oauth::{OAuthState, PendingFlows};
use crate::proxy::GatewayState;

/// How long in-flight requests may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    oauth: OAuthState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

impl FromRef<AppState> for GatewayState {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

impl FromRef<AppState> for OAuthState {
    fn from_ref(state: &AppState) -> Self {
        state.oauth.clone()
    }
}

/// Build the axum router with all routes and shared state.
///
/// The bootstrap and observability routes only answer GET; any other method
/// on those paths is proxied like every unmatched route. CORS wraps
/// everything, so preflight never reaches the API key check.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(oauth::home).fallback(proxy_handler))
        .route("/oauth/start", get(oauth::start).fallback(proxy_handler))
        .route("/oauth/callback", get(oauth::callback).fallback(proxy_handler))
        .route("/health", get(health_handler).fallback(proxy_handler))
        .route("/metrics", get(metrics_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .layer(axum::middleware::from_fn(cors::cors))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting clickup-mcp-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        mcp_url = %config.upstream.mcp_url,
        store = %config.store.path.display(),
        pkce = config.oauth.use_pkce,
        oauth_credentials = config.oauth.credentials.is_some(),
        "configuration loaded"
    );
    if config.gateway.api_key.is_none() {
        warn!("MCP_API_KEY not configured: every proxied request will be rejected with 401");
    }

    let store = TokenStore::new(Arc::new(FileBackend::new(config.store.path.clone())));
    if let Some(seed) = config.seed_tokens.take() {
        let seeded = store
            .seed_if_empty(seed)
            .await
            .context("failed to seed token store")?;
        if seeded {
            info!("seeded token store from environment");
        }
    }

    let client = reqwest::Client::new();
    let credentials = config.oauth.credentials.clone();
    let holder = format!("gw_{}", uuid::Uuid::new_v4().as_simple());
    let refresher = RefreshCoordinator::new(
        store.clone(),
        client.clone(),
        credentials.clone(),
        RefreshSettings {
            lease_ttl: config.store.lease_ttl(),
            poll_interval: config.store.poll_interval(),
            request_timeout: config.store.refresh_timeout(),
            ..RefreshSettings::new(holder, config.upstream.token_url.clone())
        },
    );

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        gateway: GatewayState {
            client: client.clone(),
            mcp_url: config.upstream.mcp_url.clone(),
            api_key: config.gateway.api_key.take().map(Arc::new),
            store: store.clone(),
            refresher,
            timeout: Duration::from_secs(config.gateway.timeout_secs),
            max_body_bytes: config.gateway.max_body_bytes,
            metrics: metrics.clone(),
        },
        oauth: OAuthState {
            flows: AuthorizationFlowManager::new(client, config.upstream.endpoints(), store.clone()),
            store,
            credentials: credentials.map(Arc::new),
            public_url: config.gateway.public_url.clone(),
            use_pkce: config.oauth.use_pkce,
            pending: PendingFlows::new(Duration::from_secs(config.oauth.pending_flow_ttl_secs)),
        },
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain deadline starts when the signal fires, not when the server starts.
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
            let remaining = metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: service counters plus whether a token pair is stored.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let (status_code, body) = match state.gateway.store.snapshot().await {
        Ok(snapshot) => (
            StatusCode::OK,
            serde_json::json!({
                "status": if snapshot.is_some() { "healthy" } else { "unconfigured" },
                "token_configured": snapshot.is_some(),
                "token_epoch": snapshot.map(|s| s.epoch),
                "uptime_seconds": uptime,
                "requests_served": requests,
                "errors_total": errors,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "token_configured": false,
                "store_error": e.to_string(),
                "uptime_seconds": uptime,
                "requests_served": requests,
                "errors_total": errors,
            }),
        ),
    };

    (status_code, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Everything that is not a bootstrap or observability GET is proxied.
async fn proxy_handler(
    State(state): State<GatewayState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
