//! Authorizing Anthropic API relay.
//!
//! Terminates client calls on `PORT`, resolves the caller's API key,
//! enforces their daily points budget, rewrites the request through either
//! the pool-backed OAuth strategy or the `X-Official-Key` bypass, and
//! streams the upstream response straight back while tee'ing SSE bodies to
//! the metering sidecar. A separate router on `ADMIN_PORT` carries OAuth
//! credential bootstrap and pool introspection.

mod admin;
mod config;
mod error;
mod handler;
mod hop;
mod metrics;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use budget::{ApiKeyResolver, BudgetReader};
use credential_pool::{CredentialPool, UserTokenBinder};
use provider::{OAuthPoolProvider, Provider};
use store::Store;
use tokio::net::TcpListener;
use tracing::info;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    common::init_tracing();
    info!("starting relay");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)).map(String::as_str);
    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let recorder_handle = metrics::install_recorder();

    let store = Arc::new(Store::new());
    let http_client = reqwest::Client::new();
    let credential_pool = Arc::new(CredentialPool::new(store.clone(), http_client.clone()));
    let binder = Arc::new(UserTokenBinder::new(credential_pool.clone()));
    let oauth_provider: Arc<dyn Provider> =
        Arc::new(OAuthPoolProvider::new(binder, config.upstream_base_url.clone()));

    let budget = Arc::new(BudgetReader::new(store.clone()));
    let api_keys = Arc::new(ApiKeyResolver::new((*store).clone()));

    let app_state = AppState {
        oauth_provider,
        official_base_url: config.official_base_url.clone(),
        budget,
        api_keys,
        http_client: http_client.clone(),
        billing_enabled: config.billing_enabled,
        billing_service_url: config.billing_service_url.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .fallback(handler::proxy_handler)
        .with_state(app_state);

    let admin_state = AdminState::new(credential_pool, http_client);
    let admin_app = build_admin_router(admin_state).route("/metrics", get(move || render_metrics(recorder_handle.clone())));

    let proxy_listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind relay port {}", config.port))?;
    let admin_listener = TcpListener::bind(("0.0.0.0", config.admin_port))
        .await
        .with_context(|| format!("failed to bind admin port {}", config.admin_port))?;

    info!(port = config.port, admin_port = config.admin_port, "listening");

    let proxy_server = axum::serve(proxy_listener, app).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { proxy_server.await.context("proxy server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> String {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
