//! Metering sidecar.
//!
//! Receives the relay's SSE tee as `POST /`, prices and batches it into the
//! hourly/minute aggregates the budget reader and admin dashboards read.
//! `metering verify <user_email> <hour>` runs the standalone drift check
//! against a fresh, empty store — see `crates/metering::verify` doc comment
//! for why this is a structural demonstration rather than a tool you'd run
//! against a live deployment's store in this in-process implementation.

mod config;
mod error;
mod handler;
mod metrics;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use store::Store;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    common::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("verify") {
        return run_verify(&args[2..]);
    }

    info!("starting metering");
    let cli_config_path = args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)).map(String::as_str);
    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let recorder_handle = metrics::install_recorder();

    let store = Arc::new(Store::new());
    let (batch_writer, flush_handle) = metering::BatchWriter::spawn(store);
    let app_state = AppState { batch_writer: batch_writer.clone() };

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(move || render_metrics(recorder_handle.clone())))
        .route("/", post(handler::ingest))
        .with_state(app_state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind metering port {}", config.port))?;

    info!(port = config.port, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;

    batch_writer.shutdown();
    flush_handle.await.context("batch writer flush task panicked")?;
    info!("shutdown complete");
    Ok(())
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> String {
    handle.render()
}

fn run_verify(args: &[String]) -> Result<()> {
    let [user_email, hour] = args else {
        anyhow::bail!("usage: metering verify <user_email> <hour:%Y-%m-%dT%H>");
    };

    let store = Store::new();
    let report = metering::verify_hour(&store, user_email, hour);
    println!("{}", serde_json::to_string_pretty(&json_report(&report))?);
    if !report.is_consistent() {
        anyhow::bail!("drift detected for {user_email} {hour}");
    }
    Ok(())
}

fn json_report(report: &metering::DriftReport) -> serde_json::Value {
    serde_json::json!({
        "user_email": report.user_email,
        "hour": report.hour,
        "records_examined": report.records_examined,
        "recomputed_requests": report.recomputed_requests,
        "recomputed_points": report.recomputed_points,
        "stored_requests": report.stored_requests,
        "stored_points": report.stored_points,
        "consistent": report.is_consistent(),
    })
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
