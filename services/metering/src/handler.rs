//! `POST /` ingestion: validate the tee'd request, parse the SSE body, and
//! enqueue it for the batch writer. Enqueueing never blocks on a store
//! write, matching the relay's requirement that the tee never slow down or
//! fail the client response it was copied from.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use metering::PendingUsage;
use serde_json::json;
use tracing::warn;

use crate::metrics;
use crate::state::AppState;

pub async fn ingest(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let Some(user_email) = header_value(&headers, "x-user-id") else {
        metrics::record_ingested("rejected");
        return bad_request("missing X-User-ID header");
    };
    let Some(account_uuid) = header_value(&headers, "x-upstream-account-uuid") else {
        metrics::record_ingested("rejected");
        return bad_request("missing X-Upstream-Account-UUID header");
    };
    let request_id = header_value(&headers, "x-request-id");

    let trimmed = body.trim_start();
    if !(trimmed.starts_with("event:") || trimmed.starts_with("data:")) {
        metrics::record_ingested("rejected");
        return bad_request("Only SSE streams are supported for billing");
    }

    let parsed = match metering::parse_usage(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(user_email, account_uuid, request_id, error = %e, "failed to parse SSE usage");
            metrics::record_ingested("rejected");
            return bad_request(&e.to_string());
        }
    };

    state
        .batch_writer
        .enqueue(PendingUsage { user_email, account_uuid, request_id, parsed, timestamp: Utc::now() })
        .await;

    metrics::record_ingested("success");
    (StatusCode::OK, axum::Json(json!({"status": "success"}))).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string).filter(|s| !s.is_empty())
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, axum::Json(json!({"error": message}))).into_response()
}
