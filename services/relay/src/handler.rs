//! The relay's single catch-all handler (spec §4.2): client auth, budget
//! gate, credential selection, request rewrite, streamed proxy with a tee to
//! the metering sidecar, and the upstream error tap.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use provider::{ErrorClassification, OfficialKeyProvider, Provider};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::hop::is_hop_by_hop;
use crate::metrics;
use crate::state::AppState;

const UNAUTHORIZED_BODY: &str = "[AFL] Unauthorized";
const BUDGET_EXCEEDED_BODY: &str = "[AFL] Reached daily limit. Resets at 4am UTC+8.";
const TOKEN_OVERLOADED_BODY: &str = "[AFL] Token overloaded";

pub async fn proxy_handler(State(state): State<AppState>, mut request: Request<Body>) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    let response = handle(&state, &mut request, &request_id).await;
    metrics::record_request(response.status().as_u16(), &method, start.elapsed().as_secs_f64());
    response
}

async fn handle(state: &AppState, request: &mut Request<Body>, request_id: &str) -> Response {
    let Some(api_key) = bearer_token(request.headers()) else {
        return plain(StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY);
    };

    let user_email = match state.api_keys.resolve(&api_key) {
        Ok(Some(email)) => email,
        Ok(None) => return plain(StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY),
        Err(e) => {
            warn!(error = %e, "api key resolution failed");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let remaining = match state.budget.check_remaining(&user_email).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, user_email, "budget check failed");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    if remaining <= 0 {
        return plain(StatusCode::TOO_MANY_REQUESTS, BUDGET_EXCEEDED_BODY);
    }

    let official_key = request
        .headers()
        .get("x-official-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let provider: Arc<dyn Provider> = match &official_key {
        Some(key) => Arc::new(OfficialKeyProvider::new(state.official_base_url.clone(), key.clone())),
        None => state.oauth_provider.clone(),
    };

    let mut upstream_headers = request.headers().clone();
    let prepared = match provider.prepare_request(&user_email, &mut upstream_headers).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, user_email, "credential selection failed");
            return plain(StatusCode::SERVICE_UNAVAILABLE, TOKEN_OVERLOADED_BODY);
        }
    };

    strip_for_upstream(&mut upstream_headers);

    let target_url = format!(
        "{}{}",
        prepared.upstream_base_url,
        request.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
    );

    let body = std::mem::replace(request.body_mut(), Body::empty());
    let upstream_request = state
        .http_client
        .request(request.method().clone(), &target_url)
        .headers(upstream_headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream_response = match upstream_request.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, user_email, url = %target_url, "upstream request failed");
            metrics::record_upstream_error("connect");
            return plain(StatusCode::BAD_GATEWAY, "[AFL] Upstream unavailable");
        }
    };

    let status = upstream_response.status();
    let is_sse = upstream_response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if matches!(status.as_u16(), 429 | 401 | 403) {
        let classification = provider.classify_error(status.as_u16(), "");
        metrics::record_upstream_error(match classification {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::Unauthorized => "unauthorized",
            ErrorClassification::Transient => "transient",
        });
        if let Err(e) = provider
            .report_error(&prepared.credential_id, &user_email, classification)
            .await
        {
            warn!(error = %e, user_email, "failed to report upstream error to provider");
        }
    }

    let mut response_builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream_response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response_builder = response_builder.header(name, value);
    }

    let tee_url = (state.billing_enabled && is_sse)
        .then(|| state.billing_service_url.clone())
        .flatten();

    let client_body = match tee_url {
        Some(metering_url) => tee_and_stream(
            upstream_response,
            state.http_client.clone(),
            metering_url,
            user_email,
            prepared.upstream_account_uuid,
            request_id.to_string(),
        ),
        None => Body::from_stream(upstream_response.bytes_stream()),
    };

    match response_builder.body(client_body) {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "failed to build proxied response");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Split the upstream response into two sinks: bytes flow to the client
/// immediately over `rx`, and are also accumulated in memory so that once
/// the stream ends, the full body can be tee'd to the metering sidecar in a
/// detached task. The client never waits on the metering POST; a failing or
/// slow sidecar only delays the (already-detached) tee, never the response.
fn tee_and_stream(
    upstream_response: reqwest::Response,
    http_client: reqwest::Client,
    metering_url: String,
    user_email: String,
    upstream_account_uuid: Option<String>,
    request_id: String,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);

    tokio::spawn(async move {
        let mut upstream_stream = upstream_response.bytes_stream();
        let mut buffer = Vec::new();
        loop {
            match upstream_stream.next().await {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream stream read failed");
                    let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))).await;
                    break;
                }
                None => break,
            }
        }
        drop(tx);

        let Some(account_uuid) = upstream_account_uuid else {
            return;
        };
        if buffer.is_empty() {
            return;
        }

        if let Err(e) = http_client
            .post(&metering_url)
            .header("X-User-ID", &user_email)
            .header("X-Upstream-Account-UUID", &account_uuid)
            .header("X-Request-Id", &request_id)
            .body(buffer)
            .send()
            .await
        {
            warn!(error = %e, user_email, account_uuid, "metering tee failed, dropping");
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

fn strip_for_upstream(headers: &mut HeaderMap) {
    headers.remove("x-official-key");
    headers.remove(axum::http::header::HOST);
    headers.remove("x-forwarded-for");
    let hop: Vec<HeaderName> = headers
        .iter()
        .filter(|(name, _)| is_hop_by_hop(name.as_str()))
        .map(|(name, _)| name.clone())
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}
