//! Admin API for OAuth credential bootstrap and pool introspection.
//!
//! Runs on a separate listener port from the proxy router so it can be kept
//! off any public ingress. Endpoints:
//! - GET  /admin/accounts                    — list accounts with status
//! - GET  /admin/pool                        — pool health summary
//! - POST /admin/credentials/init-oauth      — start PKCE flow, return auth URL
//! - POST /admin/credentials/complete-oauth  — exchange code, store credential
//! - POST /admin/api-keys                    — bind a new api_key to a user_email

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use credential_pool::CredentialPool;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

const PKCE_EXPIRY_SECS: u64 = 600;

struct PkceState {
    verifier: String,
    created_at: Instant,
}

#[derive(Clone)]
pub struct AdminState {
    pool: Arc<CredentialPool>,
    http_client: reqwest::Client,
    pkce_states: Arc<Mutex<HashMap<String, PkceState>>>,
}

impl AdminState {
    pub fn new(pool: Arc<CredentialPool>, http_client: reqwest::Client) -> Self {
        Self {
            pool,
            http_client,
            pkce_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/pool", get(pool_status))
        .route("/admin/credentials/init-oauth", post(init_oauth))
        .route("/admin/credentials/complete-oauth", post(complete_oauth))
        .route("/admin/api-keys", post(create_api_key_binding))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string())
}

/// GET /admin/accounts — never exposes tokens, just id + status.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = state.pool.account_statuses();
    json_response(StatusCode::OK, json!({ "accounts": accounts }))
}

/// GET /admin/pool — same summary shape the relay's `/health` embeds.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.pool.health().await)
}

/// POST /admin/credentials/init-oauth — generate a PKCE pair, return the
/// authorization URL the operator opens in a browser.
async fn init_oauth(State(state): State<AdminState>) -> impl IntoResponse {
    let account_id = format!("acct-{}", uuid::Uuid::new_v4().as_simple());

    let verifier = oauth_client::generate_verifier();
    let challenge = oauth_client::compute_challenge(&verifier);
    let authorization_url = oauth_client::build_authorization_url(&account_id, &challenge);

    let mut states = state.pkce_states.lock().await;
    states.retain(|_, s| s.created_at.elapsed().as_secs() < PKCE_EXPIRY_SECS);
    states.insert(account_id.clone(), PkceState { verifier, created_at: Instant::now() });

    info!(account_id, "PKCE flow initiated");

    json_response(
        StatusCode::OK,
        json!({
            "authorization_url": authorization_url,
            "account_id": account_id,
        }),
    )
}

#[derive(Deserialize)]
struct CreateApiKeyBindingRequest {
    user_email: String,
    api_key: String,
}

/// POST /admin/api-keys — bind `api_key` to `user_email`, enforcing the
/// at-most-3-live-bindings-per-user invariant. The bearer `api_key` value
/// itself is generated by the caller (the billing/ops side that owns user
/// account provisioning); this route only records the binding.
async fn create_api_key_binding(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CreateApiKeyBindingRequest>,
) -> impl IntoResponse {
    match budget::apikey::create_binding(state.pool.store(), &body.user_email, &body.api_key).await {
        Ok(()) => {
            info!(user_email = body.user_email, "api key binding created");
            json_response(StatusCode::CREATED, json!({"user_email": body.user_email, "status": "bound"}))
        }
        Err(budget::Error::Store(store::Error::PreconditionFailed(reason))) => {
            json_response(StatusCode::BAD_REQUEST, json!({"error": reason}))
        }
        Err(budget::Error::Store(store::Error::TransactionAborted(reason))) => {
            json_response(StatusCode::CONFLICT, json!({"error": reason}))
        }
        Err(e) => {
            warn!(user_email = body.user_email, error = %e, "failed to create api key binding");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()}))
        }
    }
}

#[derive(Deserialize)]
struct CompleteOAuthRequest {
    account_id: String,
    code: String,
}

/// POST /admin/credentials/complete-oauth — exchange the callback code for
/// tokens and seed the credential pool with the result.
async fn complete_oauth(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CompleteOAuthRequest>,
) -> impl IntoResponse {
    let pkce_state = {
        let mut states = state.pkce_states.lock().await;
        states.remove(&body.account_id)
    };

    let Some(pkce_state) = pkce_state else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "no pending OAuth flow for this account_id (expired or not initiated)"}),
        );
    };

    if pkce_state.created_at.elapsed() > Duration::from_secs(PKCE_EXPIRY_SECS) {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "PKCE state expired, re-initiate with init-oauth"}),
        );
    }

    let authorization_code = body.code.split('#').next().unwrap_or(&body.code);

    let token = match oauth_client::exchange_code(&state.http_client, authorization_code, &pkce_state.verifier).await
    {
        Ok(t) => t,
        Err(e) => {
            warn!(account_id = body.account_id, error = %e, "token exchange failed");
            return json_response(StatusCode::BAD_GATEWAY, json!({"error": format!("token exchange failed: {e}")}));
        }
    };

    let now_millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let expires_at = now_millis + token.expires_in * 1000;

    let credential = json!({
        "access_token": token.access_token,
        "refresh_token": token.refresh_token,
        "expires_at": expires_at,
        "scope": token.scope,
        "organization_uuid": token.organization_uuid,
        "organization_name": token.organization_name,
        "account_email": token.account_email,
        "rate_limit_headers": null,
    });

    if let Err(e) = state.pool.put_credential(&token.account_uuid, credential).await {
        warn!(account_uuid = token.account_uuid, error = %e, "failed to store credential");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": format!("failed to store credential: {e}")}),
        );
    }

    info!(account_uuid = token.account_uuid, "OAuth flow completed, account added to pool");

    json_response(StatusCode::OK, json!({"account_uuid": token.account_uuid, "status": "added"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use store::Store;
    use tower::ServiceExt;

    fn test_state() -> AdminState {
        let store = Arc::new(Store::new());
        let pool = Arc::new(CredentialPool::new(store, reqwest::Client::new()));
        AdminState::new(pool, reqwest::Client::new())
    }

    #[tokio::test]
    async fn list_accounts_is_empty_for_a_fresh_pool() {
        let app = build_admin_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accounts"], json!([]));
    }

    #[tokio::test]
    async fn pool_status_reports_unhealthy_with_no_accounts() {
        let app = build_admin_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/admin/pool").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["accounts_total"], 0);
    }

    #[tokio::test]
    async fn init_oauth_returns_an_authorization_url_and_account_id() {
        let app = build_admin_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/credentials/init-oauth")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert!(json["authorization_url"].as_str().unwrap().starts_with("https://"));
        assert!(json["account_id"].as_str().unwrap().starts_with("acct-"));
    }

    #[tokio::test]
    async fn create_api_key_binding_for_an_enabled_user_succeeds() {
        let state = test_state();
        state.pool.store().set("users", "a@x.io", json!({"api_enabled": true})).await.unwrap();
        let app = build_admin_router(state);

        let body = serde_json::to_vec(&json!({"user_email": "a@x.io", "api_key": "k1"})).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/api-keys")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn create_api_key_binding_for_a_disabled_user_is_rejected() {
        let state = test_state();
        state.pool.store().set("users", "a@x.io", json!({"api_enabled": false})).await.unwrap();
        let app = build_admin_router(state);

        let body = serde_json::to_vec(&json!({"user_email": "a@x.io", "api_key": "k1"})).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/api-keys")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn a_fourth_api_key_binding_is_rejected_with_conflict() {
        let state = test_state();
        state.pool.store().set("users", "a@x.io", json!({"api_enabled": true})).await.unwrap();
        let app = build_admin_router(state);

        for api_key in ["k1", "k2", "k3"] {
            let body = serde_json::to_vec(&json!({"user_email": "a@x.io", "api_key": api_key})).unwrap();
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/admin/api-keys")
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let body = serde_json::to_vec(&json!({"user_email": "a@x.io", "api_key": "k4"})).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/api-keys")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn complete_oauth_without_init_is_rejected() {
        let app = build_admin_router(test_state());
        let body = serde_json::to_vec(&json!({"account_id": "ghost", "code": "abc"})).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/credentials/complete-oauth")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
