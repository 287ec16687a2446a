//! OAuth token exchange and refresh
//!
//! Both operations POST JSON to `TOKEN_ENDPOINT` (Anthropic's console, not
//! the inference API) with different grant types. The upstream issuer
//! expects the exact header set a Claude CLI-style client sends; deviating
//! (e.g. form-encoding the body) gets a 4xx from the issuer in practice, so
//! this mirrors the wire shape precisely rather than using reqwest's usual
//! ergonomic defaults.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{ANTHROPIC_CLIENT_ID, REDIRECT_URI, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

const USER_AGENT: &str = "axios/1.8.4";

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    code_verifier: &'a str,
    client_id: &'a str,
    redirect_uri: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrganizationInfo {
    uuid: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    uuid: String,
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    #[allow(dead_code)]
    token_type: String,
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    scope: String,
    organization: OrganizationInfo,
    account: AccountInfo,
}

/// Everything the credential pool needs to persist after a successful
/// exchange or refresh, flattened out of the issuer's nested response shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute). The
    /// caller converts this to an absolute timestamp when persisting.
    pub expires_in: u64,
    pub scope: String,
    pub organization_uuid: String,
    pub organization_name: String,
    pub account_uuid: String,
    pub account_email: String,
}

impl From<RawTokenResponse> for TokenResponse {
    fn from(raw: RawTokenResponse) -> Self {
        Self {
            access_token: raw.access_token,
            refresh_token: raw.refresh_token,
            expires_in: raw.expires_in,
            scope: raw.scope,
            organization_uuid: raw.organization.uuid,
            organization_name: raw.organization.name,
            account_uuid: raw.account.uuid,
            account_email: raw.account.email_address,
        }
    }
}

async fn post_token_request(client: &reqwest::Client, body: impl Serialize) -> Result<reqwest::Response> {
    client
        .post(TOKEN_ENDPOINT)
        .header("Accept", "application/json, text/plain, */*")
        .header("Content-Type", "application/json")
        .header("User-Agent", USER_AGENT)
        .header("Connection", "close")
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token endpoint request failed: {e}")))
}

/// Exchange an authorization code for tokens (admin OAuth bootstrap flow).
pub async fn exchange_code(client: &reqwest::Client, code: &str, verifier: &str) -> Result<TokenResponse> {
    let response = post_token_request(
        client,
        ExchangeRequest {
            grant_type: "authorization_code",
            code,
            code_verifier: verifier,
            client_id: ANTHROPIC_CLIENT_ID,
            redirect_uri: REDIRECT_URI,
        },
    )
    .await?;

    parse_response(response, |status, body| {
        Error::TokenExchange(format!("token endpoint returned {status}: {body}"))
    })
    .await
}

/// Refresh an access token using a refresh token.
///
/// Called under contention by the credential pool: the caller is expected
/// to hold a per-credential lock (or store transaction) across this call so
/// concurrent requests for the same account collapse into one refresh.
pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<TokenResponse> {
    let response = post_token_request(
        client,
        RefreshRequest {
            grant_type: "refresh_token",
            refresh_token: refresh,
            client_id: ANTHROPIC_CLIENT_ID,
        },
    )
    .await?;

    parse_response(response, |status, body| {
        if status == 401 || status == 403 {
            Error::InvalidCredentials(format!("refresh token rejected ({status}): {body}"))
        } else {
            Error::TokenExchange(format!("token refresh returned {status}: {body}"))
        }
    })
    .await
}

async fn parse_response(
    response: reqwest::Response,
    on_error: impl FnOnce(u16, String) -> Error,
) -> Result<TokenResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_else(|_| String::from("<no body>"));
        warn!(status = status.as_u16(), "token endpoint returned an error response");
        return Err(on_error(status.as_u16(), body));
    }

    let raw: RawTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;
    Ok(raw.into())
}
