//! Anthropic OAuth constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets — they identify the public client application. The actual
//! secrets (access/refresh tokens) live in the document store, not here.

/// Anthropic's public OAuth client ID (same as Claude CLI).
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// OAuth redirect URI (Anthropic's hosted callback page).
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Token endpoint for code exchange and token refresh.
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Authorization endpoint for Pro/Max subscriptions (claude.ai, not console).
pub const AUTHORIZE_ENDPOINT: &str = "https://claude.ai/oauth/authorize";

/// OAuth scopes required for inference access.
pub const SCOPES: &str = "user:profile user:inference user:sessions:claude_code";

/// `anthropic-beta` header value the relay must include on every upstream
/// request made with an OAuth access token.
pub const OAUTH_BETA_HEADER_VALUE: &str = "oauth-2025-04-20";
