// Upstream endpoints and the handful of protocol constants the proxy injects.
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.anthropic.com";
pub const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const OAUTH_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
pub const OAUTH_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";

// Default OAuth client id for the first-party flow. Overridable in config.
pub const DEFAULT_OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

pub const ANTHROPIC_VERSION_HEADER: &str = "anthropic-version";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const OAUTH_BETA_HEADER_VALUE: &str = "oauth-2025-04-20";

// Unified rate-limit headers reported by the upstream.
pub const RATELIMIT_STATUS_HEADER: &str = "anthropic-ratelimit-unified-status";
pub const RATELIMIT_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";
pub const RATELIMIT_REMAINING_HEADER: &str = "anthropic-ratelimit-unified-remaining";

pub static USER_AGENT: std::sync::LazyLock<String> = std::sync::LazyLock::new(|| {
    format!(
        "hivegate/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
