use serde::{Deserialize, Serialize};

// Policy for resetting the since-last-reset request counter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterReset {
    // Clear when a rate limit expires for the account.
    OnLimitClear,
    // Clear on the local day boundary.
    Daily,
}

impl Default for CounterReset {
    fn default() -> Self {
        Self::OnLimitClear
    }
}

// Which end of a teed stream the accounting buffer retains once full.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeeKeep {
    Head,
    Tail,
}

impl Default for TeeKeep {
    fn default() -> Self {
        Self::Head
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub upstream_base_url: String,
    pub oauth_client_id: String,
    // Session stickiness window in seconds.
    pub session_ttl_secs: u64,
    // Access tokens are refreshed this many seconds before expiry.
    pub token_refresh_skew_secs: u64,
    pub tee_buffer_bytes: usize,
    pub tee_keep: TeeKeep,
    pub writer_flush_interval_ms: u64,
    pub writer_batch_size: usize,
    pub writer_queue_capacity: usize,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub token_refresh_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub counter_reset: CounterReset,
    // Maximum request body size buffered for failover replay.
    pub replay_buffer_limit_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8790,
            upstream_base_url: crate::constants::DEFAULT_UPSTREAM_BASE_URL.to_string(),
            oauth_client_id: crate::constants::DEFAULT_OAUTH_CLIENT_ID.to_string(),
            session_ttl_secs: 5 * 60 * 60,
            token_refresh_skew_secs: 60,
            tee_buffer_bytes: 256 * 1024,
            tee_keep: TeeKeep::default(),
            writer_flush_interval_ms: 100,
            writer_batch_size: 64,
            writer_queue_capacity: 4096,
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            idle_timeout_secs: 60,
            token_refresh_timeout_secs: 30,
            shutdown_grace_secs: 5,
            counter_reset: CounterReset::default(),
            replay_buffer_limit_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let proxy = &config.proxy;

    if proxy.port == 0 {
        errors.push("proxy.port must be non-zero".to_string());
    }
    if proxy.upstream_base_url.is_empty()
        || url::Url::parse(&proxy.upstream_base_url).is_err()
    {
        errors.push(format!(
            "proxy.upstream_base_url is not a valid URL: {}",
            proxy.upstream_base_url
        ));
    }
    if proxy.oauth_client_id.trim().is_empty() {
        errors.push("proxy.oauth_client_id must not be empty".to_string());
    }
    if proxy.writer_batch_size == 0 {
        errors.push("proxy.writer_batch_size must be at least 1".to_string());
    }
    if proxy.writer_queue_capacity < proxy.writer_batch_size {
        errors.push("proxy.writer_queue_capacity must be >= writer_batch_size".to_string());
    }
    if proxy.tee_buffer_bytes == 0 {
        errors.push("proxy.tee_buffer_bytes must be non-zero".to_string());
    }
    if proxy.session_ttl_secs == 0 {
        errors.push("proxy.session_ttl_secs must be non-zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
