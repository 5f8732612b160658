use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::account::Account;
use crate::modules::persistence::writer::{ResolvedOp, StoreWriter};
use crate::proxy::errors::TokenError;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

// Produces a valid access token for an account. Refreshes are single-flight
// per account: a short-lived map lock hands out one async mutex per account,
// and only the holder performs the network exchange while concurrent callers
// wait on the same mutex and then reuse the refreshed cache entry.
pub struct TokenManager {
    writer: Arc<StoreWriter>,
    cache: DashMap<String, CachedToken>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    skew_secs: i64,
    refresh_timeout: Duration,
}

impl TokenManager {
    pub fn new(
        writer: Arc<StoreWriter>,
        token_url: String,
        client_id: String,
        skew_secs: u64,
        refresh_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("Failed to create token refresh HTTP client");

        Self {
            writer,
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
            http,
            token_url,
            client_id,
            skew_secs: skew_secs as i64,
            refresh_timeout,
        }
    }

    // Drop in-memory token state for a removed account.
    pub fn evict(&self, account_id: &str) {
        self.cache.remove(account_id);
        self.refresh_locks.remove(account_id);
    }

    pub async fn get_valid_access_token(&self, account: &Account) -> Result<String, TokenError> {
        // API-key accounts need no token lifecycle at all.
        if let Some(key) = account.api_key.as_deref() {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }

        let now = chrono::Utc::now().timestamp();
        if let Some(token) = self.fresh_token(account, now) {
            return Ok(token);
        }

        let lock = self
            .refresh_locks
            .entry(account.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Someone else may have finished the refresh while we waited.
        let now = chrono::Utc::now().timestamp();
        if let Some(token) = self.fresh_token(account, now) {
            return Ok(token);
        }

        let refresh_token = self
            .cache
            .get(&account.id)
            .map(|c| c.refresh_token.clone())
            .or_else(|| account.refresh_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                TokenError::Auth(format!("account {} has no refresh token", account.name))
            })?;

        debug!("Refreshing access token for account {}", account.name);
        let refreshed = self.refresh(&refresh_token).await?;

        let expires_at = chrono::Utc::now().timestamp() + refreshed.expires_in;
        let rotated = refreshed
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty() && *t != refresh_token);
        self.cache.insert(
            account.id.clone(),
            CachedToken {
                access_token: refreshed.access_token.clone(),
                expires_at,
                refresh_token: rotated.clone().unwrap_or(refresh_token),
            },
        );
        self.writer.enqueue(ResolvedOp::UpdateTokens {
            account_id: account.id.clone(),
            access_token: refreshed.access_token.clone(),
            expires_at,
            refresh_token: rotated,
        });
        info!("Access token refreshed for account {}", account.name);

        Ok(refreshed.access_token)
    }

    // A token is fresh while now < expires_at - skew; exactly at the skew
    // boundary the next request triggers a refresh.
    fn fresh_token(&self, account: &Account, now: i64) -> Option<String> {
        if let Some(cached) = self.cache.get(&account.id) {
            if now < cached.expires_at - self.skew_secs {
                return Some(cached.access_token.clone());
            }
            return None;
        }
        let token = account.access_token.as_deref().filter(|t| !t.is_empty())?;
        let expires_at = account.expires_at?;
        if now < expires_at - self.skew_secs {
            Some(token.to_string())
        } else {
            None
        }
    }

    // Sorts exchange failures into the two failover classes: a client-error
    // rejection means the account is unusable until re-authorized, anything
    // network-shaped or server-side is retryable on another account.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, TokenError> {
        let result =
            match tokio::time::timeout(self.refresh_timeout, self.exchange(refresh_token)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("[W-OAUTH-REFRESH-TIMEOUT] token_refresh_timed_out");
                    return Err(TokenError::Transient("refresh timed out".to_string()));
                }
            };

        match result {
            Ok(tokens) => Ok(tokens),
            Err(AppError::Network(ref e)) => {
                warn!("[W-OAUTH-REFRESH-NETWORK] token_refresh_request_failed: {}", e);
                Err(TokenError::Transient(format!(
                    "refresh request failed: {}",
                    e
                )))
            }
            Err(AppError::OAuth(message)) => Err(TokenError::Auth(message)),
            Err(e) => Err(TokenError::Transient(e.to_string())),
        }
    }

    async fn exchange(&self, refresh_token: &str) -> AppResult<TokenResponse> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });

        let response = self.http.post(&self.token_url).json(&body).send().await?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "token endpoint returned {}: {}",
                status, text
            )));
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "token endpoint returned {}",
                status
            )));
        }

        Ok(response.json::<TokenResponse>().await?)
    }
}
