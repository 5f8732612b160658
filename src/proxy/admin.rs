use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use base64::Engine as _;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::info;

use crate::constants;
use crate::models::account::{Account, AccountSummary, RateLimitOverride, Tier};
use crate::modules::persistence::writer::ResolvedOp;
use crate::modules::system::log_bridge;
use crate::proxy::state::{AppState, PendingOauth};

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

type AdminError = (StatusCode, Json<ErrorResponse>);

fn internal_error(message: impl Into<String>) -> AdminError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> AdminError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn not_found(message: impl Into<String>) -> AdminError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

async fn list_accounts_blocking(state: &AppState) -> Result<Vec<Account>, AdminError> {
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || store.list_accounts())
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)
}

async fn require_account(state: &AppState, id: &str) -> Result<Account, AdminError> {
    let store = state.store.clone();
    let id = id.to_string();
    tokio::task::spawn_blocking(move || store.get_account(&id))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?
        .ok_or_else(|| not_found("account not found"))
}

pub async fn list_accounts(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AdminError> {
    let accounts = list_accounts_blocking(&state).await?;
    let summaries: Vec<AccountSummary> = accounts.iter().map(AccountSummary::from).collect();
    Ok(Json(summaries))
}

pub async fn pause_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<StatusCode, AdminError> {
    let account = require_account(&state, &account_id).await?;
    state.writer.enqueue(ResolvedOp::SetPaused {
        account_id: account.id,
        paused: true,
    });
    info!("Account {} paused", account.name);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<StatusCode, AdminError> {
    let account = require_account(&state, &account_id).await?;
    state.writer.enqueue(ResolvedOp::SetPaused {
        account_id: account.id,
        paused: false,
    });
    info!("Account {} resumed", account.name);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SetTierRequest {
    tier: u8,
}

pub async fn set_tier(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(payload): Json<SetTierRequest>,
) -> Result<StatusCode, AdminError> {
    let tier = Tier::try_from(payload.tier).map_err(bad_request)?;
    let account = require_account(&state, &account_id).await?;
    state.writer.enqueue(ResolvedOp::SetTier {
        account_id: account.id,
        tier,
    });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    name: String,
}

pub async fn rename_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(payload): Json<RenameRequest>,
) -> Result<StatusCode, AdminError> {
    if payload.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let account = require_account(&state, &account_id).await?;
    state.writer.enqueue(ResolvedOp::Rename {
        account_id: account.id,
        name: payload.name,
    });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitOverrideRequest {
    enabled: bool,
    custom_limit: Option<u32>,
    reset_window_minutes: Option<u32>,
}

pub async fn set_rate_limit_override(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(payload): Json<RateLimitOverrideRequest>,
) -> Result<StatusCode, AdminError> {
    let account = require_account(&state, &account_id).await?;
    let override_config = if payload.enabled {
        Some(RateLimitOverride {
            limit: payload.custom_limit.unwrap_or(50),
            window_minutes: payload.reset_window_minutes.unwrap_or(300),
        })
    } else {
        None
    };
    state.writer.enqueue(ResolvedOp::UpdateRateLimitOverride {
        account_id: account.id,
        override_config,
    });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct DeleteConfirmation {
    confirm: String,
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<DeleteConfirmation>,
) -> Result<StatusCode, AdminError> {
    if payload.confirm != name {
        return Err(bad_request(
            "confirmation does not match the account name",
        ));
    }

    let store = state.store.clone();
    let lookup_name = name.clone();
    let account = tokio::task::spawn_blocking(move || store.get_account_by_name(&lookup_name))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?
        .ok_or_else(|| not_found("account not found"))?;

    let store = state.store.clone();
    let delete_name = name.clone();
    let deleted = tokio::task::spawn_blocking(move || store.delete_account_by_name(&delete_name))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found("account not found"));
    }

    state.token_manager.evict(&account.id);
    info!("Account {} removed", name);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RequestsQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(params): Query<RequestsQuery>,
) -> Result<impl IntoResponse, AdminError> {
    let page = params.page.max(1);
    let page_size = params.page_size.clamp(1, 500);
    let offset = (page - 1) * page_size;

    let store = state.store.clone();
    let records = tokio::task::spawn_blocking(move || store.list_requests(page_size, offset))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({
        "page": page,
        "page_size": page_size,
        "items": records,
    })))
}

pub async fn usage_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AdminError> {
    let store = state.store.clone();
    let stats = tokio::task::spawn_blocking(move || store.usage_stats())
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;
    Ok(Json(stats))
}

// Live log lines as SSE. Slow subscribers skip entries instead of stalling
// the tracing pipeline.
pub async fn stream_logs() -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = log_bridge::subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    let data = serde_json::to_string(&entry).unwrap_or_default();
                    return Some((Ok(Event::default().data(data)), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---- Provisioning (narrow contract: outputs populate the accounts table) ----

#[derive(Deserialize)]
pub struct OauthInitRequest {
    name: String,
}

pub async fn oauth_init(
    State(state): State<AppState>,
    Json(payload): Json<OauthInitRequest>,
) -> Result<impl IntoResponse, AdminError> {
    if payload.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }

    // Abandoned flows expire instead of accumulating.
    let cutoff = chrono::Utc::now().timestamp() - 600;
    state.oauth_sessions.retain(|_, pending| pending.created_at >= cutoff);

    let mut verifier_bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut verifier_bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(sha2::Sha256::digest(verifier.as_bytes()));

    let session_id = uuid::Uuid::new_v4().to_string();
    let url = url::Url::parse_with_params(
        constants::OAUTH_AUTHORIZE_URL,
        &[
            ("code", "true"),
            ("client_id", state.config.oauth_client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", constants::OAUTH_REDIRECT_URI),
            ("scope", constants::OAUTH_SCOPES),
            ("state", session_id.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ],
    )
    .map_err(|e| internal_error(format!("failed to build authorize URL: {}", e)))?;

    state.oauth_sessions.insert(
        session_id.clone(),
        PendingOauth {
            verifier,
            created_at: chrono::Utc::now().timestamp(),
        },
    );

    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "url": url.to_string(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthCompleteRequest {
    session_id: String,
    code: String,
    name: String,
    tier: Option<u8>,
}

#[derive(Deserialize)]
struct OauthCodeResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: String,
}

pub async fn oauth_complete(
    State(state): State<AppState>,
    Json(payload): Json<OauthCompleteRequest>,
) -> Result<impl IntoResponse, AdminError> {
    let pending = state
        .oauth_sessions
        .remove(&payload.session_id)
        .map(|(_, v)| v)
        .ok_or_else(|| bad_request("unknown or expired oauth session"))?;

    let tier = Tier::try_from(payload.tier.unwrap_or(1)).map_err(bad_request)?;

    let client = reqwest::Client::new();
    let response = client
        .post(constants::OAUTH_TOKEN_URL)
        .json(&serde_json::json!({
            "grant_type": "authorization_code",
            "code": payload.code,
            "state": payload.session_id,
            "client_id": state.config.oauth_client_id,
            "redirect_uri": constants::OAUTH_REDIRECT_URI,
            "code_verifier": pending.verifier,
        }))
        .send()
        .await
        .map_err(|e| internal_error(format!("code exchange failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(bad_request(format!(
            "code exchange returned {}: {}",
            status, text
        )));
    }

    let tokens: OauthCodeResponse = response
        .json()
        .await
        .map_err(|e| internal_error(format!("invalid token response: {}", e)))?;

    let mut account = Account::new_oauth(payload.name, tier, tokens.refresh_token);
    account.access_token = Some(tokens.access_token);
    account.expires_at = Some(chrono::Utc::now().timestamp() + tokens.expires_in);

    let store = state.store.clone();
    let to_insert = account.clone();
    tokio::task::spawn_blocking(move || store.insert_account(&to_insert))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;

    info!("OAuth account {} provisioned", account.name);
    Ok(Json(AccountSummary::from(&account)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectAccountRequest {
    name: String,
    api_key: String,
    tier: Option<u8>,
    base_url: Option<String>,
}

pub async fn add_direct_account(
    State(state): State<AppState>,
    Json(payload): Json<DirectAccountRequest>,
) -> Result<impl IntoResponse, AdminError> {
    if payload.name.trim().is_empty() || payload.api_key.trim().is_empty() {
        return Err(bad_request("name and apiKey are required"));
    }
    if let Some(base_url) = &payload.base_url {
        if url::Url::parse(base_url).is_err() {
            return Err(bad_request("baseUrl is not a valid URL"));
        }
    }
    let tier = Tier::try_from(payload.tier.unwrap_or(1)).map_err(bad_request)?;

    let account = Account::new_api_key(payload.name, tier, payload.api_key, payload.base_url);
    let store = state.store.clone();
    let to_insert = account.clone();
    tokio::task::spawn_blocking(move || store.insert_account(&to_insert))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;

    info!("API-key account {} provisioned", account.name);
    Ok(Json(AccountSummary::from(&account)))
}
