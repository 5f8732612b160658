use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::models::account::Account;
use crate::modules::persistence::store::UsageRecord;
use crate::modules::persistence::writer::ResolvedOp;
use crate::proxy::classifier::Verdict;
use crate::proxy::errors::{upstream_unavailable_response, TokenError};
use crate::proxy::provider::{self, Credential};
use crate::proxy::state::AppState;
use crate::proxy::{agent, tee, usage};

// Per-request identity carried through the attempt loop.
struct RequestMeta {
    id: String,
    timestamp: i64,
    method: String,
    path: String,
    agent_hint: Option<String>,
}

// Bodies at or below the replay limit are buffered once and replayed across
// failover attempts; larger or unsized bodies stream through and commit the
// request to its first upstream attempt.
enum BodyIntake {
    Empty,
    Buffered(Bytes),
    Streaming(Option<reqwest::Body>),
}

impl BodyIntake {
    fn replayable(&self) -> bool {
        !matches!(self, BodyIntake::Streaming(_))
    }

    fn take(&mut self) -> Option<reqwest::Body> {
        match self {
            BodyIntake::Empty => None,
            BodyIntake::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            BodyIntake::Streaming(body) => body.take(),
        }
    }
}

// Catch-all handler: every path not claimed by the local API is proxied to
// the upstream verbatim.
pub async fn handle_proxy(State(state): State<AppState>, req: Request) -> Response {
    let started = std::time::Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let incoming_headers = parts.headers;

    let mut intake = match read_body(&method, &incoming_headers, body, &state).await {
        Ok(intake) => intake,
        Err(response) => return response,
    };

    let agent_hint = match &intake {
        BodyIntake::Buffered(bytes) => agent::extract_agent_hint(bytes),
        _ => None,
    };
    let meta = RequestMeta {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        method: method.to_string(),
        path: parts.uri.path().to_string(),
        agent_hint,
    };

    let accounts = load_accounts(&state).await;
    let now = chrono::Utc::now().timestamp();
    let candidates = state.balancer.select(&accounts, now);

    if candidates.is_empty() {
        debug!("[{}] No eligible accounts, forwarding unauthenticated", meta.id);
        return passthrough_without_account(
            &state,
            meta,
            method,
            &path_and_query,
            &incoming_headers,
            intake,
            started,
        )
        .await;
    }

    let total = candidates.len();
    let mut attempts: i64 = 0;
    let mut last_error = String::new();

    for (idx, account) in candidates.iter().enumerate() {
        attempts += 1;
        let credential = match state.token_manager.get_valid_access_token(account).await {
            Ok(token) => match account.auth_type {
                crate::models::account::AuthType::ApiKey => Credential::ApiKey(token),
                crate::models::account::AuthType::Oauth => Credential::Bearer(token),
            },
            Err(TokenError::Auth(e)) => {
                warn!("[{}] Account {} auth failed: {}", meta.id, account.name, e);
                last_error = e;
                continue;
            }
            Err(TokenError::Transient(e)) => {
                warn!(
                    "[{}] Account {} transient auth failure: {}",
                    meta.id, account.name, e
                );
                last_error = e;
                continue;
            }
        };

        let url = provider::build_url(
            account.base_url.as_deref(),
            &state.config.upstream_base_url,
            &path_and_query,
        );
        let headers = provider::prepare_headers(&incoming_headers, &credential);
        let body = intake.take();

        let response = match state
            .forwarder
            .forward(method.clone(), &url, headers, body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Upstream call via {} failed: {}", meta.id, account.name, e);
                last_error = e.to_string();
                if intake.replayable() {
                    continue;
                }
                return finalize_no_response(&state, meta, attempts, &last_error, started);
            }
        };

        let status = response.status();
        let now = chrono::Utc::now().timestamp();
        match state
            .classifier
            .classify(account, status, response.headers(), now)
        {
            Verdict::Success => {
                info!(
                    "[{}] {} {} -> {} via {} (attempt {}/{})",
                    meta.id, meta.method, meta.path, status, account.name, attempts, total
                );
                return respond_success(&state, meta, attempts, Some(account), response, started)
                    .await;
            }
            Verdict::Failover(reason) => {
                debug!(
                    "[{}] Attempt {} on {} failed over ({}, status {})",
                    meta.id,
                    attempts,
                    account.name,
                    reason.as_str(),
                    status
                );
                let more_candidates = idx + 1 < total;
                if more_candidates && intake.replayable() {
                    continue;
                }
                // The pool is exhausted (or the body is not replayable):
                // the client gets this upstream response verbatim.
                return respond_passthrough(&state, meta, attempts, Some(account), response, started)
                    .await;
            }
        }
    }

    finalize_no_response(&state, meta, attempts, &last_error, started)
}

async fn read_body(
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    state: &AppState,
) -> Result<BodyIntake, Response> {
    if matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    ) {
        return Ok(BodyIntake::Empty);
    }

    let content_length = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    match content_length {
        Some(0) => Ok(BodyIntake::Empty),
        Some(len) if len <= state.config.replay_buffer_limit_bytes => {
            match axum::body::to_bytes(body, state.config.replay_buffer_limit_bytes).await {
                Ok(bytes) => Ok(BodyIntake::Buffered(bytes)),
                Err(e) => Err(crate::proxy::errors::invalid_request_response(&format!(
                    "failed to read request body: {}",
                    e
                ))),
            }
        }
        // Oversized or unsized: stream through, single attempt only.
        _ => Ok(BodyIntake::Streaming(Some(reqwest::Body::wrap_stream(
            body.into_data_stream(),
        )))),
    }
}

async fn load_accounts(state: &AppState) -> Vec<Account> {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.list_accounts()).await {
        Ok(Ok(accounts)) => accounts,
        Ok(Err(e)) => {
            warn!("Failed to list accounts: {}", e);
            Vec::new()
        }
        Err(e) => {
            warn!("Account listing task failed: {}", e);
            Vec::new()
        }
    }
}

fn copy_response_headers(upstream: &reqwest::Response) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if provider::is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn base_record(meta: &RequestMeta, attempts: i64, account: Option<&Account>, status: u16, started: std::time::Instant) -> UsageRecord {
    UsageRecord {
        request_id: meta.id.clone(),
        account_id: account.map(|a| a.id.clone()),
        method: meta.method.clone(),
        path: meta.path.clone(),
        status,
        timestamp: meta.timestamp,
        duration_ms: started.elapsed().as_millis() as i64,
        attempts,
        input_tokens: None,
        output_tokens: None,
        cost_estimate: None,
        agent: meta.agent_hint.clone(),
        truncated: false,
    }
}

// Success leg: stream through a tee (usage parsed from the captured prefix
// once the stream finishes) or relay the buffered body directly.
async fn respond_success(
    state: &AppState,
    meta: RequestMeta,
    attempts: i64,
    account: Option<&Account>,
    response: reqwest::Response,
    started: std::time::Instant,
) -> Response {
    let status = response.status();
    let headers = copy_response_headers(&response);

    if provider::is_streaming(&headers) {
        let handle = tee::tee(
            response.bytes_stream(),
            state.config.tee_buffer_bytes,
            state.config.tee_keep,
        );

        let writer = state.writer.clone();
        let mut record = base_record(&meta, attempts, account, status.as_u16(), started);
        tokio::spawn(async move {
            if let Ok(captured) = handle.captured.await {
                let parsed = usage::parse_sse_usage(&captured.buffer);
                record.duration_ms = started.elapsed().as_millis() as i64;
                record.input_tokens = parsed.input_tokens;
                record.output_tokens = parsed.output_tokens;
                record.cost_estimate = usage::cost_for(&parsed);
                record.truncated = captured.truncated;
                writer.enqueue(ResolvedOp::InsertUsageRecord { record });
            }
        });

        return build_response(status, headers, handle.body);
    }

    let bytes = match tokio::time::timeout(state.forwarder.body_read_timeout(), response.bytes())
        .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!("[{}] Failed to read upstream body: {}", meta.id, e);
            return upstream_unavailable_response(&format!("upstream body read failed: {}", e));
        }
        Err(_) => {
            warn!("[{}] Upstream body read timed out", meta.id);
            return upstream_unavailable_response("upstream body read timed out");
        }
    };

    let parsed = usage::parse_json_usage(&bytes);
    let mut record = base_record(&meta, attempts, account, status.as_u16(), started);
    record.input_tokens = parsed.input_tokens;
    record.output_tokens = parsed.output_tokens;
    record.cost_estimate = usage::cost_for(&parsed);
    state
        .writer
        .enqueue(ResolvedOp::InsertUsageRecord { record });

    build_response(status, headers, Body::from(bytes))
}

// Failure leg: the final attempt's upstream response is relayed verbatim.
async fn respond_passthrough(
    state: &AppState,
    meta: RequestMeta,
    attempts: i64,
    account: Option<&Account>,
    response: reqwest::Response,
    started: std::time::Instant,
) -> Response {
    let status = response.status();
    let headers = copy_response_headers(&response);
    info!(
        "[{}] {} {} -> {} after {} attempt(s), relaying final upstream response",
        meta.id, meta.method, meta.path, status, attempts
    );

    if provider::is_streaming(&headers) {
        let record = base_record(&meta, attempts, account, status.as_u16(), started);
        state
            .writer
            .enqueue(ResolvedOp::InsertUsageRecord { record });
        return build_response(status, headers, Body::from_stream(response.bytes_stream()));
    }

    let bytes = match tokio::time::timeout(state.forwarder.body_read_timeout(), response.bytes())
        .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!("[{}] Failed to read final upstream body: {}", meta.id, e);
            Bytes::new()
        }
        Err(_) => Bytes::new(),
    };

    let record = base_record(&meta, attempts, account, status.as_u16(), started);
    state
        .writer
        .enqueue(ResolvedOp::InsertUsageRecord { record });

    build_response(status, headers, Body::from(bytes))
}

// No accounts in the pool: forward without credentials and let the upstream
// answer as it sees fit.
async fn passthrough_without_account(
    state: &AppState,
    meta: RequestMeta,
    method: Method,
    path_and_query: &str,
    incoming_headers: &HeaderMap,
    mut intake: BodyIntake,
    started: std::time::Instant,
) -> Response {
    let url = provider::build_url(None, &state.config.upstream_base_url, path_and_query);
    let headers = provider::prepare_headers(incoming_headers, &Credential::None);
    let body = intake.take();

    match state.forwarder.forward(method, &url, headers, body).await {
        Ok(response) => respond_passthrough(state, meta, 0, None, response, started).await,
        Err(e) => finalize_no_response(state, meta, 0, &e.to_string(), started),
    }
}

// Every candidate failed before producing an upstream response.
fn finalize_no_response(
    state: &AppState,
    meta: RequestMeta,
    attempts: i64,
    last_error: &str,
    started: std::time::Instant,
) -> Response {
    warn!(
        "[{}] Request failed with no upstream response after {} attempt(s): {}",
        meta.id, attempts, last_error
    );
    let record = base_record(&meta, attempts, None, 502, started);
    state
        .writer
        .enqueue(ResolvedOp::InsertUsageRecord { record });

    let message = if last_error.is_empty() {
        "no upstream attempt could be completed".to_string()
    } else {
        last_error.to_string()
    };
    upstream_unavailable_response(&message)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::builder().status(status);
    if let Some(header_map) = response.headers_mut() {
        *header_map = headers;
    }
    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
