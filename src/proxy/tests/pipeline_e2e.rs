use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use crate::models::account::{Account, Tier};
use crate::models::config::AppConfig;
use crate::modules::persistence::store::{AccountStore, UsageRecord};
use crate::proxy::server;

// Spins up the full proxy (router + writer + balancer) against the given
// upstream base URL and returns its local address.
async fn start_proxy(
    upstream_base: String,
    store: Arc<AccountStore>,
) -> (String, crate::proxy::AppState, tokio::task::JoinHandle<()>) {
    let mut config = AppConfig::default();
    config.proxy.upstream_base_url = upstream_base;
    config.proxy.writer_flush_interval_ms = 20;

    let state = server::build_state(&config, store);
    let app = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state, handle)
}

async fn start_upstream(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

fn api_key_account(name: &str, key: &str, tier: Tier) -> Account {
    Account::new_api_key(name.to_string(), tier, key.to_string(), None)
}

// Polls until exactly the expected usage records have been flushed.
async fn wait_for_records(store: &Arc<AccountStore>, count: usize) -> Vec<UsageRecord> {
    for _ in 0..100 {
        let records = store.list_requests(50, 0).unwrap();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("expected {} usage records, found fewer in time", count);
}

#[tokio::test]
async fn test_single_account_happy_path() {
    let response_body = serde_json::json!({
        "id": "msg_ok",
        "model": "claude-sonnet-4-20250514",
        "content": [{"type": "text", "text": "x".repeat(1024)}],
        "usage": {"input_tokens": 120, "output_tokens": 256},
    })
    .to_string();
    let upstream_body = response_body.clone();

    let seen_headers: Arc<AsyncMutex<Vec<(String, String)>>> = Arc::default();
    let captured = seen_headers.clone();
    let upstream = Router::new().route(
        "/v1/messages",
        post(move |headers: HeaderMap| {
            let captured = captured.clone();
            let body = upstream_body.clone();
            async move {
                let mut out = Vec::new();
                for (name, value) in &headers {
                    out.push((
                        name.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    ));
                }
                *captured.lock().await = out;
                ([("content-type", "application/json")], body)
            }
        }),
    );
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    let account = api_key_account("solo", "sk-solo", Tier::Pro);
    store.insert_account(&account).unwrap();
    let (proxy_base, _state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/messages", proxy_base))
        .header("content-type", "application/json")
        .header("x-api-key", "sk-client-should-be-stripped")
        .body(r#"{"model":"claude-sonnet-4-20250514","messages":[]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, response_body);

    // The pool credential replaced the client's, hop-by-hop headers dropped.
    let headers = seen_headers.lock().await.clone();
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    assert_eq!(find("x-api-key").as_deref(), Some("sk-solo"));
    assert!(find("authorization").is_none());

    let records = wait_for_records(&store, 1).await;
    assert_eq!(records[0].account_id.as_deref(), Some(account.id.as_str()));
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].input_tokens, Some(120));
    assert_eq!(records[0].output_tokens, Some(256));

    // Only the serving account's counters moved.
    for _ in 0..100 {
        if store.get_account(&account.id).unwrap().unwrap().total_requests == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(
        store.get_account(&account.id).unwrap().unwrap().total_requests,
        1
    );

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_failover_on_529_reaches_second_account() {
    let upstream = Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap| async move {
            let key = headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if key == "sk-a" {
                Response::builder()
                    .status(StatusCode::from_u16(529).unwrap())
                    .body(Body::from(r#"{"error":{"type":"overloaded_error"}}"#))
                    .unwrap()
            } else {
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"msg_b","usage":{"input_tokens":1,"output_tokens":1}}"#))
                    .unwrap()
            }
        }),
    );
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    // Ids sort a < b so the tie-break makes "a" the first candidate.
    let mut first = api_key_account("first", "sk-a", Tier::Pro);
    first.id = "a-first".to_string();
    let mut second = api_key_account("second", "sk-b", Tier::Pro);
    second.id = "b-second".to_string();
    store.insert_account(&first).unwrap();
    store.insert_account(&second).unwrap();

    let (proxy_base, _state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy_base))
        .body(r#"{"model":"m","messages":[]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("msg_b"));

    let records = wait_for_records(&store, 1).await;
    assert_eq!(records[0].attempts, 2);
    assert_eq!(records[0].account_id.as_deref(), Some("b-second"));

    // A plain 529 never marks the failing account.
    let first_loaded = store.get_account("a-first").unwrap().unwrap();
    assert_eq!(first_loaded.rate_limit_reset_at, None);
    assert_eq!(first_loaded.total_requests, 0);

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_rate_limit_mark_excludes_account_from_selection() {
    let reset_at = chrono::Utc::now().timestamp() + 600;
    let upstream = Router::new().route(
        "/v1/messages",
        post(move || async move {
            Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .header(crate::constants::RATELIMIT_STATUS_HEADER, "rejected")
                .header(crate::constants::RATELIMIT_RESET_HEADER, reset_at.to_string())
                .body(Body::from(r#"{"error":{"type":"rate_limit_error"}}"#))
                .unwrap()
        }),
    );
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    let account = api_key_account("limited", "sk-l", Tier::Pro);
    store.insert_account(&account).unwrap();
    let (proxy_base, state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy_base))
        .body("{}")
        .send()
        .await
        .unwrap();
    // Sole account: the 429 is relayed to the client verbatim.
    assert_eq!(response.status(), 429);

    // The mark lands within a flush interval (±1s of the header value).
    let mut marked = None;
    for _ in 0..100 {
        marked = store.get_account(&account.id).unwrap().unwrap().rate_limit_reset_at;
        if marked.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let marked = marked.expect("rate limit mark should be persisted");
    assert!((marked - reset_at).abs() <= 1);

    // Selection now excludes the account until the reset passes.
    let accounts = store.list_accounts().unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!(state.balancer.select(&accounts, now).is_empty());

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_all_accounts_fail_returns_last_upstream_response() {
    let upstream = Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":{"type":"api_error","message":"upstream exploded"}}"#,
            )
        }),
    );
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    for name in ["a", "b", "c"] {
        store
            .insert_account(&api_key_account(name, &format!("sk-{}", name), Tier::Pro))
            .unwrap();
    }
    let (proxy_base, _state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy_base))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert!(response.text().await.unwrap().contains("upstream exploded"));

    let records = wait_for_records(&store, 1).await;
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].status, 500);

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_buffered_body_replays_identically_across_attempts() {
    #[derive(Clone, Default)]
    struct SeenBodies(Arc<AsyncMutex<Vec<Bytes>>>);

    async fn failing_then_ok(
        State(seen): State<SeenBodies>,
        body: Bytes,
    ) -> Response {
        let mut bodies = seen.0.lock().await;
        bodies.push(body);
        if bodies.len() < 3 {
            (StatusCode::INTERNAL_SERVER_ERROR, "try the next one").into_response()
        } else {
            (
                StatusCode::OK,
                [("content-type", "application/json")],
                r#"{"id":"msg_final"}"#,
            )
                .into_response()
        }
    }

    let seen = SeenBodies::default();
    let upstream = Router::new()
        .route("/v1/messages", post(failing_then_ok))
        .with_state(seen.clone());
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    for name in ["a", "b", "c"] {
        store
            .insert_account(&api_key_account(name, &format!("sk-{}", name), Tier::Pro))
            .unwrap();
    }
    let (proxy_base, _state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let payload = format!(
        r#"{{"model":"m","messages":[{{"role":"user","content":"{}"}}]}}"#,
        "y".repeat(2000)
    );
    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy_base))
        .header("content-type", "application/json")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let bodies = seen.0.lock().await;
    assert_eq!(bodies.len(), 3);
    for body in bodies.iter() {
        assert_eq!(body.as_ref(), payload.as_bytes());
    }

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_streaming_response_passes_through_and_records_usage() {
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":40}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    let upstream = Router::new().route(
        "/v1/messages",
        post(move || async move {
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(Body::from(sse_body))
                .unwrap()
        }),
    );
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    let account = api_key_account("streamer", "sk-s", Tier::Pro);
    store.insert_account(&account).unwrap();
    let (proxy_base, _state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy_base))
        .body(r#"{"stream":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .starts_with("text/event-stream"));

    let streamed = response.text().await.unwrap();
    assert_eq!(streamed, sse_body);

    let records = wait_for_records(&store, 1).await;
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].input_tokens, Some(40));
    assert_eq!(records[0].output_tokens, Some(9));
    assert!(!records[0].truncated);

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_empty_pool_forwards_unauthenticated() {
    let upstream = Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap| async move {
            assert!(headers.get("x-api-key").is_none());
            assert!(headers.get("authorization").is_none());
            (
                StatusCode::UNAUTHORIZED,
                r#"{"error":{"type":"authentication_error"}}"#,
            )
        }),
    );
    let (upstream_base, upstream_handle) = start_upstream(upstream).await;

    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    let (proxy_base, _state, proxy_handle) = start_proxy(upstream_base, store.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/messages", proxy_base))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let records = wait_for_records(&store, 1).await;
    assert_eq!(records[0].account_id, None);
    assert_eq!(records[0].status, 401);

    upstream_handle.abort();
    proxy_handle.abort();
}

#[tokio::test]
async fn test_health_and_admin_surface() {
    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    store
        .insert_account(&api_key_account("admin-target", "sk-t", Tier::Pro))
        .unwrap();
    let (proxy_base, _state, proxy_handle) =
        start_proxy("http://127.0.0.1:1".to_string(), store.clone()).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", proxy_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let accounts: serde_json::Value = client
        .get(format!("{}/api/accounts", proxy_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = accounts.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert!(list[0].get("api_key").is_none(), "credentials must be redacted");
    let account_id = list[0]["id"].as_str().unwrap().to_string();

    // Pause propagates through the writer.
    let status = client
        .post(format!("{}/api/accounts/{}/pause", proxy_base, account_id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 204);
    for _ in 0..100 {
        if store.get_account(&account_id).unwrap().unwrap().paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(store.get_account(&account_id).unwrap().unwrap().paused);

    // Tier update with an invalid value is rejected.
    let status = client
        .post(format!("{}/api/accounts/{}/tier", proxy_base, account_id))
        .json(&serde_json::json!({"tier": 7}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 400);

    // Delete requires a matching confirmation.
    let status = client
        .delete(format!("{}/api/accounts/admin-target", proxy_base))
        .json(&serde_json::json!({"confirm": "wrong"}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 400);
    let status = client
        .delete(format!("{}/api/accounts/admin-target", proxy_base))
        .json(&serde_json::json!({"confirm": "admin-target"}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 204);
    assert!(store.get_account_by_name("admin-target").unwrap().is_none());

    proxy_handle.abort();
}

#[tokio::test]
async fn test_direct_account_provisioning_populates_store() {
    let store = Arc::new(AccountStore::open_in_memory().unwrap());
    let (proxy_base, _state, proxy_handle) =
        start_proxy("http://127.0.0.1:1".to_string(), store.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/accounts/direct", proxy_base))
        .json(&serde_json::json!({
            "name": "direct-1",
            "apiKey": "sk-direct",
            "tier": 20,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let account = store.get_account_by_name("direct-1").unwrap().unwrap();
    assert_eq!(account.tier, Tier::Max20);
    assert_eq!(account.api_key.as_deref(), Some("sk-direct"));

    proxy_handle.abort();
}
