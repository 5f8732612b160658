use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tracing::info;

use crate::models::config::{AppConfig, CounterReset};
use crate::modules::persistence::store::AccountStore;
use crate::modules::persistence::writer::{StoreWriter, WriterConfig};
use crate::proxy::{admin, balancer::LoadBalancer, classifier::Classifier, forwarder::Forwarder,
    health, pipeline, state::AppState, token_manager::TokenManager};

pub fn build_state(config: &AppConfig, store: Arc<AccountStore>) -> AppState {
    let proxy = config.proxy.clone();

    let writer = StoreWriter::spawn(
        store.clone(),
        WriterConfig {
            flush_interval: Duration::from_millis(proxy.writer_flush_interval_ms),
            batch_size: proxy.writer_batch_size,
            queue_capacity: proxy.writer_queue_capacity,
            counter_reset: proxy.counter_reset,
        },
    );

    let balancer = Arc::new(LoadBalancer::new(
        writer.clone(),
        proxy.session_ttl_secs,
        proxy.counter_reset == CounterReset::OnLimitClear,
    ));
    let token_manager = Arc::new(TokenManager::new(
        writer.clone(),
        crate::constants::OAUTH_TOKEN_URL.to_string(),
        proxy.oauth_client_id.clone(),
        proxy.token_refresh_skew_secs,
        Duration::from_secs(proxy.token_refresh_timeout_secs),
    ));
    let forwarder = Arc::new(Forwarder::new(&proxy));
    let classifier = Arc::new(Classifier::new(writer.clone(), proxy.session_ttl_secs));

    AppState {
        store,
        writer,
        balancer,
        token_manager,
        forwarder,
        classifier,
        config: Arc::new(proxy),
        oauth_sessions: Arc::new(dashmap::DashMap::new()),
    }
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/accounts", get(admin::list_accounts))
        .route("/accounts/direct", post(admin::add_direct_account))
        .route("/accounts/:id/pause", post(admin::pause_account))
        .route("/accounts/:id/resume", post(admin::resume_account))
        .route("/accounts/:id/tier", post(admin::set_tier))
        .route("/accounts/:id/rename", post(admin::rename_account))
        .route(
            "/accounts/:id/rate-limit",
            post(admin::set_rate_limit_override),
        )
        // The delete route addresses accounts by their unique name.
        .route("/accounts/:id", delete(admin::delete_account))
        .route("/requests", get(admin::list_requests))
        .route("/stats", get(admin::usage_stats))
        .route("/logs/stream", get(admin::stream_logs))
        .route("/oauth/init", post(admin::oauth_init))
        .route("/oauth/complete", post(admin::oauth_complete));

    Router::new()
        .route("/health", get(health::health_check_handler))
        .nest("/api", api_routes)
        .fallback(pipeline::handle_proxy)
        .with_state(state)
}

pub async fn start(
    config: &AppConfig,
    store: Arc<AccountStore>,
) -> Result<(AppState, tokio::task::JoinHandle<()>), String> {
    let state = build_state(config, store);
    let app = build_router(state.clone());

    let addr = format!("127.0.0.1:{}", config.proxy.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Address {} binding failed: {}", addr, e))?;

    info!("Proxy server started at http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Proxy server terminated: {}", e);
        }
    });

    Ok((state, handle))
}
