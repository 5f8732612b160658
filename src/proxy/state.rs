use std::sync::Arc;

use dashmap::DashMap;

use crate::models::config::ProxyConfig;
use crate::modules::persistence::store::AccountStore;
use crate::modules::persistence::writer::StoreWriter;
use crate::proxy::balancer::LoadBalancer;
use crate::proxy::classifier::Classifier;
use crate::proxy::forwarder::Forwarder;
use crate::proxy::token_manager::TokenManager;

// An OAuth provisioning flow that has produced an authorize URL and is
// waiting for its callback code.
#[derive(Debug, Clone)]
pub struct PendingOauth {
    pub verifier: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AccountStore>,
    pub writer: Arc<StoreWriter>,
    pub balancer: Arc<LoadBalancer>,
    pub token_manager: Arc<TokenManager>,
    pub forwarder: Arc<Forwarder>,
    pub classifier: Arc<Classifier>,
    pub config: Arc<ProxyConfig>,
    pub oauth_sessions: Arc<DashMap<String, PendingOauth>>,
}
